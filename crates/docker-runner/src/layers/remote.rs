use super::SkipReason;
use crate::options::runtime_allowed;
use crate::registry::LayerRegistry;
use futures_util::StreamExt;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use zip::ZipArchive;

const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

pub(super) async fn download_layer(
    registry: &dyn LayerRegistry,
    http: &reqwest::Client,
    arn: &str,
    name: &str,
    runtime: &str,
    target: &Path,
    scratch: &Path,
) -> Result<(), SkipReason> {
    let span = info_span!("layer", layer = name);
    async move {
        debug!(arn, "ARN");
        info!("Retrieving \"{}\": Getting info", name);

        let version = registry
            .layer_version(arn)
            .await
            .map_err(|err| SkipReason::FetchFailed {
                message: err.to_string(),
            })?;

        if !runtime_allowed(version.compatible_runtimes.as_deref(), runtime) {
            return Err(SkipReason::Incompatible {
                runtime: runtime.to_string(),
            });
        }

        info!(
            "Retrieving \"{}\": Downloading {}",
            name,
            format_bytes(version.content.code_size)
        );
        let archive = fetch_archive(http, &version.content.location, scratch).await?;

        info!("Retrieving \"{}\": Unzipping to .layers directory", name);
        let target = target.to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || {
            let unpacked = unpack_archive(archive.path(), &target);
            debug!("Removing zip file");
            if let Err(err) = archive.close() {
                warn!(error = %err, "Failed to remove layer archive");
            }
            unpacked
        })
        .await
        .map_err(|err| SkipReason::UnpackFailed {
            message: err.to_string(),
        })?
        .map_err(|err| SkipReason::UnpackFailed {
            message: err.to_string(),
        })?;

        debug!(files = unpacked, "Done");
        Ok::<_, SkipReason>(())
    }
    .instrument(span)
    .await
}

/// Streams the archive at `location` into a temporary file under `scratch`.
async fn fetch_archive(
    http: &reqwest::Client,
    location: &str,
    scratch: &Path,
) -> Result<tempfile::NamedTempFile, SkipReason> {
    let fetch_failed = |message: String| SkipReason::FetchFailed { message };

    let response = http
        .get(location)
        .send()
        .await
        .map_err(|err| fetch_failed(format!("Failed to fetch from {}: {}", location, err)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fetch_failed(format!(
            "Failed to fetch from {} with {}",
            location, status
        )));
    }

    let archive = tempfile::Builder::new()
        .prefix(".layer-")
        .suffix(".zip")
        .tempfile_in(scratch)
        .map_err(|err| fetch_failed(format!("Failed to create archive file: {}", err)))?;
    let handle = archive
        .reopen()
        .map_err(|err| fetch_failed(format!("Failed to open archive file: {}", err)))?;
    let mut file = tokio::fs::File::from_std(handle);

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|err| fetch_failed(format!("Failed to read {}: {}", location, err)))?;
        file.write_all(&chunk)
            .await
            .map_err(|err| fetch_failed(format!("Failed to write archive: {}", err)))?;
    }
    file.flush()
        .await
        .map_err(|err| fetch_failed(format!("Failed to write archive: {}", err)))?;

    Ok(archive)
}

/// Extracts every file entry of a zip archive under `target`, keeping unix permission bits.
pub(super) fn unpack_archive(archive: &Path, target: &Path) -> io::Result<usize> {
    let file = File::open(archive)?;
    let mut zip =
        ZipArchive::new(file).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if entry.is_dir() || entry.name().ends_with('/') {
            continue;
        }

        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!(entry = entry.name(), "Skipping archive entry outside the layer root");
                continue;
            }
        };

        let destination = target.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&destination)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&destination, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        written += 1;
    }
    Ok(written)
}

/// Human-readable size, e.g. `1536` -> `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut exponent = 0;
    let mut scaled = bytes;
    while scaled >= 1024 && exponent < UNITS.len() - 1 {
        scaled /= 1024;
        exponent += 1;
    }
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[exponent])
}
