use super::SkipReason;
use crate::options::ServiceLayer;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub(super) async fn copy_local_layer(
    service_layers: &BTreeMap<String, ServiceLayer>,
    service_path: &Path,
    name: &str,
    runtime: &str,
    target: &Path,
) -> Result<(), SkipReason> {
    let layer = service_layers
        .get(name)
        .ok_or(SkipReason::UnknownLocalLayer)?;

    let source = if layer.path.is_absolute() {
        layer.path.clone()
    } else {
        service_path.join(&layer.path)
    };
    debug!(layer = name, location = %source.display(), "Resolved local layer");

    if !layer.supports(runtime) {
        return Err(SkipReason::Incompatible {
            runtime: runtime.to_string(),
        });
    }

    info!(layer = name, "Copying data from {} to {}", source.display(), target.display());
    let target = target.to_path_buf();
    let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
        .await
        .map_err(|err| SkipReason::CopyFailed {
            message: err.to_string(),
        })?
        .map_err(|err| SkipReason::CopyFailed {
            message: err.to_string(),
        })?;

    debug!(layer = name, files = copied, "Done");
    Ok(())
}

/// Recursively copies the contents of `source` into `target`, returning the number of files.
pub(super) fn copy_tree(source: &Path, target: &Path) -> io::Result<usize> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("layer directory {} does not exist", source.display()),
        ));
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let destination: PathBuf = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}
