//! Materializes a function's layers into one content-addressed directory.
//!
//! The directory name is a digest of the ordered layer list, so a second run
//! with the same list reuses the directory without fetching anything. Each
//! layer resolves concurrently into its own scratch directory; once every
//! layer has settled, the successful ones are merged in list order so a later
//! layer overwrites an earlier one on overlapping paths. A layer that cannot
//! be resolved is reported in [`LayerResolution::skipped`] and contributes
//! nothing. When a skip may go away on retry (fetch, copy or unpack
//! failures) the merged tree is handed back unpublished and the next
//! resolution starts over.

mod local;
mod remote;

use crate::error::{Result, RunnerError};
use crate::options::{LayerReference, LayerSource, ServiceLayer};
use crate::registry::LayerRegistry;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

pub use remote::format_bytes;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

static KEY_LOCKS: Lazy<Mutex<HashMap<PathBuf, KeyLock>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Why a layer contributed nothing to the merged directory.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipReason {
    #[error("layer is not defined in the service")]
    UnknownLocalLayer,
    #[error("layer is not compatible with {runtime} runtime")]
    Incompatible { runtime: String },
    #[error("failed to fetch layer: {message}")]
    FetchFailed { message: String },
    #[error("failed to copy layer: {message}")]
    CopyFailed { message: String },
    #[error("failed to unpack layer: {message}")]
    UnpackFailed { message: String },
}

impl SkipReason {
    /// Whether a later attempt with the same inputs could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SkipReason::FetchFailed { .. }
                | SkipReason::CopyFailed { .. }
                | SkipReason::UnpackFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedLayer {
    pub layer: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerResolution {
    pub key: String,
    pub dir: PathBuf,
    pub cache_hit: bool,
    /// False when `dir` is a one-off tree outside the cache; its owner removes it.
    pub published: bool,
    pub skipped: Vec<SkippedLayer>,
}

impl LayerResolution {
    fn cached(key: String, dir: PathBuf) -> Self {
        Self {
            key,
            dir,
            cache_hit: true,
            published: true,
            skipped: Vec::new(),
        }
    }
}

/// Digest of the ordered layer list. Reordering the list changes the key.
pub fn layer_cache_key(layers: &[LayerReference]) -> Result<String> {
    let serialized = serde_json::to_vec(layers).map_err(|err| RunnerError::Io {
        message: format!("Failed to serialize layer list: {}", err),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    Ok(hex::encode(hasher.finalize()))
}

pub struct LayerMaterializer {
    registry: Arc<dyn LayerRegistry>,
    http: reqwest::Client,
    service_layers: BTreeMap<String, ServiceLayer>,
    service_path: PathBuf,
}

impl LayerMaterializer {
    pub fn new(
        registry: Arc<dyn LayerRegistry>,
        http: reqwest::Client,
        service_layers: BTreeMap<String, ServiceLayer>,
        service_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            http,
            service_layers,
            service_path: service_path.into(),
        }
    }

    #[instrument(skip(self, layers), fields(layers = layers.len()))]
    pub async fn resolve(
        &self,
        layers: &[LayerReference],
        runtime: &str,
        target_root: &Path,
    ) -> Result<LayerResolution> {
        let key = layer_cache_key(layers)?;
        let target = target_root.join(&key);

        if target.exists() {
            info!(dir = %target.display(), "Layers already exist for this function. Skipping download.");
            return Ok(LayerResolution::cached(key, target));
        }

        let lock = key_lock(&target);
        let resolution = {
            let _guard = lock.lock().await;
            self.materialize(layers, runtime, target_root, key, target.clone())
                .await
        };
        release_key_lock(&target, lock);
        resolution
    }

    async fn materialize(
        &self,
        layers: &[LayerReference],
        runtime: &str,
        target_root: &Path,
        key: String,
        target: PathBuf,
    ) -> Result<LayerResolution> {
        // Another resolver may have published while we waited.
        if target.exists() {
            info!(dir = %target.display(), "Layers were materialized concurrently. Skipping download.");
            return Ok(LayerResolution::cached(key, target));
        }

        tokio::fs::create_dir_all(target_root)
            .await
            .map_err(|err| {
                RunnerError::io(
                    format!("Failed to create layers directory {}", target_root.display()),
                    err,
                )
            })?;
        let scratch_dir = |prefix: String| {
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempdir_in(target_root)
                .map_err(|err| {
                    RunnerError::io(
                        format!("Failed to create staging directory in {}", target_root.display()),
                        err,
                    )
                })
        };
        let staging = scratch_dir(format!(".{}.", key))?;
        let layer_dirs = (0..layers.len())
            .map(|index| scratch_dir(format!(".{}.layer-{}.", key, index)))
            .collect::<Result<Vec<TempDir>>>()?;

        info!(dir = %target.display(), "Storing layers");
        let outcomes = join_all(
            layers
                .iter()
                .zip(&layer_dirs)
                .map(|(layer, dir)| self.resolve_one(layer, runtime, dir.path(), target_root)),
        )
        .await;

        let contributions: Vec<PathBuf> = layer_dirs
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(dir, _)| dir.path().to_path_buf())
            .collect();
        let merged = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            contributions
                .iter()
                .try_for_each(|source| merge_tree(source, &merged))
        })
        .await
        .map_err(|err| RunnerError::Io {
            message: format!("Layer merge task failed: {}", err),
        })?
        .map_err(|err| RunnerError::io("Failed to merge layers", err))?;
        drop(layer_dirs);

        let skipped: Vec<SkippedLayer> = layers
            .iter()
            .zip(outcomes)
            .filter_map(|(layer, outcome)| {
                outcome.err().map(|reason| SkippedLayer {
                    layer: layer.label().to_string(),
                    reason,
                })
            })
            .collect();

        if skipped.iter().any(|skip| skip.reason.is_transient()) {
            let dir = staging.into_path();
            warn!(
                dir = %dir.display(),
                "Some layers failed to materialize; using them for this start only. They will be retried next time."
            );
            return Ok(LayerResolution {
                key,
                dir,
                cache_hit: false,
                published: false,
                skipped,
            });
        }

        publish(staging, &target)?;

        Ok(LayerResolution {
            key,
            dir: target,
            cache_hit: false,
            published: true,
            skipped,
        })
    }

    async fn resolve_one(
        &self,
        layer: &LayerReference,
        runtime: &str,
        staging: &Path,
        scratch: &Path,
    ) -> std::result::Result<(), SkipReason> {
        let outcome = match layer.source() {
            LayerSource::Remote { arn, name } => {
                remote::download_layer(
                    self.registry.as_ref(),
                    &self.http,
                    arn,
                    name,
                    runtime,
                    staging,
                    scratch,
                )
                .await
            }
            LayerSource::Local { name } => {
                local::copy_local_layer(
                    &self.service_layers,
                    &self.service_path,
                    name,
                    runtime,
                    staging,
                )
                .await
            }
        };

        if let Err(reason) = &outcome {
            warn!(layer = %layer.label(), %reason, "Skipping layer");
        }
        outcome
    }
}

/// Removes a directory returned with `published == false`. Cached directories are left alone.
pub async fn release_unpublished(resolution: &LayerResolution) {
    if resolution.published {
        return;
    }
    debug!(dir = %resolution.dir.display(), "Removing unpublished layers");
    if let Err(err) = tokio::fs::remove_dir_all(&resolution.dir).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(dir = %resolution.dir.display(), error = %err, "Failed to remove unpublished layers");
        }
    }
}

fn key_lock(target: &Path) -> KeyLock {
    let mut locks = KEY_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(target.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Drops the map entry for `target` unless another resolver still holds a handle to it.
fn release_key_lock(target: &Path, lock: KeyLock) {
    let mut locks = KEY_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // One reference lives in the map, the other is `lock`.
    if Arc::strong_count(&lock) <= 2 {
        locks.remove(target);
    }
}

/// Moves every entry of `source` into `target`, replacing files that already exist there.
fn merge_tree(source: &Path, target: &Path) -> io::Result<()> {
    let entries = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            if destination.is_file() {
                fs::remove_file(&destination)?;
            }
            fs::create_dir_all(&destination)?;
            continue;
        }
        if destination.is_dir() {
            fs::remove_dir_all(&destination)?;
        }
        fs::rename(entry.path(), &destination)?;
    }
    Ok(())
}

/// Moves the staged tree to `target`. Losing a rename race to another process is not an error.
fn publish(staging: TempDir, target: &Path) -> Result<()> {
    let staged = staging.into_path();
    match fs::rename(&staged, target) {
        Ok(()) => Ok(()),
        Err(_) if target.exists() => {
            if let Err(err) = fs::remove_dir_all(&staged) {
                warn!(dir = %staged.display(), error = %err, "Failed to remove duplicate staging directory");
            }
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_dir_all(&staged) {
                warn!(dir = %staged.display(), error = %cleanup, "Failed to remove staging directory");
            }
            Err(RunnerError::io(
                format!("Failed to move layers into {}", target.display()),
                err,
            ))
        }
    }
}
