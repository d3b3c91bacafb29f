use crate::engine::ContainerEngine;
use crate::error::{Result, RunnerError};
use tracing::{debug, info, instrument};

const IMAGE_REGISTRY: &str = "public.ecr.aws/lambda";

/// Runtime identifiers with an emulation image, mapped to `<repository>:<tag>`.
pub const RUNTIME_IMAGES: &[(&str, &str)] = &[
    ("go1.x", "go:1"),
    ("java8", "java:8"),
    ("java8.al2", "java:8.al2"),
    ("java11", "java:11"),
    ("java17", "java:17"),
    ("nodejs14.x", "nodejs:14"),
    ("nodejs16.x", "nodejs:16"),
    ("nodejs18.x", "nodejs:18"),
    ("nodejs20.x", "nodejs:20"),
    ("provided.al2", "provided:al2"),
    ("provided.al2023", "provided:al2023"),
    ("python3.7", "python:3.7"),
    ("python3.8", "python:3.8"),
    ("python3.9", "python:3.9"),
    ("python3.10", "python:3.10"),
    ("python3.11", "python:3.11"),
    ("ruby2.7", "ruby:2.7"),
    ("ruby3.2", "ruby:3.2"),
];

pub fn supports_runtime(runtime: &str) -> bool {
    RUNTIME_IMAGES.iter().any(|(id, _)| *id == runtime)
}

/// A pullable image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    reference: String,
}

impl ImageHandle {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    pub fn for_runtime(runtime: &str) -> Result<Self> {
        RUNTIME_IMAGES
            .iter()
            .find(|(id, _)| *id == runtime)
            .map(|(_, image)| Self::new(format!("{}/{}", IMAGE_REGISTRY, image)))
            .ok_or_else(|| RunnerError::UnsupportedRuntime {
                runtime: runtime.to_string(),
            })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Pulls the image unless the engine already has it locally.
    #[instrument(skip(self, engine), fields(image = %self.reference))]
    pub async fn ensure_present(&self, engine: &dyn ContainerEngine) -> Result<()> {
        let exists = engine
            .image_exists(&self.reference)
            .await
            .map_err(|source| RunnerError::PullFailed {
                image: self.reference.clone(),
                source,
            })?;
        if exists {
            debug!("image already present locally");
            return Ok(());
        }

        info!("pulling image {}", self.reference);
        engine
            .pull(&self.reference)
            .await
            .map_err(|source| RunnerError::PullFailed {
                image: self.reference.clone(),
                source,
            })
    }
}
