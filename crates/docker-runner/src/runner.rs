use crate::container::DockerContainer;
use crate::engine::ContainerEngine;
use crate::error::{Result, RunnerError};
use crate::options::{translate_host_path, DockerOptions, FunctionOptions};
use crate::registry::LayerRegistry;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Runs invocations of one function inside a reusable container.
///
/// The container is created on the first [`DockerRunner::run`] and serves every
/// later invocation until [`DockerRunner::cleanup`].
pub struct DockerRunner {
    engine: Arc<dyn ContainerEngine>,
    function: FunctionOptions,
    options: DockerOptions,
    registry: Option<Arc<dyn LayerRegistry>>,
    code_dir: PathBuf,
    container: Option<DockerContainer>,
}

impl DockerRunner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        function: FunctionOptions,
        options: DockerOptions,
    ) -> Self {
        let code_dir = translate_host_path(
            &function.code_dir,
            &function.service_path,
            options.host_service_path.as_deref(),
        );

        Self {
            engine,
            function,
            options,
            registry: None,
            code_dir,
            container: None,
        }
    }

    pub fn with_layer_registry(mut self, registry: Arc<dyn LayerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Code directory as mounted into the container.
    pub fn code_dir(&self) -> &Path {
        &self.code_dir
    }

    pub fn container(&self) -> Option<&DockerContainer> {
        self.container.as_ref()
    }

    #[instrument(skip(self, event), fields(function = %self.function.function_key))]
    pub async fn run(&mut self, event: &JsonValue) -> Result<JsonValue> {
        self.engine
            .check_available()
            .await
            .map_err(RunnerError::EngineUnavailable)?;

        let container = match self.container.take() {
            Some(container) => container,
            None => self.build_container()?,
        };
        let container = self.container.insert(container);

        if !container.is_running() {
            debug!(code_dir = %self.code_dir.display(), "Starting container");
            container.start(&self.code_dir).await?;
        }

        container.request(event).await
    }

    fn build_container(&self) -> Result<DockerContainer> {
        let container = DockerContainer::new(
            self.engine.clone(),
            self.function.clone(),
            self.options.clone(),
        )?;
        Ok(match &self.registry {
            Some(registry) => container.with_layer_registry(registry.clone()),
            None => container,
        })
    }

    /// Stops the container if one was ever created. Safe to call repeatedly.
    pub async fn cleanup(&mut self) -> Result<()> {
        match self.container.as_mut() {
            Some(container) => container.stop().await,
            None => Ok(()),
        }
    }
}
