//! Lifecycle of the one container that backs a function.

use crate::engine::{ContainerEngine, OutputLines};
use crate::error::{Result, RunnerError};
use crate::image::ImageHandle;
use crate::launch::{LaunchSpec, Mount};
use crate::layers::{release_unpublished, LayerMaterializer, LayerResolution};
use crate::options::{translate_host_path, DockerOptions, FunctionOptions};
use crate::registry::{HttpLayerRegistry, LayerRegistry};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub const INVOCATION_PORT: u16 = 8080;
pub const INVOCATION_PATH: &str = "2015-03-31/functions/function/invocations";
pub const TASK_DIR: &str = "/var/task";
pub const LAYER_DIR: &str = "/opt";
pub const HOST_ALIAS: &str = "host.docker.internal";
pub const BOOTSTRAP_MARKER: &str = "exec '/var/runtime/bootstrap' (cwd=/var/task, handler=)";

const RUNTIME_ENV: [(&str, &str); 3] = [
    ("PROTOCOL_BUFFERS_PYTHON_IMPLEMENTATION", "python"),
    ("DOCKER_LAMBDA_STAY_OPEN", "1"),
    ("DOCKER_LAMBDA_WATCH", "1"),
];

// `docker port` may list the same mapping once per address family.
static PORT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^8080/tcp -> (.*):(\d+)$").unwrap());

/// Where a container is in its lifecycle. Identifier and port exist only while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Idle,
    Starting,
    Running { id: String, port: u16 },
    Stopped,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running { .. })
    }
}

pub struct DockerContainer {
    engine: Arc<dyn ContainerEngine>,
    function: FunctionOptions,
    options: DockerOptions,
    image: ImageHandle,
    registry: Option<Arc<dyn LayerRegistry>>,
    http: reqwest::Client,
    state: ContainerState,
    last_layers: Option<LayerResolution>,
}

impl DockerContainer {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        function: FunctionOptions,
        options: DockerOptions,
    ) -> Result<Self> {
        let image = match &function.image {
            Some(reference) => ImageHandle::new(reference.clone()),
            None => ImageHandle::for_runtime(&function.runtime)?,
        };

        Ok(Self {
            engine,
            function,
            options,
            image,
            registry: None,
            http: reqwest::Client::new(),
            state: ContainerState::Idle,
            last_layers: None,
        })
    }

    /// Replaces the registry used to resolve published layers.
    pub fn with_layer_registry(mut self, registry: Arc<dyn LayerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn image(&self) -> &ImageHandle {
        &self.image
    }

    /// Outcome of the layer materialization performed by the last start.
    pub fn layers(&self) -> Option<&LayerResolution> {
        self.last_layers.as_ref()
    }

    #[instrument(skip(self, code_dir), fields(function = %self.function.function_key))]
    pub async fn start(&mut self, code_dir: &Path) -> Result<()> {
        self.state = ContainerState::Starting;
        match self.launch(code_dir).await {
            Ok((id, port)) => {
                info!(container = %id, port, "Container is ready");
                self.state = ContainerState::Running { id, port };
                Ok(())
            }
            Err(err) => {
                self.state = ContainerState::Idle;
                self.release_layers().await;
                Err(err)
            }
        }
    }

    async fn launch(&mut self, code_dir: &Path) -> Result<(String, u16)> {
        self.image.ensure_present(self.engine.as_ref()).await?;

        debug!("Run Docker container...");
        let spec = self.launch_spec(code_dir).await?;
        let id = self.engine.create(&spec).await?;
        debug!(container = %id, "Created container");

        if let Err(err) = self.await_ready(&id).await {
            self.discard(&id).await;
            return Err(err);
        }

        match self.discover_port(&id).await {
            Ok(port) => Ok((id, port)),
            Err(err) => {
                self.discard(&id).await;
                Err(err)
            }
        }
    }

    /// Builds the create configuration, materializing layers on the way.
    pub async fn launch_spec(&mut self, code_dir: &Path) -> Result<LaunchSpec> {
        let mut spec = LaunchSpec::new(self.image.reference());
        spec.command = vec![self.function.handler.clone()];
        spec.mounts.push(Mount {
            source: code_dir.to_path_buf(),
            target: TASK_DIR.to_string(),
            read_only: self.options.read_only,
        });
        spec.published_ports.push(INVOCATION_PORT);
        for (key, value) in RUNTIME_ENV {
            spec.push_env(key, value);
        }

        if !self.function.layers.is_empty() {
            debug!("Found layers, checking provider type");
            if self.function.provider.supports_layers() {
                let layer_dir = self.materialize_layers().await?;
                spec.mounts.push(Mount {
                    source: layer_dir,
                    target: LAYER_DIR.to_string(),
                    read_only: true,
                });
            } else {
                warn!(
                    provider = %self.function.provider.name,
                    "Provider {} is Unsupported. Layers are only supported on aws.",
                    self.function.provider.name
                );
            }
        }

        for (key, value) in &self.function.environment {
            spec.push_env(key.clone(), value.clone());
        }

        if self.options.platform.needs_host_alias() {
            match self.engine.bridge_gateway().await {
                Ok(gateway) if !gateway.is_empty() => {
                    spec.extra_hosts.insert(HOST_ALIAS.to_string(), gateway);
                }
                Ok(_) => warn!("Bridge network reported no gateway; {} will not resolve", HOST_ALIAS),
                Err(err) => warn!(error = %err, "Failed to resolve bridge gateway; {} will not resolve", HOST_ALIAS),
            }
        }

        spec.network = self.options.network.clone();
        Ok(spec)
    }

    async fn materialize_layers(&mut self) -> Result<PathBuf> {
        let root = self.options.layers_root(&self.function.service_path);
        let registry = self.layer_registry()?;
        let materializer = LayerMaterializer::new(
            registry,
            self.http.clone(),
            self.function.service_layers.clone(),
            self.function.service_path.clone(),
        );

        let resolution = materializer
            .resolve(&self.function.layers, &self.function.runtime, &root)
            .await?;
        let dir = translate_host_path(
            &resolution.dir,
            &self.function.service_path,
            self.options.host_service_path.as_deref(),
        );
        let dir = if dir.is_relative() {
            std::env::current_dir()
                .map_err(|err| RunnerError::io("Failed to resolve working directory", err))?
                .join(dir)
        } else {
            dir
        };
        self.last_layers = Some(resolution);
        Ok(dir)
    }

    fn layer_registry(&self) -> Result<Arc<dyn LayerRegistry>> {
        if let Some(registry) = &self.registry {
            return Ok(registry.clone());
        }

        let registry =
            HttpLayerRegistry::for_function(self.http.clone(), &self.function, &self.options)
                .map_err(|err| RunnerError::Io {
                    message: err.to_string(),
                })?;
        Ok(Arc::new(registry))
    }

    /// Removes a layer tree that was only good for the last start.
    async fn release_layers(&self) {
        if let Some(layers) = &self.last_layers {
            release_unpublished(layers).await;
        }
    }

    async fn await_ready(&self, id: &str) -> Result<()> {
        let output = self.engine.start(id).await?;
        let timeout = self.options.startup_timeout;

        match tokio::time::timeout(timeout, wait_for_marker(output, id)).await {
            Ok(Ok(rest)) => {
                forward_output(rest, id.to_string());
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RunnerError::StartupTimeout {
                container: id.to_string(),
                timeout,
            }),
        }
    }

    async fn discover_port(&self, id: &str) -> Result<u16> {
        let output = self.engine.port(id).await?;
        parse_port_output(&output).ok_or_else(|| RunnerError::PortDiscoveryFailed {
            container: id.to_string(),
            internal_port: INVOCATION_PORT,
            output,
        })
    }

    /// Best-effort removal of a container that never became ready.
    async fn discard(&self, id: &str) {
        if let Err(err) = self.engine.stop(id).await {
            warn!(container = %id, error = %err, "Failed to stop container after failed start");
        }
        if let Err(err) = self.engine.remove(id).await {
            warn!(container = %id, error = %err, "Failed to remove container after failed start");
        }
    }

    pub fn invocation_url(&self) -> Option<String> {
        match &self.state {
            ContainerState::Running { port, .. } => Some(format!(
                "http://{}:{}/{}",
                self.options.gateway_address, port, INVOCATION_PATH
            )),
            _ => None,
        }
    }

    /// Sends one event to the invocation endpoint and returns the JSON body as-is.
    pub async fn request(&self, event: &JsonValue) -> Result<JsonValue> {
        let url = self.invocation_url().ok_or(RunnerError::NotRunning)?;

        let response = self
            .http
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|err| RunnerError::InvocationTransport {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::InvocationTransport {
                message: format!("Failed to fetch from {} with {}", url, status),
                url,
            });
        }

        response
            .json()
            .await
            .map_err(|err| RunnerError::InvalidResponse {
                url,
                message: err.to_string(),
            })
    }

    #[instrument(skip(self), fields(function = %self.function.function_key))]
    pub async fn stop(&mut self) -> Result<()> {
        let id = match &self.state {
            ContainerState::Running { id, .. } => id.clone(),
            _ => return Ok(()),
        };

        let result = async {
            self.engine.stop(&id).await?;
            self.engine.remove(&id).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(container = %id, "Container removed");
                self.state = ContainerState::Stopped;
                self.release_layers().await;
                Ok(())
            }
            Err(source) => {
                error!(container = %id, error = %source, "Failed to tear down container");
                Err(RunnerError::TeardownFailed {
                    container: id,
                    source,
                })
            }
        }
    }
}

/// Consumes output until the bootstrap marker line and hands back the rest of the stream.
async fn wait_for_marker(mut output: OutputLines, id: &str) -> Result<OutputLines> {
    while let Some(line) = output.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(container = %id, error = %err, "Dropping undecodable container output");
                continue;
            }
            Err(err) => {
                return Err(RunnerError::StartupFailed {
                    container: id.to_string(),
                    message: err.to_string(),
                })
            }
        };
        debug!(target: "docker_runner::container_output", container = %id, "{}", line);
        if line.contains(BOOTSTRAP_MARKER) {
            return Ok(output);
        }
    }

    Err(RunnerError::StartupFailed {
        container: id.to_string(),
        message: "container output ended before the runtime reported ready".to_string(),
    })
}

/// Keeps draining container output into the log after startup.
fn forward_output(mut output: OutputLines, id: String) {
    tokio::spawn(async move {
        while let Some(line) = output.next().await {
            match line {
                Ok(line) => debug!(target: "docker_runner::container_output", container = %id, "{}", line),
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(container = %id, error = %err, "Dropping undecodable container output");
                }
                Err(err) => {
                    debug!(container = %id, error = %err, "Container output closed");
                    break;
                }
            }
        }
    });
}

/// Host port mapped to the invocation port; the first matching line wins.
pub fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| PORT_LINE.captures(line.trim()))
        .find_map(|captures| captures.get(2)?.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_port_line_wins() {
        let output = "8080/tcp -> 0.0.0.0:49153\n8080/tcp -> :::49153";
        assert_eq!(parse_port_output(output), Some(49153));

        let output = "8080/tcp -> 0.0.0.0:49160\n8080/tcp -> :::49161";
        assert_eq!(parse_port_output(output), Some(49160));
    }

    #[test]
    fn unrelated_port_lines_are_ignored() {
        assert_eq!(parse_port_output("443/tcp -> 0.0.0.0:1234"), None);
        assert_eq!(parse_port_output(""), None);
        assert_eq!(
            parse_port_output("443/tcp -> 0.0.0.0:1234\n8080/tcp -> [::]:5000"),
            Some(5000)
        );
    }

    #[test]
    fn only_running_state_reports_running() {
        assert!(!ContainerState::Idle.is_running());
        assert!(!ContainerState::Starting.is_running());
        assert!(!ContainerState::Stopped.is_running());
        assert!(ContainerState::Running {
            id: "abc".to_string(),
            port: 1
        }
        .is_running());
    }

    #[tokio::test]
    async fn marker_wait_returns_remaining_output() {
        let lines: Vec<std::io::Result<String>> = vec![
            Ok("START RequestId".to_string()),
            Ok(format!("time=\"...\" msg=\"{}\"", BOOTSTRAP_MARKER)),
            Ok("after".to_string()),
        ];
        let stream = futures_util::stream::iter(lines).boxed();
        let mut rest = wait_for_marker(stream, "abc").await.unwrap();
        assert_eq!(rest.next().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn marker_wait_skips_undecodable_lines() {
        let lines: Vec<std::io::Result<String>> = vec![
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )),
            Ok(BOOTSTRAP_MARKER.to_string()),
            Ok("after".to_string()),
        ];
        let stream = futures_util::stream::iter(lines).boxed();
        let mut rest = wait_for_marker(stream, "abc").await.unwrap();
        assert_eq!(rest.next().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn marker_wait_fails_when_output_ends() {
        let lines: Vec<std::io::Result<String>> = vec![Ok("booting".to_string())];
        let stream = futures_util::stream::iter(lines).boxed();
        let err = wait_for_marker(stream, "abc").await.err().expect("expected error");
        assert!(matches!(err, RunnerError::StartupFailed { .. }));
    }

    #[tokio::test]
    async fn marker_wait_fails_on_stream_error() {
        let lines: Vec<std::io::Result<String>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "engine went away",
        ))];
        let stream = futures_util::stream::iter(lines).boxed();
        let err = wait_for_marker(stream, "abc").await.err().expect("expected error");
        assert!(err.to_string().contains("engine went away"));
    }
}
