//! Command-line and environment configuration for the container engine.

use clap::{ArgAction, Args};
use docker_runner::options::{DEFAULT_GATEWAY_ADDRESS, DEFAULT_STARTUP_TIMEOUT};
use docker_runner::{DockerOptions, HostPlatform};
use std::path::PathBuf;
use std::time::Duration;

/// Selects one function of a service manifest.
#[derive(Debug, Clone, Args)]
pub struct FunctionArgs {
    /// Path to the service manifest YAML
    #[arg(long, value_name = "FILE", env = "SERVICE_MANIFEST")]
    pub manifest: PathBuf,

    /// Function name as declared in the manifest
    #[arg(long)]
    pub function: String,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Container engine binary
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Address the published invocation port is reachable on
    #[arg(long, env = "GATEWAY_ADDRESS", default_value = DEFAULT_GATEWAY_ADDRESS)]
    pub gateway_address: String,

    /// Layer cache directory (defaults to <service>/.serverless-offline/layers)
    #[arg(long, env = "LAYERS_DIR")]
    pub layers_dir: Option<PathBuf>,

    /// Service path as seen by the container engine host
    #[arg(long, env = "HOST_SERVICE_PATH")]
    pub host_service_path: Option<PathBuf>,

    /// Network to attach function containers to
    #[arg(long, env = "DOCKER_NETWORK")]
    pub network: Option<String>,

    /// Mount the function code read-only
    #[arg(long, env = "DOCKER_READ_ONLY", default_value_t = true, action = ArgAction::Set)]
    pub read_only: bool,

    /// How long to wait for the runtime to report ready, e.g. "90s" or "2m"
    #[arg(long, env = "STARTUP_TIMEOUT", value_parser = humantime::parse_duration, default_value = "60s")]
    pub startup_timeout: Duration,

    /// Layer registry endpoint (defaults to the regional public endpoint)
    #[arg(long, env = "LAYER_REGISTRY_ENDPOINT")]
    pub layer_registry_endpoint: Option<String>,
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            gateway_address: DEFAULT_GATEWAY_ADDRESS.to_string(),
            layers_dir: None,
            host_service_path: None,
            network: None,
            read_only: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            layer_registry_endpoint: None,
        }
    }
}

impl EngineArgs {
    pub fn docker_options(&self) -> DockerOptions {
        DockerOptions {
            read_only: self.read_only,
            layers_dir: self.layers_dir.clone(),
            host_service_path: self.host_service_path.clone(),
            network: self.network.clone(),
            gateway_address: self.gateway_address.clone(),
            startup_timeout: self.startup_timeout,
            layer_registry_endpoint: self.layer_registry_endpoint.clone(),
            platform: HostPlatform::detect(),
        }
    }
}
