use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GATEWAY_ADDRESS: &str = "127.0.0.1";
const LOCAL_LAYER_SUFFIX: &str = "LambdaLayer";

/// A layer attached to a function: a published layer version or a project-local layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerReference {
    Arn(String),
    Local {
        #[serde(rename = "Ref")]
        reference: String,
    },
}

/// How a [`LayerReference`] gets materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSource<'a> {
    Remote { arn: &'a str, name: &'a str },
    Local { name: &'a str },
}

impl LayerReference {
    pub fn source(&self) -> LayerSource<'_> {
        match self {
            LayerReference::Arn(arn) => match arn.split_once(":layer:") {
                Some((_, name)) => LayerSource::Remote { arn, name },
                None => LayerSource::Local {
                    name: local_layer_name(arn),
                },
            },
            LayerReference::Local { reference } => LayerSource::Local {
                name: local_layer_name(reference),
            },
        }
    }

    /// Label used in logs and diagnostics.
    pub fn label(&self) -> &str {
        match self {
            LayerReference::Arn(arn) => arn
                .split_once(":layer:")
                .map_or(arn.as_str(), |(_, name)| name),
            LayerReference::Local { reference } => reference,
        }
    }
}

fn local_layer_name(reference: &str) -> &str {
    reference
        .strip_suffix(LOCAL_LAYER_SUFFIX)
        .unwrap_or(reference)
}

/// A layer defined inside the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLayer {
    pub path: PathBuf,
    #[serde(default, alias = "CompatibleRuntimes")]
    pub compatible_runtimes: Option<Vec<String>>,
}

impl ServiceLayer {
    pub fn supports(&self, runtime: &str) -> bool {
        runtime_allowed(self.compatible_runtimes.as_deref(), runtime)
    }
}

pub(crate) fn runtime_allowed(compatible: Option<&[String]>, runtime: &str) -> bool {
    compatible.map_or(true, |list| list.iter().any(|r| r == runtime))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl ProviderInfo {
    pub fn aws(region: impl Into<String>) -> Self {
        Self {
            name: "aws".to_string(),
            region: Some(region.into()),
        }
    }

    /// Layers can only be materialized for this provider.
    pub fn supports_layers(&self) -> bool {
        self.name.eq_ignore_ascii_case("aws")
    }
}

/// Per-function settings handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOptions {
    pub function_key: String,
    pub handler: String,
    pub runtime: String,
    /// Overrides the image otherwise derived from `runtime`.
    pub image: Option<String>,
    pub code_dir: PathBuf,
    pub service_path: PathBuf,
    pub layers: Vec<LayerReference>,
    pub service_layers: BTreeMap<String, ServiceLayer>,
    pub provider: ProviderInfo,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    /// Linux with its own network namespace; the container needs an explicit host alias.
    Linux,
    /// Linux under WSL, where the engine runs in a bridged VM.
    Wsl,
    Other,
}

impl HostPlatform {
    pub fn detect() -> Self {
        if !cfg!(target_os = "linux") {
            return HostPlatform::Other;
        }
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
        if release.to_ascii_lowercase().contains("microsoft")
            || std::env::var_os("WSL_DISTRO_NAME").is_some()
        {
            HostPlatform::Wsl
        } else {
            HostPlatform::Linux
        }
    }

    pub fn needs_host_alias(&self) -> bool {
        matches!(self, HostPlatform::Linux)
    }
}

/// Container engine settings shared by every function in a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerOptions {
    pub read_only: bool,
    pub layers_dir: Option<PathBuf>,
    /// Path of the service as seen by the engine, when it differs from `service_path`.
    pub host_service_path: Option<PathBuf>,
    pub network: Option<String>,
    pub gateway_address: String,
    pub startup_timeout: Duration,
    pub layer_registry_endpoint: Option<String>,
    pub platform: HostPlatform,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            layers_dir: None,
            host_service_path: None,
            network: None,
            gateway_address: DEFAULT_GATEWAY_ADDRESS.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            layer_registry_endpoint: None,
            platform: HostPlatform::detect(),
        }
    }
}

impl DockerOptions {
    pub fn layers_root(&self, service_path: &Path) -> PathBuf {
        self.layers_dir
            .clone()
            .unwrap_or_else(|| service_path.join(".serverless-offline").join("layers"))
    }
}

/// Rewrites `path` from the service prefix to the host override prefix.
///
/// Paths outside `service_path`, or calls without an override, are returned as-is.
pub fn translate_host_path(
    path: &Path,
    service_path: &Path,
    host_service_path: Option<&Path>,
) -> PathBuf {
    match host_service_path {
        Some(host) => match path.strip_prefix(service_path) {
            Ok(rest) if rest.as_os_str().is_empty() => host.to_path_buf(),
            Ok(rest) => host.join(rest),
            Err(_) => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arn_references_resolve_remotely() {
        let layer = LayerReference::Arn(
            "arn:aws:lambda:us-east-1:123456789012:layer:pandas:4".to_string(),
        );
        assert_eq!(
            layer.source(),
            LayerSource::Remote {
                arn: "arn:aws:lambda:us-east-1:123456789012:layer:pandas:4",
                name: "pandas:4",
            }
        );
        assert_eq!(layer.label(), "pandas:4");
    }

    #[test]
    fn ref_references_strip_suffix() {
        let layer: LayerReference = serde_json::from_str(r#"{"Ref":"DepsLambdaLayer"}"#).unwrap();
        assert_eq!(layer.source(), LayerSource::Local { name: "Deps" });
        assert_eq!(layer.label(), "DepsLambdaLayer");
        assert_eq!(serde_json::to_string(&layer).unwrap(), r#"{"Ref":"DepsLambdaLayer"}"#);
    }

    #[test]
    fn compatible_runtimes_gate_local_layers() {
        let layer = ServiceLayer {
            path: PathBuf::from("layers/deps"),
            compatible_runtimes: Some(vec!["python3.11".to_string()]),
        };
        assert!(layer.supports("python3.11"));
        assert!(!layer.supports("nodejs20.x"));

        let open = ServiceLayer {
            path: PathBuf::from("layers/any"),
            compatible_runtimes: None,
        };
        assert!(open.supports("ruby3.2"));
    }

    #[test]
    fn only_aws_provider_supports_layers() {
        assert!(ProviderInfo::aws("eu-west-1").supports_layers());
        let other = ProviderInfo {
            name: "AWS".to_string(),
            region: None,
        };
        assert!(other.supports_layers());
        let other = ProviderInfo {
            name: "azure".to_string(),
            region: None,
        };
        assert!(!other.supports_layers());
    }

    #[test]
    fn host_path_rewrites_service_prefix() {
        let translated = translate_host_path(
            Path::new("/workspace/svc/src"),
            Path::new("/workspace/svc"),
            Some(Path::new("/Users/dev/svc")),
        );
        assert_eq!(translated, PathBuf::from("/Users/dev/svc/src"));
    }

    #[test]
    fn host_path_leaves_foreign_paths_alone() {
        let translated = translate_host_path(
            Path::new("/opt/elsewhere"),
            Path::new("/workspace/svc"),
            Some(Path::new("/Users/dev/svc")),
        );
        assert_eq!(translated, PathBuf::from("/opt/elsewhere"));

        let untouched = translate_host_path(
            Path::new("/workspace/svc/src"),
            Path::new("/workspace/svc"),
            None,
        );
        assert_eq!(untouched, PathBuf::from("/workspace/svc/src"));
    }

    #[test]
    fn default_layers_root_lives_under_service() {
        let options = DockerOptions::default();
        assert_eq!(
            options.layers_root(Path::new("/svc")),
            PathBuf::from("/svc/.serverless-offline/layers")
        );
    }
}
