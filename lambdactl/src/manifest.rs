//! Service manifest: the YAML file describing a service's functions and layers.

use anyhow::{bail, Context, Result};
use docker_runner::{FunctionOptions, LayerReference, ProviderInfo, ServiceLayer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    /// Root of the service; relative paths resolve against the manifest's directory.
    #[serde(default)]
    pub service_path: Option<PathBuf>,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub layers: BTreeMap<String, ServiceLayer>,
    pub functions: BTreeMap<String, FunctionSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSection {
    #[serde(default = "default_provider")]
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Runtime for functions that don't name their own.
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            name: default_provider(),
            region: None,
            runtime: None,
            environment: BTreeMap::new(),
        }
    }
}

fn default_provider() -> String {
    "aws".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSection {
    pub handler: String,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub code_dir: Option<PathBuf>,
    #[serde(default)]
    pub layers: Vec<LayerReference>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// A parsed manifest with its service root resolved to an absolute path.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: ServiceManifest,
    pub service_path: PathBuf,
}

impl ServiceManifest {
    pub fn load(path: &Path) -> Result<LoadedManifest> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: ServiceManifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;

        let manifest_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let service_path = match &manifest.service_path {
            Some(service_path) => manifest_dir.join(service_path),
            None => manifest_dir,
        };
        let service_path = absolutize(&service_path)?;

        Ok(LoadedManifest {
            manifest,
            service_path,
        })
    }
}

impl LoadedManifest {
    pub fn provider(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.manifest.provider.name.clone(),
            region: self.manifest.provider.region.clone(),
        }
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.manifest.functions.keys().map(String::as_str).collect()
    }

    pub fn function_options(&self, name: &str) -> Result<FunctionOptions> {
        let Some(function) = self.manifest.functions.get(name) else {
            bail!(
                "Function '{}' is not defined in the manifest (available: {})",
                name,
                self.function_names().join(", ")
            );
        };

        let runtime = match function
            .runtime
            .as_ref()
            .or(self.manifest.provider.runtime.as_ref())
        {
            Some(runtime) => runtime.clone(),
            None => bail!(
                "Function '{}' has no runtime and the provider declares no default",
                name
            ),
        };

        let code_dir = match &function.code_dir {
            Some(dir) => self.service_path.join(dir),
            None => self.service_path.clone(),
        };

        let mut environment = self.manifest.provider.environment.clone();
        environment.extend(function.environment.clone());

        Ok(FunctionOptions {
            function_key: name.to_string(),
            handler: function.handler.clone(),
            runtime,
            image: function.image.clone(),
            code_dir,
            service_path: self.service_path.clone(),
            layers: function.layers.clone(),
            service_layers: self.manifest.layers.clone(),
            provider: self.provider(),
            environment,
        })
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
provider:
  name: aws
  region: eu-west-1
  runtime: python3.11
  environment:
    STAGE: dev
    LOG_LEVEL: info
layers:
  Deps:
    path: layers/deps
    compatibleRuntimes: [python3.11]
functions:
  hello:
    handler: handler.hello
    codeDir: src
    layers:
      - arn:aws:lambda:eu-west-1:123456789012:layer:pandas:4
      - Ref: DepsLambdaLayer
    environment:
      LOG_LEVEL: debug
  legacy:
    handler: index.handler
    runtime: nodejs16.x
"#;

    fn load(content: &str) -> (tempfile::TempDir, LoadedManifest) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.yml");
        std::fs::write(&path, content).unwrap();
        let loaded = ServiceManifest::load(&path).unwrap();
        (dir, loaded)
    }

    #[test]
    fn test_function_options_merge_provider_defaults() {
        let (dir, loaded) = load(MANIFEST);
        let options = loaded.function_options("hello").unwrap();

        assert_eq!(options.function_key, "hello");
        assert_eq!(options.runtime, "python3.11");
        assert_eq!(options.service_path, dir.path());
        assert_eq!(options.code_dir, dir.path().join("src"));
        assert_eq!(options.provider, ProviderInfo::aws("eu-west-1"));
        assert_eq!(options.environment.get("STAGE").map(String::as_str), Some("dev"));
        assert_eq!(options.environment.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(
            options.layers,
            vec![
                LayerReference::Arn(
                    "arn:aws:lambda:eu-west-1:123456789012:layer:pandas:4".to_string()
                ),
                LayerReference::Local {
                    reference: "DepsLambdaLayer".to_string()
                },
            ]
        );
        assert_eq!(
            options.service_layers["Deps"].compatible_runtimes,
            Some(vec!["python3.11".to_string()])
        );
    }

    #[test]
    fn test_function_runtime_overrides_provider() {
        let (dir, loaded) = load(MANIFEST);
        let options = loaded.function_options("legacy").unwrap();
        assert_eq!(options.runtime, "nodejs16.x");
        assert_eq!(options.code_dir, dir.path());
    }

    #[test]
    fn test_unknown_function_lists_available() {
        let (_dir, loaded) = load(MANIFEST);
        let err = loaded.function_options("missing").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("missing"));
        assert!(message.contains("hello, legacy"));
    }

    #[test]
    fn test_missing_runtime_is_rejected() {
        let (_dir, loaded) = load("functions:\n  bare:\n    handler: main.handler\n");
        let err = loaded.function_options("bare").unwrap_err();
        assert!(err.to_string().contains("no runtime"));
        assert!(loaded.provider().supports_layers());
    }

    #[test]
    fn test_service_path_is_relative_to_manifest() {
        let (dir, loaded) = load("servicePath: app\nfunctions: {}\n");
        assert_eq!(loaded.service_path, dir.path().join("app"));
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        std::fs::write(&path, "functions: [unterminated").unwrap();
        let err = ServiceManifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.yml"));
    }
}
