use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn volume_arg(&self) -> String {
        let permissions = if self.read_only { "ro" } else { "rw" };
        format!(
            "{}:{}:{},delegated",
            self.source.display(),
            self.target,
            permissions
        )
    }
}

/// Everything the engine needs to create one function container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub published_ports: Vec<u16>,
    /// Entries are passed in order; a later entry wins over an earlier one with the same key.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub network: Option<String>,
}

impl LaunchSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn push_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.push((key.into(), value.into()));
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Arguments following `create` on the engine command line.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }

        for port in &self.published_ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (host, address) in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(format!("{}:{}", host, address));
        }

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}
