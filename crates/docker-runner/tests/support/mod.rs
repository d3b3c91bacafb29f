#![allow(dead_code)]

use async_trait::async_trait;
use docker_runner::{
    ContainerEngine, EngineError, LaunchSpec, LayerContent, LayerRegistry, LayerVersion,
    OutputLines, RegistryError, BOOTSTRAP_MARKER,
};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use zip::write::FileOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CheckAvailable,
    ImageExists(String),
    Pull(String),
    Create(LaunchSpec),
    Start(String),
    Port(String),
    Stop(String),
    Remove(String),
    BridgeGateway,
}

/// Scriptable stand-in for the container engine that records every call.
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    pub available: bool,
    pub image_present: bool,
    pub fail_pull: bool,
    pub container_id: String,
    pub startup_lines: Vec<String>,
    /// Keep the output stream open after the scripted lines.
    pub hold_output: bool,
    pub port_output: String,
    pub gateway: Option<String>,
    pub fail_stop: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            available: true,
            image_present: true,
            fail_pull: false,
            container_id: "c0ffee".to_string(),
            startup_lines: vec![
                "START runtime".to_string(),
                format!("level=info msg=\"{}\"", BOOTSTRAP_MARKER),
            ],
            hold_output: false,
            port_output: "8080/tcp -> 0.0.0.0:49153\n8080/tcp -> :::49153".to_string(),
            gateway: Some("172.17.0.1".to_string()),
            fail_stop: false,
        }
    }

    pub fn with_port(port: u16) -> Self {
        let mut engine = Self::new();
        engine.port_output = format!("8080/tcp -> 0.0.0.0:{}\n8080/tcp -> :::{}", port, port);
        engine
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn created_specs(&self) -> Vec<LaunchSpec> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Create(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(command: &str) -> EngineError {
        EngineError::CommandFailed {
            command: command.to_string(),
            status: "exit status: 1".to_string(),
            stderr: format!("{} failed", command),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn check_available(&self) -> Result<(), EngineError> {
        self.record(EngineCall::CheckAvailable);
        if self.available {
            Ok(())
        } else {
            Err(EngineError::Unavailable {
                program: "docker".to_string(),
                message: "Cannot connect to the Docker daemon".to_string(),
            })
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.record(EngineCall::ImageExists(image.to_string()));
        Ok(self.image_present)
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Pull(image.to_string()));
        if self.fail_pull {
            Err(Self::failure("docker pull"))
        } else {
            Ok(())
        }
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<String, EngineError> {
        self.record(EngineCall::Create(spec.clone()));
        Ok(self.container_id.clone())
    }

    async fn start(&self, container: &str) -> Result<OutputLines, EngineError> {
        self.record(EngineCall::Start(container.to_string()));
        let lines = stream::iter(
            self.startup_lines
                .clone()
                .into_iter()
                .map(Ok::<_, std::io::Error>),
        );
        if self.hold_output {
            Ok(lines.chain(stream::pending()).boxed())
        } else {
            Ok(lines.boxed())
        }
    }

    async fn port(&self, container: &str) -> Result<String, EngineError> {
        self.record(EngineCall::Port(container.to_string()));
        Ok(self.port_output.clone())
    }

    async fn stop(&self, container: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Stop(container.to_string()));
        if self.fail_stop {
            Err(Self::failure("docker stop"))
        } else {
            Ok(())
        }
    }

    async fn remove(&self, container: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(container.to_string()));
        Ok(())
    }

    async fn bridge_gateway(&self) -> Result<String, EngineError> {
        self.record(EngineCall::BridgeGateway);
        self.gateway
            .clone()
            .ok_or_else(|| Self::failure("docker network inspect"))
    }
}

/// In-memory layer registry that counts lookups.
#[derive(Default)]
pub struct FakeRegistry {
    versions: HashMap<String, LayerVersion>,
    lookups: AtomicUsize,
    outages: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(
        mut self,
        arn: &str,
        location: &str,
        code_size: u64,
        compatible_runtimes: Option<Vec<&str>>,
    ) -> Self {
        self.versions.insert(
            arn.to_string(),
            LayerVersion {
                layer_version_arn: Some(arn.to_string()),
                content: LayerContent {
                    location: location.to_string(),
                    code_size,
                    code_sha256: None,
                },
                compatible_runtimes: compatible_runtimes
                    .map(|runtimes| runtimes.into_iter().map(String::from).collect()),
            },
        );
        self
    }

    /// Answers the next `count` lookups with a 503.
    pub fn unavailable_for(self, count: usize) -> Self {
        self.outages.store(count, Ordering::SeqCst);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerRegistry for FakeRegistry {
    async fn layer_version(&self, arn: &str) -> Result<LayerVersion, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if outage {
            return Err(RegistryError::Status {
                status: 503,
                body: "Service Unavailable".to_string(),
            });
        }
        self.versions
            .get(arn)
            .cloned()
            .ok_or_else(|| RegistryError::Status {
                status: 404,
                body: format!("Layer version {} does not exist", arn),
            })
    }
}

pub fn layer_arn(name: &str) -> String {
    format!("arn:aws:lambda:us-east-1:123456789012:layer:{}:1", name)
}

/// Zip archive bytes holding the given `(path, contents, mode)` entries.
pub fn zip_bytes(entries: &[(&str, &str, u32)]) -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    for (name, contents, mode) in entries {
        writer
            .start_file(*name, FileOptions::default().unix_permissions(*mode))
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
