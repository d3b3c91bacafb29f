//! Container-backed execution of cloud functions on a local machine.
//!
//! A [`DockerRunner`] owns one container per function: it pulls the runtime
//! image, materializes the function's layers, starts the container, waits for
//! the emulated runtime to come up and then proxies invocation events to it.

pub mod container;
pub mod engine;
pub mod error;
pub mod image;
pub mod launch;
pub mod layers;
pub mod options;
pub mod registry;
pub mod runner;

pub use container::{ContainerState, DockerContainer, BOOTSTRAP_MARKER, INVOCATION_PORT};
pub use engine::{ContainerEngine, DockerCli, OutputLines};
pub use error::{EngineError, Result, RunnerError};
pub use image::ImageHandle;
pub use launch::{LaunchSpec, Mount};
pub use layers::{layer_cache_key, LayerMaterializer, LayerResolution, SkipReason, SkippedLayer};
pub use options::{
    DockerOptions, FunctionOptions, HostPlatform, LayerReference, ProviderInfo, ServiceLayer,
};
pub use registry::{HttpLayerRegistry, LayerContent, LayerRegistry, LayerVersion, RegistryError};
pub use runner::DockerRunner;
