use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

/// Failures surfaced by the container engine command interface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine '{program}' is not available: {message}")]
    Unavailable { program: String, message: String },
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    EngineUnavailable(EngineError),

    #[error("failed to pull image {image}: {source}")]
    PullFailed { image: String, source: EngineError },

    #[error("unsupported runtime '{runtime}'")]
    UnsupportedRuntime { runtime: String },

    #[error("failed to get port of container {container}: no mapping for {internal_port}/tcp in {output:?}")]
    PortDiscoveryFailed {
        container: String,
        internal_port: u16,
        output: String,
    },

    #[error("container {container} did not report ready within {timeout:?}")]
    StartupTimeout { container: String, timeout: Duration },

    #[error("container {container} failed during startup: {message}")]
    StartupFailed { container: String, message: String },

    #[error("failed to invoke {url}: {message}")]
    InvocationTransport { url: String, message: String },

    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("container is not running")]
    NotRunning,

    #[error("failed to tear down container {container}: {source}")]
    TeardownFailed {
        container: String,
        source: EngineError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{message}")]
    Io { message: String },
}

impl RunnerError {
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        RunnerError::Io {
            message: format!("{}: {}", context, err),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            RunnerError::PullFailed { .. } => "PULL_FAILED",
            RunnerError::UnsupportedRuntime { .. } => "UNSUPPORTED_RUNTIME",
            RunnerError::PortDiscoveryFailed { .. } => "PORT_DISCOVERY_FAILED",
            RunnerError::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            RunnerError::StartupFailed { .. } => "STARTUP_FAILED",
            RunnerError::InvocationTransport { .. } => "INVOCATION_TRANSPORT_ERROR",
            RunnerError::InvalidResponse { .. } => "INVALID_RESPONSE",
            RunnerError::NotRunning => "NOT_RUNNING",
            RunnerError::TeardownFailed { .. } => "TEARDOWN_FAILED",
            RunnerError::Engine(_) => "ENGINE_ERROR",
            RunnerError::Io { .. } => "IO_ERROR",
        }
    }
}
