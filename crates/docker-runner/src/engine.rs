//! Narrow capability interface over the external container engine.
//!
//! The controller only talks to the engine through [`ContainerEngine`]; the
//! production implementation shells out to the `docker` CLI ([`DockerCli`]).

use crate::error::EngineError;
use crate::launch::LaunchSpec;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

/// Combined stdout/stderr of an attached container, one line per item.
/// Bytes that are not valid UTF-8 are replaced rather than reported as errors.
pub type OutputLines = BoxStream<'static, std::io::Result<String>>;

pub const BRIDGE_GATEWAY_FORMAT: &str = "{{(index .IPAM.Config 0).Gateway}}";

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fails with [`EngineError::Unavailable`] when the engine cannot be reached.
    async fn check_available(&self) -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Creates a container and returns its engine-assigned identifier.
    async fn create(&self, spec: &LaunchSpec) -> Result<String, EngineError>;

    /// Starts the container attached and streams its combined output.
    async fn start(&self, container: &str) -> Result<OutputLines, EngineError>;

    /// Raw port mapping listing, one `<port>/tcp -> <addr>:<port>` per line.
    async fn port(&self, container: &str) -> Result<String, EngineError>;

    async fn stop(&self, container: &str) -> Result<(), EngineError>;

    async fn remove(&self, container: &str) -> Result<(), EngineError>;

    /// Gateway address of the engine's default bridge network.
    async fn bridge_gateway(&self) -> Result<String, EngineError>;
}

/// [`ContainerEngine`] backed by the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn exec<I, S>(&self, args: I) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args);
        command.stdin(Stdio::null());
        let cmdline = command_line_string(command.as_std());
        debug!(command = %cmdline, "running container engine command");

        let output = command
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: cmdline.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: cmdline,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn check_available(&self) -> Result<(), EngineError> {
        self.exec(["version"])
            .await
            .map(|_| ())
            .map_err(|err| EngineError::Unavailable {
                program: self.program.clone(),
                message: err.to_string(),
            })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.exec(["image", "inspect", image]).await {
            Ok(_) => Ok(true),
            Err(EngineError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.exec(["pull", image]).await.map(|_| ())
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<String, EngineError> {
        let mut args = vec!["create".to_string()];
        args.extend(spec.create_args());
        self.exec(args).await
    }

    async fn start(&self, container: &str) -> Result<OutputLines, EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(["start", "-a", container])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let cmdline = command_line_string(command.as_std());
        debug!(command = %cmdline, "attaching to container");

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            command: cmdline.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(EngineError::Spawn {
                    command: cmdline,
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "attached output pipes were not captured",
                    ),
                })
            }
        };

        let container = container.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(container = %container, %status, "attached engine process exited"),
                Err(err) => warn!(container = %container, error = %err, "failed to wait for attached engine process"),
            }
        });

        Ok(stream::select(lossy_lines(stdout), lossy_lines(stderr)).boxed())
    }

    async fn port(&self, container: &str) -> Result<String, EngineError> {
        self.exec(["port", container]).await
    }

    async fn stop(&self, container: &str) -> Result<(), EngineError> {
        self.exec(["stop", container]).await.map(|_| ())
    }

    async fn remove(&self, container: &str) -> Result<(), EngineError> {
        self.exec(["rm", container]).await.map(|_| ())
    }

    async fn bridge_gateway(&self) -> Result<String, EngineError> {
        let output = self
            .exec(["network", "inspect", "bridge", "--format", BRIDGE_GATEWAY_FORMAT])
            .await?;
        Ok(strip_prefix_length(&output).to_string())
    }
}

/// Splits on `\n` and decodes each line lossily, so handler output in any encoding keeps flowing.
fn lossy_lines<R>(reader: R) -> impl Stream<Item = std::io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    SplitStream::new(BufReader::new(reader).split(b'\n')).map(|chunk| {
        chunk.map(|bytes| {
            let line = String::from_utf8_lossy(&bytes);
            line.strip_suffix('\r').unwrap_or(&line).to_string()
        })
    })
}

/// `172.17.0.1/16` -> `172.17.0.1`
fn strip_prefix_length(address: &str) -> &str {
    address.trim().split('/').next().unwrap_or_default()
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn command_line_string(cmd: &std::process::Command) -> String {
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_prefix_length_is_dropped() {
        assert_eq!(strip_prefix_length("172.17.0.1/16\n"), "172.17.0.1");
        assert_eq!(strip_prefix_length("172.18.0.1"), "172.18.0.1");
    }

    #[test]
    fn command_line_quotes_arguments_with_spaces() {
        let mut cmd = std::process::Command::new("docker");
        cmd.args(["network", "inspect", "bridge", "--format", "{{ .Id }}"]);
        assert_eq!(
            command_line_string(&cmd),
            "docker network inspect bridge --format '{{ .Id }}'"
        );
    }

    #[tokio::test]
    async fn non_utf8_output_does_not_end_the_stream() {
        let output: &[u8] = b"START\r\n\xff\xfe binary \xc3\nready\n";
        let lines: Vec<String> = lossy_lines(output)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "START");
        assert!(lines[1].contains("binary"));
        assert!(lines[1].contains('\u{FFFD}'));
        assert_eq!(lines[2], "ready");
    }

    #[tokio::test]
    async fn missing_binary_is_reported_unavailable() {
        let engine = DockerCli::new("/nonexistent/docker-binary-for-tests");
        let err = engine.check_available().await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let engine = DockerCli::new("/nonexistent/docker-binary-for-tests");
        let err = engine.port("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
