mod config;
mod manifest;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{EngineArgs, FunctionArgs};
use docker_runner::{DockerCli, DockerRunner, HttpLayerRegistry, ImageHandle, LayerMaterializer};
use manifest::ServiceManifest;
use serde_json::Value as JsonValue;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "lambdactl", version)]
#[command(about = "Runs serverless functions locally inside runtime containers")]
struct Cli {
    /// Output logs in JSON format
    #[arg(long, env, global = true)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a function once and print its JSON response
    Invoke {
        #[command(flatten)]
        target: FunctionArgs,
        /// Event JSON file, or "-" for stdin (defaults to an empty object)
        #[arg(long, value_name = "FILE")]
        event: Option<String>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Materialize a function's layers and print where they landed
    Layers {
        #[command(flatten)]
        target: FunctionArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Print the container image used for a runtime
    Image {
        #[arg(long)]
        runtime: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.cmd {
        Commands::Invoke {
            target,
            event,
            engine,
        } => invoke(target, event.as_deref(), engine).await,
        Commands::Layers { target, engine } => layers(target, engine).await,
        Commands::Image { runtime } => {
            let image = ImageHandle::for_runtime(&runtime)?;
            println!("{}", image.reference());
            Ok(())
        }
    }
}

async fn invoke(target: FunctionArgs, event: Option<&str>, engine: EngineArgs) -> Result<()> {
    let manifest = ServiceManifest::load(&target.manifest)?;
    let function = manifest.function_options(&target.function)?;
    let event = read_event(event)?;

    let docker = Arc::new(DockerCli::new(engine.docker_bin.clone()));
    let mut runner = DockerRunner::new(docker, function, engine.docker_options());

    let outcome = runner.run(&event).await;
    let cleanup = runner.cleanup().await;

    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            if let Err(cleanup_err) = cleanup {
                warn!(error = %cleanup_err, "Cleanup after failed invocation also failed");
            }
            let code = err.code();
            return Err(err)
                .with_context(|| format!("Invocation of '{}' failed ({})", target.function, code));
        }
    };
    cleanup.context("Failed to clean up function container")?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn layers(target: FunctionArgs, engine: EngineArgs) -> Result<()> {
    let manifest = ServiceManifest::load(&target.manifest)?;
    let function = manifest.function_options(&target.function)?;

    if !function.provider.supports_layers() {
        bail!(
            "Provider {} is Unsupported. Layers are only supported on aws.",
            function.provider.name
        );
    }
    if function.layers.is_empty() {
        info!(function = %function.function_key, "Function declares no layers");
    }

    let http = reqwest::Client::new();
    let options = engine.docker_options();
    let registry = HttpLayerRegistry::for_function(http.clone(), &function, &options)?;

    let root = options.layers_root(&function.service_path);
    let materializer = LayerMaterializer::new(
        Arc::new(registry),
        http,
        function.service_layers.clone(),
        function.service_path.clone(),
    );
    let resolution = materializer
        .resolve(&function.layers, &function.runtime, &root)
        .await?;

    if !resolution.published {
        warn!(
            dir = %resolution.dir.display(),
            "Layers were not cached because some failed; the directory is left for inspection"
        );
    }

    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}

fn read_event(source: Option<&str>) -> Result<JsonValue> {
    let raw = match source {
        None => return Ok(JsonValue::Object(Default::default())),
        Some("-") => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read event from stdin")?;
            buffer
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path))?,
    };
    serde_json::from_str(&raw).context("Event is not valid JSON")
}
