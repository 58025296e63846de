//! kiln-server binary
//!
//! Serves the execution engine over HTTP, or runs one-off maintenance
//! against the sandbox backend.

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_core::config::{ConfigLoader, KilnConfig};
use kiln_core::environment::EnvironmentCache;
use kiln_core::{sandbox, Capabilities, Engine, GeminiAssistant};
use kiln_server::{shutdown_signal, spawn_pruning, AppState, KilnServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kiln-server")]
#[command(about = "Sandboxed execution and self-healing retry engine for generated code")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Run {
        /// Server bind address, overrides the configuration
        #[arg(short, long)]
        bind: Option<String>,

        /// CORS allowed origins (comma-separated)
        #[arg(long)]
        cors_origins: Option<String>,

        /// SSE keep-alive interval in seconds
        #[arg(long, default_value = "15")]
        keepalive: u64,
    },
    /// Remove stopped containers and dangling images once
    Prune,
    /// Probe the sandbox backend and the base image
    Check {
        /// Build the base image when it is missing
        #[arg(long)]
        build_base: bool,
    },
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<KilnConfig> {
    let config = match path {
        Some(path) => ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::from_env().context("Invalid environment configuration")?,
    };
    Ok(config)
}

async fn run(
    config: KilnConfig,
    bind: Option<String>,
    cors_origins: Option<String>,
    keepalive: u64,
) -> anyhow::Result<()> {
    let assistant = GeminiAssistant::new(&config.assistant)
        .context("The reasoning service is not configured")?;
    let capabilities = Capabilities::from_single(Arc::new(assistant));

    let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
    let mut server_config = ServerConfig::new()
        .with_bind_addr_str(&bind)?
        .with_sse_keepalive(Duration::from_secs(keepalive));
    if let Some(origins) = cors_origins {
        server_config =
            server_config.with_cors_origins(origins.split(',').map(|s| s.trim().to_string()).collect());
    }

    let pruning = config.pruning.clone();
    let state = match Engine::start(config, capabilities).await {
        Ok(engine) => {
            let engine = Arc::new(engine);
            if pruning.enabled {
                log::info!("Pruning the sandbox every {}s", pruning.interval_secs);
                spawn_pruning(engine.clone(), Duration::from_secs(pruning.interval_secs));
            }
            AppState::new(engine, server_config)
        }
        Err(e) => {
            log::error!("No sandbox backend available: {}", e);
            AppState::without_backend(e.to_string(), server_config)
        }
    };

    KilnServer::new(state)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn prune(config: KilnConfig) -> anyhow::Result<()> {
    let backend = sandbox::detect(config.sandbox.backend).await?;
    let cache = EnvironmentCache::new(backend, &config.sandbox, &config.pruning);
    let report = cache.prune().await?;

    println!(
        "Deleted {} container(s) and {} image(s), reclaimed {} bytes",
        report.containers_deleted, report.images_deleted, report.space_reclaimed
    );
    Ok(())
}

async fn check(config: KilnConfig, build_base: bool) -> anyhow::Result<()> {
    let backend = match sandbox::detect(config.sandbox.backend).await {
        Ok(backend) => backend,
        Err(e) => {
            println!("Sandbox backend: unavailable ({})", e);
            anyhow::bail!("no sandbox backend");
        }
    };
    println!("Sandbox backend: {}", backend.name());

    let base_image = config.sandbox.base_image.clone();
    let present = backend.image_exists(&base_image).await?;
    println!(
        "Base image {}: {}",
        base_image,
        if present { "present" } else { "missing" }
    );

    if !present && build_base {
        let cache = EnvironmentCache::new(backend, &config.sandbox, &config.pruning);
        cache.ensure_base().await?;
        println!("Base image {}: built", base_image);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = load_config(args.config.as_ref()).await?;

    match args.command.unwrap_or(Command::Run {
        bind: None,
        cors_origins: None,
        keepalive: 15,
    }) {
        Command::Run {
            bind,
            cors_origins,
            keepalive,
        } => run(config, bind, cors_origins, keepalive).await,
        Command::Prune => prune(config).await,
        Command::Check { build_base } => check(config, build_base).await,
    }
}
