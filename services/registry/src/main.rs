//! OCI registry server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use eyre::WrapErr;
use registry::RegistryBuilder;
use registry::config::RegistryConfig;
use registry::gc::{BlobCollector, UploadSweeper};
use registry::metadata::MetadataStore;
use registry::work::{ARTIFACT_PUSHED, ArtifactPushed, Consumer, TaskHandler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Serve the OCI distribution API.
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
}

/// Records pushes in the server log until real consumers are attached.
#[derive(Debug)]
struct PushLog;

#[async_trait::async_trait]
impl TaskHandler for PushLog {
    async fn handle(&self, payload: &str) -> eyre::Result<()> {
        let pushed: ArtifactPushed = serde_json::from_str(payload)?;
        tracing::info!(
            repository = %pushed.repository,
            digest = %pushed.digest,
            media_type = %pushed.media_type,
            "artifact pushed"
        );
        Ok(())
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,registry=debug".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn load_config(path: Option<&PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        return Ok(RegistryConfig::default());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let storage = config.storage.build().wrap_err("building storage driver")?;
    let metadata = MetadataStore::connect(&config.database, config.locker.clone())
        .await
        .wrap_err("opening metadata store")?
        .with_retry((&config.retry).into());

    let registry = RegistryBuilder::new()
        .storage(storage)
        .metadata(metadata.clone())
        .config(config.clone())
        .build()?;

    let shutdown = CancellationToken::new();
    let mut sweeper = UploadSweeper::new(
        registry.uploads().clone(),
        config.upload.session_ttl(),
        config.upload.sweep_interval(),
    );
    if config.gc.collect_blobs {
        sweeper = sweeper.with_collector(BlobCollector::new(
            registry.blobs().clone(),
            metadata.clone(),
            config.gc.blob_grace(),
        ));
    }
    let sweeper = sweeper.spawn(shutdown.clone());
    let consumer = tokio::spawn(
        Consumer::new(metadata)
            .register(ARTIFACT_PUSHED, Arc::new(PushLog))
            .run(shutdown.clone()),
    );

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, driver = config.storage.driver(), "registry listening");

    let signal = shutdown.clone();
    axum::serve(listener, registry.router())
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    sweeper.await?;
    consumer.await?;
    Ok(())
}
