use std::sync::Arc;

use clap::Parser;
use config::Config;
use loopcast::channels::{ChannelSettings, StreamingConfig};
use loopcast::codec::ffmpeg::FfmpegEngine;
use loopcast::codec::synthetic::SyntheticEngine;
use loopcast::codec::{CodecEngine, EngineKind};
use loopcast::metrics::MonitoringConfig;
use loopcast::supervisor::ChannelRegistry;
use loopcast::{create_app, hardware};
use serde::Deserialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Packet engine (overrides config)
    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    #[serde(default)]
    streaming: StreamingConfig,
    #[serde(default)]
    ffmpeg: FfmpegConfig,
    #[serde(default)]
    channels: Vec<ChannelSettings>,
    #[serde(default)]
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_path")]
    path: String,
    #[serde(default)]
    hw_accel: Option<String>,
    #[serde(default = "default_threads")]
    threads: u8,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: default_ffmpeg_path(),
            hw_accel: None,
            threads: default_threads(),
        }
    }
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_threads() -> u8 {
    2
}

fn build_engine(kind: EngineKind, ffmpeg: &FfmpegConfig) -> Arc<dyn CodecEngine> {
    match kind {
        EngineKind::Ffmpeg => {
            let hw_accel = hardware::detect(ffmpeg.hw_accel.as_deref());
            info!("Using ffmpeg at {} (hw_accel={}, threads={})", ffmpeg.path, hw_accel, ffmpeg.threads);
            Arc::new(FfmpegEngine::new(ffmpeg.path.clone(), &hw_accel, ffmpeg.threads))
        }
        EngineKind::Synthetic => {
            info!("Using the synthetic engine; playlist files are not read");
            Arc::new(SyntheticEngine::new())
        }
    }
}

async fn shutdown_signal(registry: Arc<ChannelRegistry>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
    // Open streaming responses only end once their sessions see the cancellation.
    registry.begin_shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("LOOPCAST").separator("__"))
        .build()?;
    let mut settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}: {:?}", args.config, settings);

    if let Some(engine) = args.engine {
        settings.streaming.engine = engine;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    if settings.channels.is_empty() {
        anyhow::bail!("no channels configured in {}", args.config);
    }

    let engine = build_engine(settings.streaming.engine, &settings.ffmpeg);
    let registry = Arc::new(ChannelRegistry::new(engine, settings.streaming.clone()));

    for channel in settings.channels {
        let name = channel.name.clone();
        if let Err(e) = registry.start(channel) {
            error!("Failed to start channel {}: {:#}", name, e);
        }
    }

    if registry.channels().is_empty() {
        anyhow::bail!("no channel could be started");
    }
    info!("Total running channels: {}", registry.channels().len());

    let app = create_app(registry.clone(), settings.monitoring);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;

    let registry_for_shutdown = registry.clone();
    tokio::task::spawn_blocking(move || registry_for_shutdown.shutdown()).await?;
    info!("Shutdown complete");
    Ok(())
}
