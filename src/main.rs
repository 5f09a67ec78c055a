use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use edge_video_agent::bus::EventBus;
use edge_video_agent::config::Config;
use edge_video_agent::db::{self, InMemoryStore};
use edge_video_agent::event_session::EventSessionManager;
use edge_video_agent::frame_store::FrameStore;
use edge_video_agent::orchestrator::{Orchestrator, OrchestratorConfig};
use edge_video_agent::web;
use edge_video_agent::ws_fmp4::WsFmp4Publisher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Edge video-analytics agent", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Override the reconciliation poll interval, in seconds.
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Override the web/WS server bind port.
    #[arg(long)]
    web_port: Option<u16>,

    /// Override the web/WS server bind address.
    #[arg(long)]
    bind_ip: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                path = %args.config,
                error = %err,
                "no usable config file, starting from defaults"
            );
            toml::from_str("[server]\n").context("failed to build default config")?
        }
    };

    if let Some(port) = args.web_port {
        config.server.web_port = port;
    }
    if let Some(bind_ip) = &args.bind_ip {
        config.server.bind_ip = bind_ip.clone();
    }
    if let Some(poll_interval_secs) = args.poll_interval_secs {
        config.database.poll_interval_secs = poll_interval_secs;
    }
    Ok(config)
}

/// Logs FrameStore/session-manager gauges on a fixed interval — ambient
/// observability the orchestration loop itself has no natural place for.
async fn stats_logger(frame_store: Arc<FrameStore>, sessions: Arc<EventSessionManager>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(120));
    loop {
        ticker.tick().await;
        tracing::info!(
            frame_store_keys = frame_store.len(),
            active_sessions = sessions.session_count().await,
            encode_queue_depth = sessions.encode_queue_depth(),
            "periodic stats"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let config = Arc::new(config);

    let frame_store = Arc::new(FrameStore::new());

    let bus = match EventBus::start(config.bus.endpoint.clone(), config.bus.topic.clone()) {
        Ok(bus) => Arc::new(bus),
        Err(err) => {
            tracing::error!(error = %err, "failed to bind event bus, falling back to a no-op bus");
            Arc::new(EventBus::start_noop())
        }
    };

    let sessions = EventSessionManager::start(
        Arc::clone(&bus),
        config.session.clone(),
        config.video.clone(),
        config.bus.max_message_bytes,
        config.resolve_timezone(),
    );

    // The CRUD/persistence layer is an external collaborator; this process
    // polls whatever `Store` implementation the surrounding platform wires
    // in. The in-memory store here is seeded empty and is the one a
    // standalone run or test harness backs the orchestrator with.
    let store: Arc<dyn db::Store> = InMemoryStore::new();

    let ws_fmp4 = WsFmp4Publisher::new(Arc::clone(&frame_store), config.video.clone());

    let orchestrator_config = OrchestratorConfig {
        poll_interval: Duration::from_secs(config.database.poll_interval_secs.max(1)),
        webrtc: config.webrtc.clone(),
        signaling_url: config.signaling.url.clone(),
        default_fps: config.video.default_fps,
    };
    let orchestrator = Orchestrator::new(
        store,
        Arc::clone(&frame_store),
        Arc::clone(&sessions),
        orchestrator_config,
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let orchestrator_handle = tokio::spawn(orchestrator.run(stop_rx));

    let stats_handle = tokio::spawn(stats_logger(Arc::clone(&frame_store), Arc::clone(&sessions)));

    let web_state = web::AppState {
        config: Arc::clone(&config),
        frame_store: Arc::clone(&frame_store),
        sessions: Arc::clone(&sessions),
        ws_fmp4,
    };
    let web_handle = tokio::spawn(web::run_server(web_state));

    tracing::info!("edge video agent started");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    let _ = stop_tx.send(true);
    stats_handle.abort();
    web_handle.abort();
    let _ = orchestrator_handle.await;

    Ok(())
}
