use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use jam_link::telemetry::{self, LogConfig, LogLevel, Role};
use jam_road::config::Config;
use jam_road::{router, spawn_sweeper, AppState};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "jam-road")]
#[command(about = "Signaling relay and TURN credential service for jam")]
struct Cli {
    /// Port to listen on; overrides JAM_ROAD_PORT
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "JAM_ROAD_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "JAM_ROAD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = telemetry::init(&LogConfig {
        role: Role::Relay,
        level: cli.log_level,
        file: cli.log_file.clone(),
    }) {
        eprintln!("jam-road: {err}");
        return ExitCode::FAILURE;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(
        port = config.port,
        room_ttl = config.room_ttl_seconds,
        message_cap = config.message_cap,
        "starting jam-road"
    );

    let state = AppState::from_config(&config);
    if !state.credentials.has_turn() {
        warn!("JAM_ROAD_TURN_HOST/JAM_ROAD_TURN_SECRET not set; /credentials serves STUN only");
    }
    let sweeper = spawn_sweeper(
        state.rooms.clone(),
        Duration::from_secs(config.sweep_interval_seconds.max(1)),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "jam-road listening");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;
    sweeper.abort();

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server stopped");
            ExitCode::FAILURE
        }
    }
}
