use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taxi_common::config::load_dispatch_config;
use taxi_dispatch::{DispatchEngine, EngineSettings};
use taxi_geo::google::GoogleMapsProvider;
use taxi_geo::{GeoEstimator, NoRouting, RoutingProvider};

use crate::maintenance::{spawn_stats_loop, spawn_sweep_loop};
use crate::server::RelayServer;
use crate::storage::JsonFileStore;

mod http;
mod maintenance;
mod server;
mod storage;

#[derive(Parser, Debug)]
#[command(name = "taxi-relay")]
struct Args {
    #[arg(long, env = "TAXI_CONFIG", default_value = "config/dispatch.toml")]
    config: String,
    #[arg(long, env = "TAXI_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("taxi_relay={log_level},taxi_dispatch={log_level},info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_dispatch_config(&args.config)?;
    info!(
        bind = %config.bind_addr,
        http = %config.http_addr,
        radius_km = config.ride.radius_km,
        request_timeout_secs = config.ride.request_timeout_secs,
        commission_rate = config.ride.commission_rate,
        "dispatch configuration loaded"
    );

    let provider: Arc<dyn RoutingProvider> = match &config.routing.api_key {
        Some(key) => Arc::new(GoogleMapsProvider::new(
            &config.routing.base_url,
            key,
            Duration::from_millis(config.routing.timeout_ms),
        )?),
        None => {
            warn!("no maps api key configured, using straight-line estimates");
            Arc::new(NoRouting)
        }
    };
    let store = JsonFileStore::new(&config.data_dir)?;
    info!(data_dir = %store.base_path().display(), "json store opened");

    let engine = DispatchEngine::new(
        EngineSettings::from_config(&config),
        GeoEstimator::new(provider),
        Arc::new(store),
    );

    spawn_sweep_loop(
        engine.clone(),
        Duration::from_secs(config.maintenance.sweep_interval_secs),
    );
    spawn_stats_loop(
        engine.clone(),
        Duration::from_secs(config.maintenance.stats_interval_secs),
    );

    let http_addr = config.http_addr.clone();
    let http_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = http::run(&http_addr, http_engine).await {
            error!(error = %err, "http query server stopped");
        }
    });

    let server = RelayServer::new(config, engine);
    server.run().await
}
