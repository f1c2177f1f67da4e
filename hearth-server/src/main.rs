//! hearth server
//!
//! Self-hosted backend for a fleet of reflashed smart thermostats. Devices
//! check in, write versioned state objects, and hold long polls here; per
//! user, state fans out to MQTT with Home Assistant discovery.

use clap::Parser;
use hearth_core::{
    AvailabilityWatchdog, DeviceStateService, IntegrationManager, Reconciler, StateStore,
    SubscriptionManager, WeatherCache,
};
use hearth_mqtt::MqttBridgeFactory;
use hearth_server::config::ServerConfig;
use hearth_server::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hearth-server", about = "Self-hosted thermostat fleet backend")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hearth.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        ServerConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        ServerConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.database_path = database;
    }

    tracing::info!("Starting hearth server on {}", cfg.listen_addr);

    let store = Arc::new(StateStore::open(&cfg.database_path)?);
    let subscriptions = SubscriptionManager::new();

    let watchdog = AvailabilityWatchdog::new(
        Duration::from_millis(cfg.availability_timeout_ms),
        Duration::from_millis(cfg.availability_check_interval_ms),
    );
    {
        let subscriptions = Arc::clone(&subscriptions);
        watchdog.set_active_serials_source(move || subscriptions.active_serials());
    }
    let (availability_tx, availability_rx) = mpsc::unbounded_channel();
    watchdog.set_change_handler(move |serial, available| {
        tracing::info!(
            "Device {} {}",
            serial,
            if available { "online" } else { "offline" }
        );
        let _ = availability_tx.send((serial.to_string(), available));
    });
    watchdog.start();

    let service = DeviceStateService::new(
        Arc::clone(&store),
        Arc::clone(&watchdog),
        Arc::clone(&subscriptions),
    );
    let weather = Arc::new(WeatherCache::new(Arc::clone(&store)));

    let reconciler = Reconciler::new(Arc::clone(&service), Arc::clone(&weather));
    let reconcile_task = reconciler.spawn(service.subscribe_changes());

    let integrations = IntegrationManager::new(Arc::clone(&store));
    integrations.register_factory(Arc::new(MqttBridgeFactory::new(
        Arc::clone(&service),
        cfg.default_broker_url.clone(),
    )));
    integrations.start_all().await;
    let dispatcher_task =
        integrations.spawn_dispatcher(service.subscribe_changes(), availability_rx);

    let cfg = Arc::new(cfg);
    let state = AppState {
        config: Arc::clone(&cfg),
        service,
        weather,
    };
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    watchdog.stop();
    subscriptions.cancel_all();
    reconcile_task.abort();
    dispatcher_task.abort();
    integrations.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
