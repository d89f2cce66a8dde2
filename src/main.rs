//! TagSight - onboard fiducial tracking node
//!
//! Main entry point for the vision process.

use std::sync::Arc;

use tagsight::calibration::store::CalibrationStore;
use tagsight::camera::backend::GstCaptureBackend;
use tagsight::orchestrator::Orchestrator;
use tagsight::preview;
use tagsight::state::{AppConfig, AppState, ConnectionConfig};
use tagsight::telemetry::{TelemetryBus, TelemetryValue};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tagsight=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting TagSight v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!(
        connection_config = %config.connection_config_path.display(),
        calibration_file = %config.calibration_path.display(),
        bind_addr = %config.bind_addr,
        "Configuration loaded"
    );

    let connection = ConnectionConfig::load(&config.connection_config_path)?;
    tracing::info!(
        name = %connection.name,
        bus_uri = %connection.bus_uri,
        video_port = connection.video_port,
        "Connection config loaded"
    );

    // The bus URI is recorded on the bus itself so operators can see which
    // transport this node was configured for.
    let bus = Arc::new(TelemetryBus::new(&connection.name));
    bus.publish("busUri", TelemetryValue::Text(connection.bus_uri.clone()));
    tracing::info!(root = %bus.root(), "TelemetryBus initialized");

    let store = CalibrationStore::new(&config.calibration_path);
    let calibration = store.load().await;

    // Frames flow from the orchestrator to the preview server over a watch
    // channel; only the latest frame is ever kept.
    let (preview_tx, preview_rx) = watch::channel(None);

    let orchestrator = Orchestrator::new(&bus, GstCaptureBackend, store, calibration, preview_tx);
    tokio::spawn(orchestrator.run());
    tracing::info!("Orchestrator started");

    // Start preview server
    let state = AppState {
        device_name: connection.name.clone(),
        preview_rx,
    };
    let app = preview::create_router(state);

    let addr = format!("{}:{}", config.bind_addr, connection.video_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
