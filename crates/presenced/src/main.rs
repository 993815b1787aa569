use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};

const BUS_NAME: &str = "org.presence.Attendance1";
const OBJECT_PATH: &str = "/org/presence/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        threshold = config.similarity_threshold,
        enroll_shots = config.enroll_shots,
        bus = ?config.bus,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config)?;

    let service = dbus_interface::AttendanceService {
        engine,
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        model_dir: config.model_dir.display().to_string(),
        db_path: config.db_path.display().to_string(),
    };

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
