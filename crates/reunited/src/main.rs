use anyhow::{Context, Result};
use reunite_models::OnnxExtractor;
use reunite_store::SqliteGallery;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod response;

const BUS_NAME: &str = "org.reunite.Gallery1";
const OBJECT_PATH: &str = "/org/reunite/Gallery1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "reunited starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        media = %config.media_dir.display(),
        models = %config.model_dir.display(),
        threshold = config.match_config().threshold,
        policy = ?config.match_policy,
        metric = ?config.distance_metric,
        "configuration loaded"
    );

    let store = SqliteGallery::open(&config.db_path, config.media_dir.clone())
        .with_context(|| format!("failed to open gallery at {}", config.db_path.display()))?;
    let extractor = OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?
        .with_max_faces(config.max_faces);

    let engine = engine::EngineHandle::new(Arc::new(store), Arc::new(extractor), &config);
    let service = dbus_interface::GalleryService::new(engine);

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "reunited ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("reunited shutting down");

    Ok(())
}
