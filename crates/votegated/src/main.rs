use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use votegate_core::{liveness, FaceEmbedder, Frame, Gate, LandmarkEyeDetector};

mod config;
mod dbus_interface;
mod engine;
mod sessions;

use config::{BusKind, Config};
use dbus_interface::GateService;
use sessions::SessionRegistry;

const BUS_NAME: &str = "org.votegate.Gate1";
const OBJECT_PATH: &str = "/org/votegate/Gate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("votegated starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    // Models are loaded before anything is registered on the bus.
    let embedder = FaceEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;
    let gate = match config.distance_threshold {
        Some(threshold) => Gate::with_threshold(embedder, threshold),
        None => Gate::new(embedder),
    };
    tracing::info!(
        model = gate.model_id(),
        threshold = gate.threshold(),
        "face pipeline ready"
    );

    let eye_detector = LandmarkEyeDetector::default();
    let engine = engine::spawn_engine(
        gate,
        move |embedder: &mut FaceEmbedder, frame: &Frame| {
            liveness::eyes_detected(frame, embedder.locator(), &eye_detector)
        },
        config.extract_timeout(),
    )
    .context("failed to start engine")?;

    let store_path = config.db_path.clone();
    votegate_store::prepare_dir(&store_path).context("failed to create database directory")?;
    let db = tokio_rusqlite::Connection::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", store_path.display()))?;
    db.call(|conn| Ok(votegate_store::migrate(conn)))
        .await
        .context("database thread failed")?
        .context("failed to migrate database")?;
    tracing::info!(path = %store_path.display(), "store opened");

    let liveness_window = config.require_blink.then(|| config.liveness_window());
    if config.require_blink {
        tracing::info!(
            window_secs = config.liveness_window_secs,
            "liveness required: Verify and CastVote need a recent blink"
        );
    } else {
        tracing::info!("liveness advisory: Verify and CastVote do not require a blink");
    }

    let service = GateService::new(
        engine,
        db,
        SessionRegistry::new(config.liveness_session_ttl()),
        liveness_window,
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "votegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("votegated shutting down");

    Ok(())
}
