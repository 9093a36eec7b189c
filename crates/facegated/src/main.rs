use anyhow::{Context, Result};
use chrono::Offset;
use facegate_core::pipeline::{self, PipelineParts};
use facegate_core::{ArcFaceEmbedder, CosineMatcher, Gallery, ScrfdDetector};
use facegate_hw::CameraSource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod attendance;
mod config;
mod dbus_interface;
mod ledger;
mod sink;
mod store;

use attendance::{AttendanceConfig, AttendancePolicy};
use config::Config;
use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};
use ledger::AccessLedger;
use sink::DaemonSink;
use store::SqliteStore;

/// Pending D-Bus signals; the sink drops new ones when this is full.
const SIGNAL_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open gallery database {}", config.db_path.display()))?;
    let gallery = Arc::new(
        Gallery::open(store)
            .context("failed to load gallery")?
            .with_max_embeddings(config.max_embeddings_per_identity),
    );
    // Day boundaries use the local offset at startup.
    let offset = chrono::Local::now().offset().fix();
    let ledger = Arc::new(
        AccessLedger::open(&config.db_path)
            .context("failed to open access ledger")?
            .with_offset(offset),
    );

    let detector = ScrfdDetector::load(&config.scrfd_model_path(), config.detection_confidence_min)
        .context("failed to load SCRFD detection model")?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())
        .context("failed to load ArcFace recognition model")?;
    let matcher = CosineMatcher::new(
        config.accept_threshold,
        config.reject_threshold,
        config.ambiguity_epsilon,
    )
    .context("invalid matcher thresholds")?;
    tracing::info!(model_dir = %config.model_dir.display(), "models loaded");

    let camera = CameraSource::open(&config.camera_device, config.camera_config())
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let attendance = AttendanceConfig {
        confirm_frames: config.access_confirm_frames,
        reentry: chrono::Duration::seconds(config.access_reentry_secs as i64),
        unknown_interval: chrono::Duration::seconds(config.unknown_log_interval_secs as i64),
        offset,
    };
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    let sink = DaemonSink::new(AttendancePolicy::new(attendance), Arc::clone(&ledger), signal_tx);

    let (handle, running) = pipeline::spawn(
        config.pipeline_config(),
        PipelineParts {
            source: Box::new(camera),
            detector: Box::new(detector),
            embedder: Box::new(embedder),
            matcher: Box::new(matcher),
            gallery: Arc::clone(&gallery),
            sink: Box::new(sink),
        },
    )
    .context("failed to start recognition pipeline")?;

    let service = FacegateService {
        pipeline: handle.clone(),
        gallery,
        ledger,
        camera_device: config.camera_device.clone(),
    };
    let builder = if config.use_session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    let emitter = SignalEmitter::new(&connection, OBJECT_PATH)?;
    let forwarder = tokio::spawn(dbus_interface::forward_signals(emitter, signal_rx));

    tracing::info!(
        bus = BUS_NAME,
        session_bus = config.use_session_bus,
        camera = %config.camera_device,
        "facegated ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    handle.shutdown();
    tokio::task::spawn_blocking(move || running.join())
        .await
        .context("pipeline join task failed")?
        .context("pipeline stopped with an error")?;
    // The sink, and with it the signal sender, is gone once the pipeline joins.
    forwarder.await.context("signal forwarder failed")?;

    let stats = handle.stats();
    tracing::info!(
        frames = stats.frames_processed,
        recognitions = stats.recognitions_emitted,
        dropped = stats.frames_dropped,
        "facegated stopped"
    );
    Ok(())
}
