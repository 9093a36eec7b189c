use crate::ledger::AccessLedger;
use chrono::NaiveDate;
use crate::sink::Notification;
use facegate_core::{EnrollmentError, Gallery, GalleryError, IdentityId, PipelineError, PipelineHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facegate.Facegate1";
pub const OBJECT_PATH: &str = "/org/facegate/Facegate1";

/// Upper bound on rows returned by `RecentAccess`.
const MAX_RECENT_ACCESS: u32 = 1000;

/// D-Bus interface for the Facegate daemon.
///
/// Bus name: org.facegate.Facegate1
/// Object path: /org/facegate/Facegate1
///
/// Every method returns a JSON document; signals carry JSON payloads.
pub struct FacegateService {
    pub pipeline: PipelineHandle,
    pub gallery: Arc<Gallery>,
    pub ledger: Arc<AccessLedger>,
    pub camera_device: String,
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateService {
    /// Start enrolling `name` from the live camera. Progress arrives as
    /// `EnrollmentChanged` signals.
    async fn enroll(&self, name: &str) -> fdo::Result<String> {
        tracing::info!(name, "enroll requested");
        let session_id = self.pipeline.start_enrollment(name).await.map_err(pipeline_error)?;
        Ok(serde_json::json!({
            "session_id": session_id,
            "name": name.trim(),
        })
        .to_string())
    }

    /// Cancel the active enrollment session, if it has not reached commit.
    async fn cancel_enrollment(&self) -> fdo::Result<String> {
        tracing::info!("cancel enrollment requested");
        self.pipeline.cancel_enrollment().await.map_err(pipeline_error)?;
        Ok(serde_json::json!({ "cancelled": true }).to_string())
    }

    /// Enrolled identities, sorted by name.
    async fn list_identities(&self) -> fdo::Result<String> {
        to_json(&self.gallery.list())
    }

    /// Remove an identity and all of its reference embeddings.
    async fn remove_identity(&self, id: &str) -> fdo::Result<String> {
        tracing::info!(id, "remove identity requested");
        let removed = self
            .gallery
            .remove_identity(&IdentityId::from(id))
            .map_err(gallery_error)?;
        to_json(&removed.summary())
    }

    /// Daemon, gallery and pipeline status.
    async fn status(&self) -> fdo::Result<String> {
        let pipeline = self.pipeline.status().await.map_err(pipeline_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "models_loaded": true,
            "gallery": self.gallery.stats(),
            "enrollment": pipeline.enrollment,
            "progress": pipeline.progress,
            "stats": pipeline.stats,
        })
        .to_string())
    }

    /// The latest `limit` access events, newest first.
    async fn recent_access(&self, limit: u32) -> fdo::Result<String> {
        let events = self
            .ledger
            .recent(limit.min(MAX_RECENT_ACCESS) as usize)
            .map_err(ledger_error)?;
        to_json(&events)
    }

    /// Access events between two `YYYY-MM-DD` days inclusive, newest first.
    /// Empty strings leave the identity or either end unfiltered.
    async fn access_log(&self, identity_id: &str, from: &str, to: &str) -> fdo::Result<String> {
        let identity = (!identity_id.is_empty()).then(|| IdentityId::from(identity_id));
        let events = self
            .ledger
            .query(identity.as_ref(), parse_day(from)?, parse_day(to)?)
            .map_err(ledger_error)?;
        to_json(&events)
    }

    /// Access counts for `day` (`YYYY-MM-DD`, empty for today) and ledger totals.
    async fn access_stats(&self, day: &str) -> fdo::Result<String> {
        let day = parse_day(day)?.unwrap_or_else(|| self.ledger.today());
        let stats = self.ledger.stats(day).map_err(ledger_error)?;
        Ok(serde_json::json!({
            "day": stats.day,
            "identities": self.gallery.stats().identities,
            "accesses_on_day": stats.accesses_on_day,
            "permitted": stats.permitted(),
            "entries": stats.entries,
            "exits": stats.exits,
            "unknown": stats.unknown,
        })
        .to_string())
    }

    /// Identities whose last passage on `day` (empty for today) was an entry.
    async fn open_entries(&self, day: &str) -> fdo::Result<String> {
        let day = parse_day(day)?.unwrap_or_else(|| self.ledger.today());
        to_json(&self.ledger.open_entries(day).map_err(ledger_error)?)
    }

    /// One live match decision.
    #[zbus(signal)]
    async fn recognized(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    /// An entry, exit or unknown face written to the access ledger.
    #[zbus(signal)]
    async fn access_recorded(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    /// An enrollment session changed state.
    #[zbus(signal)]
    async fn enrollment_changed(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}

/// Emit queued sink notifications until the sink side hangs up.
pub async fn forward_signals(emitter: SignalEmitter<'static>, mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let result = match &notification {
            Notification::Recognized(payload) => FacegateService::recognized(&emitter, payload).await,
            Notification::AccessRecorded(payload) => {
                FacegateService::access_recorded(&emitter, payload).await
            }
            Notification::EnrollmentChanged(payload) => {
                FacegateService::enrollment_changed(&emitter, payload).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }
    tracing::debug!("signal forwarder stopped");
}

fn to_json(value: &impl serde::Serialize) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

/// Empty means "not given".
fn parse_day(value: &str) -> fdo::Result<Option<NaiveDate>> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date '{value}' (expected YYYY-MM-DD): {e}")))
}

fn ledger_error(err: anyhow::Error) -> fdo::Error {
    fdo::Error::Failed(format!("{err:#}"))
}

fn pipeline_error(err: PipelineError) -> fdo::Error {
    match err {
        PipelineError::Enrollment(EnrollmentError::InvalidName(msg)) => fdo::Error::InvalidArgs(msg),
        PipelineError::ChannelClosed => fdo::Error::Failed("recognition pipeline is not running".into()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn gallery_error(err: GalleryError) -> fdo::Error {
    match err {
        GalleryError::UnknownIdentity(_) | GalleryError::InvalidName(_) => {
            fdo::Error::InvalidArgs(err.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}
