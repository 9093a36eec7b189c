//! Daemon result sink: logs every outcome, applies the attendance policy,
//! writes the access ledger and queues D-Bus signals.

use crate::attendance::{AccessDecision, AttendancePolicy};
use crate::ledger::AccessLedger;
use facegate_core::{Decision, EnrollmentEvent, Recognition, ResultSink};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Signals waiting to be emitted on the bus. Payloads are JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Recognized(String),
    AccessRecorded(String),
    EnrollmentChanged(String),
}

pub struct DaemonSink {
    policy: AttendancePolicy,
    ledger: Arc<AccessLedger>,
    signals: mpsc::Sender<Notification>,
}

impl DaemonSink {
    pub fn new(
        policy: AttendancePolicy,
        ledger: Arc<AccessLedger>,
        signals: mpsc::Sender<Notification>,
    ) -> Self {
        Self { policy, ledger, signals }
    }

    /// Never blocks the sink thread; signals are dropped when nobody drains them.
    fn notify(&self, make: fn(String) -> Notification, payload: &impl Serialize) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize signal payload");
                return;
            }
        };
        match self.signals.try_send(make(json)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("signal queue full, dropping notification"),
        }
    }

    fn apply_attendance(&mut self, recognition: &Recognition) {
        if let Some(candidate) = &recognition.result.identity {
            if self.policy.needs_history(&candidate.identity_id) {
                match self.ledger.last_for(&candidate.identity_id) {
                    Ok(last) => self.policy.seed(candidate.identity_id.clone(), last),
                    Err(e) => {
                        tracing::error!(identity = %candidate.identity_id, error = %e, "failed to read access history");
                        return;
                    }
                }
            }
        }

        match self.policy.observe(recognition) {
            Some(AccessDecision::Record(pending)) => match self.ledger.record(&pending) {
                Ok(id) => {
                    self.policy.commit(&pending);
                    tracing::info!(
                        event_id = id,
                        kind = %pending.kind,
                        name = pending.name.as_deref().unwrap_or("-"),
                        score = pending.score,
                        "access recorded"
                    );
                    self.notify(Notification::AccessRecorded, &pending);
                }
                Err(e) => {
                    tracing::error!(kind = %pending.kind, error = %e, "failed to record access event; will retry on the next confirmation")
                }
            },
            Some(AccessDecision::Debounced { identity_id, since_last }) => {
                tracing::debug!(
                    identity = %identity_id,
                    since_last_secs = since_last.num_seconds(),
                    "recognized again within re-entry window, not recorded"
                );
            }
            None => {}
        }
    }
}

impl ResultSink for DaemonSink {
    fn on_recognition(&mut self, recognition: &Recognition) {
        let result = &recognition.result;
        match (result.decision, &result.identity) {
            (Decision::Accept, Some(candidate)) => tracing::debug!(
                seq = recognition.frame_sequence,
                name = %candidate.name,
                score = candidate.score,
                "face accepted"
            ),
            _ => tracing::debug!(
                seq = recognition.frame_sequence,
                decision = ?result.decision,
                score = result.score,
                runner_up = ?result.runner_up_score,
                "face not accepted"
            ),
        }

        self.apply_attendance(recognition);
        self.notify(Notification::Recognized, recognition);
    }

    fn on_enrollment(&mut self, event: &EnrollmentEvent) {
        tracing::info!(
            session = %event.session_id,
            name = %event.name,
            from = ?event.from.kind(),
            to = ?event.to.kind(),
            samples = event.accepted_samples,
            required = event.required_samples,
            "enrollment state changed"
        );
        self.notify(Notification::EnrollmentChanged, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::{AccessKind, AttendanceConfig};
    use chrono::{Duration, FixedOffset, TimeZone, Utc};
    use facegate_core::{Candidate, Detection, IdentityId, MatchResult};
    use tempfile::TempDir;

    fn recognition(decision: Decision, seconds: i64) -> Recognition {
        let alice = Candidate {
            identity_id: IdentityId::from("id-alice"),
            name: "alice".to_string(),
            score: 0.7,
        };
        Recognition {
            frame_sequence: seconds as u64,
            captured_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::seconds(seconds),
            detection: Detection {
                x: 10.0,
                y: 10.0,
                width: 150.0,
                height: 150.0,
                confidence: 0.95,
                landmarks: None,
            },
            result: MatchResult {
                decision,
                identity: (decision == Decision::Accept).then(|| alice.clone()),
                best: Some(alice),
                score: 0.7,
                runner_up_score: None,
            },
        }
    }

    fn sink(dir: &TempDir, capacity: usize) -> (DaemonSink, Arc<AccessLedger>, mpsc::Receiver<Notification>) {
        let ledger = Arc::new(AccessLedger::open(&dir.path().join("facegate.db")).unwrap());
        let policy = AttendancePolicy::new(AttendanceConfig {
            confirm_frames: 2,
            reentry: Duration::seconds(60),
            unknown_interval: Duration::seconds(10),
            offset: FixedOffset::east_opt(0).unwrap(),
        });
        let (tx, rx) = mpsc::channel(capacity);
        (DaemonSink::new(policy, Arc::clone(&ledger), tx), ledger, rx)
    }

    #[test]
    fn test_confirmed_recognition_is_recorded_and_signalled() {
        let dir = TempDir::new().unwrap();
        let (mut sink, ledger, mut rx) = sink(&dir, 16);

        sink.on_recognition(&recognition(Decision::Accept, 0));
        sink.on_recognition(&recognition(Decision::Accept, 1));

        let events = ledger.recent(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AccessKind::Entry);
        assert_eq!(events[0].name.as_deref(), Some("alice"));

        let mut notifications = Vec::new();
        while let Ok(n) = rx.try_recv() {
            notifications.push(n);
        }
        assert_eq!(notifications.len(), 3);
        assert!(matches!(notifications[0], Notification::Recognized(_)));
        let Notification::AccessRecorded(json) = &notifications[1] else {
            panic!("expected access notification, got {:?}", notifications[1]);
        };
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["kind"], "entry");
    }

    #[test]
    fn test_unknown_face_logged_once_per_interval() {
        let dir = TempDir::new().unwrap();
        let (mut sink, ledger, _rx) = sink(&dir, 16);

        for second in 0..5 {
            sink.on_recognition(&recognition(Decision::Reject, second));
        }

        let events = ledger.recent(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AccessKind::Unknown);
        assert_eq!(events[0].identity_id, None);
    }

    #[test]
    fn test_failed_write_does_not_advance_attendance() {
        let dir = TempDir::new().unwrap();
        let (mut sink, ledger, _rx) = sink(&dir, 16);
        let side = rusqlite::Connection::open(dir.path().join("facegate.db")).unwrap();
        side.execute_batch(
            "CREATE TRIGGER reject_access BEFORE INSERT ON access_events
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        sink.on_recognition(&recognition(Decision::Accept, 0));
        sink.on_recognition(&recognition(Decision::Accept, 1));
        assert!(ledger.recent(10).unwrap().is_empty());

        side.execute_batch("DROP TRIGGER reject_access").unwrap();
        sink.on_recognition(&recognition(Decision::Accept, 120));
        sink.on_recognition(&recognition(Decision::Accept, 121));

        let events = ledger.recent(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AccessKind::Entry);
    }

    #[test]
    fn test_full_signal_queue_does_not_block() {
        let dir = TempDir::new().unwrap();
        let (mut sink, ledger, _rx) = sink(&dir, 1);

        for second in 0..4 {
            sink.on_recognition(&recognition(Decision::Accept, second));
        }
        assert_eq!(ledger.recent(10).unwrap().len(), 1);
    }
}
