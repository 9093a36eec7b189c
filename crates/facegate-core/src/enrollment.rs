//! Enrollment controller: collect face samples for one person, validate them
//! and commit the resulting embeddings to the gallery.
//!
//! ```text
//! Idle ──start──▶ Collecting ──N samples──▶ Validating ──▶ Committing ──▶ Completed
//!                     │                        │  │             │
//!                     └──cancel──▶ Cancelled ◀─┘  └──▶ Failed ◀─┘
//! ```
//!
//! Terminal states accept a new `start`. Every state change goes through
//! one private `advance` step, which consults the transition table and
//! records an [`EnrollmentEvent`].

use crate::alignment::FaceCrop;
use crate::detector::{DetectionFilter, FaceDetector};
use crate::embedder::FaceEmbedder;
use crate::gallery::{CandidateEmbedding, Gallery, IdentityId, ReenrollPolicy};
use crate::quality::QualityFilter;
use crate::types::{Embedding, Frame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Idle,
    Collecting,
    Validating,
    Committing,
    Completed,
    Cancelled,
    Failed,
}

/// Allowed `(from, to)` transitions.
const TRANSITIONS: &[(StateKind, StateKind)] = &[
    (StateKind::Idle, StateKind::Collecting),
    (StateKind::Completed, StateKind::Collecting),
    (StateKind::Cancelled, StateKind::Collecting),
    (StateKind::Failed, StateKind::Collecting),
    (StateKind::Collecting, StateKind::Validating),
    (StateKind::Collecting, StateKind::Cancelled),
    (StateKind::Validating, StateKind::Committing),
    (StateKind::Validating, StateKind::Cancelled),
    (StateKind::Validating, StateKind::Failed),
    (StateKind::Committing, StateKind::Completed),
    (StateKind::Committing, StateKind::Failed),
];

/// Why a session ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrollmentFailure {
    #[error("only {valid} of {required} required samples produced an embedding")]
    TooFewValidSamples { valid: usize, required: usize },
    #[error("samples are inconsistent (consistency {consistency:.3} < {required:.3})")]
    InconsistentEnrollment { consistency: f32, required: f32 },
    #[error("gallery commit failed: {message}")]
    CommitFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EnrollmentState {
    Idle,
    Collecting,
    Validating,
    Committing,
    Completed { identity_id: IdentityId },
    Cancelled,
    Failed { reason: EnrollmentFailure },
}

impl EnrollmentState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::Collecting => StateKind::Collecting,
            Self::Validating => StateKind::Validating,
            Self::Committing => StateKind::Committing,
            Self::Completed { .. } => StateKind::Completed,
            Self::Cancelled => StateKind::Cancelled,
            Self::Failed { .. } => StateKind::Failed,
        }
    }

    pub fn can_transition_to(&self, next: &EnrollmentState) -> bool {
        TRANSITIONS.contains(&(self.kind(), next.kind()))
    }

    /// A session is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Collecting | Self::Validating | Self::Committing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Cancelled | Self::Failed { .. })
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum EnrollmentError {
    #[error("an enrollment session is already active")]
    SessionAlreadyActive,
    #[error("no active enrollment session")]
    NoActiveSession,
    #[error("enrollment cannot be cancelled while {0:?}")]
    NotCancellable(StateKind),
    #[error("invalid enrollment transition {from:?} -> {to:?}")]
    InvalidTransition { from: StateKind, to: StateKind },
    #[error("{operation} is not valid while {state:?}")]
    WrongState { operation: &'static str, state: StateKind },
    #[error("invalid enrollment name: {0}")]
    InvalidName(String),
    #[error("invalid enrollment configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrollmentConfig {
    pub sample_count: usize,
    pub min_valid_samples: usize,
    pub consistency_min: f32,
    pub quality: QualityFilter,
    pub detection: DetectionFilter,
    pub reenroll_policy: ReenrollPolicy,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            sample_count: 5,
            min_valid_samples: 3,
            consistency_min: 0.45,
            quality: QualityFilter::default(),
            detection: DetectionFilter::default(),
            reenroll_policy: ReenrollPolicy::Replace,
        }
    }
}

impl EnrollmentConfig {
    pub fn validate(&self) -> Result<(), EnrollmentError> {
        if self.sample_count == 0 {
            return Err(EnrollmentError::InvalidConfig("sample count must be at least 1".into()));
        }
        if self.min_valid_samples == 0 || self.min_valid_samples > self.sample_count {
            return Err(EnrollmentError::InvalidConfig(format!(
                "min valid samples must be in 1..={}, got {}",
                self.sample_count, self.min_valid_samples
            )));
        }
        Ok(())
    }
}

/// Per-session tallies of frames that did not yield a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounters {
    pub frames_seen: u64,
    pub no_face: u64,
    pub multiple_faces: u64,
    pub low_quality: u64,
    pub unusable_crop: u64,
    pub detector_errors: u64,
    pub embed_failures: u64,
}

#[derive(Debug, Clone)]
struct Sample {
    crop: FaceCrop,
    quality: f32,
    captured_at: DateTime<Utc>,
}

/// State of one enrollment attempt.
#[derive(Debug, Clone)]
pub struct EnrollmentSession {
    pub id: Uuid,
    pub name: String,
    pub required_samples: usize,
    pub counters: SampleCounters,
    pub started_at: DateTime<Utc>,
    samples: Vec<Sample>,
    embeddings: Vec<CandidateEmbedding>,
}

impl EnrollmentSession {
    fn new(name: String, required_samples: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            required_samples,
            counters: SampleCounters::default(),
            started_at: Utc::now(),
            samples: Vec::with_capacity(required_samples),
            embeddings: Vec::new(),
        }
    }

    pub fn accepted_samples(&self) -> usize {
        self.samples.len()
    }
}

/// What happened to one frame fed to a collecting session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedOutcome {
    Accepted { collected: usize, required: usize },
    NoFace,
    MultipleFaces(usize),
    LowQuality(f32),
    UnusableCrop,
    DetectorError,
}

/// Emitted on every state change. Delivered to the sink in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentEvent {
    pub session_id: Uuid,
    pub name: String,
    pub from: EnrollmentState,
    pub to: EnrollmentState,
    pub accepted_samples: usize,
    pub required_samples: usize,
    pub counters: SampleCounters,
    pub at: DateTime<Utc>,
}

pub struct EnrollmentController {
    config: EnrollmentConfig,
    state: EnrollmentState,
    session: Option<EnrollmentSession>,
    events: Vec<EnrollmentEvent>,
}

impl EnrollmentController {
    pub fn new(config: EnrollmentConfig) -> Result<Self, EnrollmentError> {
        config.validate()?;
        Ok(Self {
            config,
            state: EnrollmentState::Idle,
            session: None,
            events: Vec::new(),
        })
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    pub fn session(&self) -> Option<&EnrollmentSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Begin a session for `name`. Allowed from `Idle` or any terminal state.
    pub fn start(&mut self, name: &str) -> Result<Uuid, EnrollmentError> {
        if self.state.is_active() {
            return Err(EnrollmentError::SessionAlreadyActive);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollmentError::InvalidName("name is empty".into()));
        }

        let session = EnrollmentSession::new(name.to_string(), self.config.sample_count);
        let id = session.id;
        self.session = Some(session);
        self.advance(EnrollmentState::Collecting)?;
        Ok(id)
    }

    /// Offer one frame to a collecting session.
    ///
    /// Frames with zero or several qualifying faces, or a face that fails the
    /// quality filter, are counted and skipped. Reaching the sample count
    /// moves the session to `Validating`.
    pub fn feed(
        &mut self,
        frame: &Frame,
        detector: &mut dyn FaceDetector,
    ) -> Result<FeedOutcome, EnrollmentError> {
        self.expect_state(StateKind::Collecting, "feed")?;
        let filter = self.config.detection;
        let quality = self.config.quality;
        let session = self.session.as_mut().ok_or(EnrollmentError::NoActiveSession)?;
        session.counters.frames_seen += 1;

        let detections = match detector.detect(frame) {
            Ok(d) => filter.apply(d),
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "enrollment frame skipped: detector error");
                session.counters.detector_errors += 1;
                return Ok(FeedOutcome::DetectorError);
            }
        };

        let detection = match detections.as_slice() {
            [] => {
                session.counters.no_face += 1;
                return Ok(FeedOutcome::NoFace);
            }
            [only] => only,
            many => {
                session.counters.multiple_faces += 1;
                tracing::debug!(faces = many.len(), "enrollment frame skipped: multiple faces");
                return Ok(FeedOutcome::MultipleFaces(many.len()));
            }
        };

        let Some(crop) = FaceCrop::from_detection(frame, detection) else {
            session.counters.unusable_crop += 1;
            return Ok(FeedOutcome::UnusableCrop);
        };

        let report = quality.assess(detection, &crop);
        if !quality.passes(&report) {
            session.counters.low_quality += 1;
            tracing::debug!(score = report.score(), ?report, "enrollment sample below quality floor");
            return Ok(FeedOutcome::LowQuality(report.score()));
        }

        session.samples.push(Sample {
            crop,
            quality: report.score(),
            captured_at: frame.captured_at,
        });
        let collected = session.samples.len();
        let required = session.required_samples;
        tracing::info!(
            name = %session.name,
            collected,
            required,
            quality = report.score(),
            "enrollment sample accepted"
        );

        if collected >= required {
            self.advance(EnrollmentState::Validating)?;
        }
        Ok(FeedOutcome::Accepted { collected, required })
    }

    /// Embed the collected samples and check they agree with each other.
    pub fn validate(&mut self, embedder: &mut dyn FaceEmbedder) -> Result<&EnrollmentState, EnrollmentError> {
        self.expect_state(StateKind::Validating, "validate")?;
        let session = self.session.as_mut().ok_or(EnrollmentError::NoActiveSession)?;

        let mut embeddings = Vec::with_capacity(session.samples.len());
        for sample in &session.samples {
            match embedder.embed(&sample.crop) {
                Ok(embedding) => embeddings.push(CandidateEmbedding {
                    embedding,
                    quality: sample.quality,
                    captured_at: sample.captured_at,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "enrollment sample could not be embedded");
                    session.counters.embed_failures += 1;
                }
            }
        }

        let min_valid = self.config.min_valid_samples;
        let consistency_min = self.config.consistency_min;

        let next = if embeddings.len() < min_valid {
            EnrollmentState::Failed {
                reason: EnrollmentFailure::TooFewValidSamples {
                    valid: embeddings.len(),
                    required: min_valid,
                },
            }
        } else {
            let vectors: Vec<&Embedding> = embeddings.iter().map(|c| &c.embedding).collect();
            let consistency = consistency_score(&vectors);
            tracing::debug!(consistency, samples = vectors.len(), "enrollment consistency");
            if consistency < consistency_min {
                EnrollmentState::Failed {
                    reason: EnrollmentFailure::InconsistentEnrollment {
                        consistency,
                        required: consistency_min,
                    },
                }
            } else {
                EnrollmentState::Committing
            }
        };

        session.embeddings = embeddings;
        self.advance(next)?;
        Ok(&self.state)
    }

    /// Write the validated embeddings to the gallery in one store call.
    pub fn commit(&mut self, gallery: &Gallery) -> Result<&EnrollmentState, EnrollmentError> {
        self.expect_state(StateKind::Committing, "commit")?;
        let session = self.session.as_mut().ok_or(EnrollmentError::NoActiveSession)?;
        let embeddings = std::mem::take(&mut session.embeddings);

        let next = match gallery.commit_enrollment(&session.name, embeddings, self.config.reenroll_policy) {
            Ok(identity) => EnrollmentState::Completed { identity_id: identity.id().clone() },
            Err(e) => {
                tracing::error!(name = %session.name, error = %e, "enrollment commit failed");
                EnrollmentState::Failed {
                    reason: EnrollmentFailure::CommitFailed { message: e.to_string() },
                }
            }
        };
        self.advance(next)?;
        Ok(&self.state)
    }

    /// Abort a collecting or validating session. The gallery is not touched.
    pub fn cancel(&mut self) -> Result<(), EnrollmentError> {
        match self.state.kind() {
            StateKind::Collecting | StateKind::Validating => self.advance(EnrollmentState::Cancelled),
            StateKind::Idle => Err(EnrollmentError::NoActiveSession),
            other => Err(EnrollmentError::NotCancellable(other)),
        }
    }

    /// State-change events recorded since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<EnrollmentEvent> {
        std::mem::take(&mut self.events)
    }

    fn expect_state(&self, kind: StateKind, operation: &'static str) -> Result<(), EnrollmentError> {
        match self.state.kind() {
            k if k == kind => Ok(()),
            StateKind::Idle => Err(EnrollmentError::NoActiveSession),
            state => Err(EnrollmentError::WrongState { operation, state }),
        }
    }

    /// The single place where the state changes.
    fn advance(&mut self, next: EnrollmentState) -> Result<(), EnrollmentError> {
        if !self.state.can_transition_to(&next) {
            return Err(EnrollmentError::InvalidTransition {
                from: self.state.kind(),
                to: next.kind(),
            });
        }
        let session = self.session.as_ref().ok_or(EnrollmentError::NoActiveSession)?;

        let event = EnrollmentEvent {
            session_id: session.id,
            name: session.name.clone(),
            from: self.state.clone(),
            to: next.clone(),
            accepted_samples: session.samples.len(),
            required_samples: session.required_samples,
            counters: session.counters,
            at: Utc::now(),
        };
        tracing::info!(
            session = %event.session_id,
            name = %event.name,
            from = ?event.from.kind(),
            to = ?event.to.kind(),
            "enrollment state changed"
        );

        self.events.push(event);
        self.state = next;
        if self.state.is_terminal() {
            self.session = None;
        }
        Ok(())
    }
}

/// Least-consistent sample's mean cosine similarity to the other samples.
/// A single sample is trivially consistent.
pub fn consistency_score(embeddings: &[&Embedding]) -> f32 {
    let n = embeddings.len();
    if n < 2 {
        return 1.0;
    }
    (0..n)
        .map(|i| {
            let total: f32 = (0..n)
                .filter(|&j| j != i)
                .map(|j| embeddings[i].similarity(embeddings[j]))
                .sum();
            total / (n - 1) as f32
        })
        .fold(f32::INFINITY, f32::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::ALIGNED_SIZE;
    use crate::detector::DetectorError;
    use crate::embedder::EmbedderError;
    use crate::gallery::MemoryStore;
    use crate::types::Detection;
    use std::collections::VecDeque;

    const W: u32 = 320;
    const H: u32 = 240;

    fn textured_frame(sequence: u64) -> Frame {
        let data = (0..H)
            .flat_map(|y| (0..W).map(move |x| if (x / 3 + y / 3) % 2 == 0 { 60 } else { 190 }))
            .collect();
        Frame::new(data, W, H, sequence)
    }

    fn face() -> Detection {
        Detection {
            x: 60.0,
            y: 20.0,
            width: 200.0,
            height: 200.0,
            confidence: 0.95,
            landmarks: None,
        }
    }

    /// Returns the scripted detections for each call in turn, then no faces.
    struct ScriptedDetector(VecDeque<Result<Vec<Detection>, DetectorError>>);

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            self.0.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    struct ScriptedEmbedder(VecDeque<Result<Vec<f32>, ()>>);

    impl FaceEmbedder for ScriptedEmbedder {
        fn dimension(&self) -> usize {
            2
        }

        fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError> {
            assert_eq!(crop.width, ALIGNED_SIZE);
            match self.0.pop_front() {
                Some(Ok(v)) => Ok(Embedding::new(v)),
                Some(Err(())) => Err(EmbedderError::InferenceFailed("scripted".into())),
                None => Ok(Embedding::new(vec![1.0, 0.0])),
            }
        }
    }

    fn controller() -> EnrollmentController {
        EnrollmentController::new(EnrollmentConfig::default()).unwrap()
    }

    fn collect_all(ctl: &mut EnrollmentController) {
        let mut detector = ScriptedDetector((0..5).map(|_| Ok(vec![face()])).collect());
        for seq in 0..5 {
            ctl.feed(&textured_frame(seq), &mut detector).unwrap();
        }
        assert_eq!(ctl.state(), &EnrollmentState::Validating);
    }

    #[test]
    fn test_transition_table() {
        use EnrollmentState::*;
        assert!(Idle.can_transition_to(&Collecting));
        assert!(Collecting.can_transition_to(&Cancelled));
        assert!(Validating.can_transition_to(&Cancelled));
        assert!(!Committing.can_transition_to(&Cancelled));
        assert!(!Idle.can_transition_to(&Completed { identity_id: IdentityId::from("x") }));
        assert!(!Collecting.can_transition_to(&Committing));
        assert!(Cancelled.can_transition_to(&Collecting));
    }

    #[test]
    fn test_full_session_commits_identity() {
        let gallery = Gallery::open(MemoryStore::new()).unwrap();
        let mut ctl = controller();
        ctl.start("alice").unwrap();
        collect_all(&mut ctl);

        ctl.validate(&mut ScriptedEmbedder(VecDeque::new())).unwrap();
        assert_eq!(ctl.state(), &EnrollmentState::Committing);
        let state = ctl.commit(&gallery).unwrap().clone();

        let EnrollmentState::Completed { identity_id } = state else {
            panic!("expected Completed, got {state:?}");
        };
        let alice = gallery.get(&identity_id).unwrap();
        assert_eq!(alice.name(), "alice");
        assert_eq!(alice.embeddings().len(), 5);

        let kinds: Vec<_> = ctl.drain_events().into_iter().map(|e| e.to.kind()).collect();
        assert_eq!(
            kinds,
            vec![StateKind::Collecting, StateKind::Validating, StateKind::Committing, StateKind::Completed]
        );
        assert!(ctl.drain_events().is_empty());
        assert!(ctl.session().is_none());
    }

    #[test]
    fn test_rejected_frames_are_counted() {
        let mut ctl = controller();
        ctl.start("bob").unwrap();
        let mut second = face();
        second.x = 0.0;
        second.width = 90.0;
        second.height = 90.0;
        let mut detector = ScriptedDetector(VecDeque::from(vec![
            Ok(vec![]),
            Ok(vec![face(), second]),
            Err(DetectorError::InferenceFailed("boom".into())),
            Ok(vec![face()]),
        ]));

        assert_eq!(ctl.feed(&textured_frame(0), &mut detector).unwrap(), FeedOutcome::NoFace);
        assert_eq!(ctl.feed(&textured_frame(1), &mut detector).unwrap(), FeedOutcome::MultipleFaces(2));
        assert_eq!(ctl.feed(&textured_frame(2), &mut detector).unwrap(), FeedOutcome::DetectorError);
        assert_eq!(
            ctl.feed(&textured_frame(3), &mut detector).unwrap(),
            FeedOutcome::Accepted { collected: 1, required: 5 }
        );

        let session = ctl.session().unwrap();
        assert_eq!(session.counters.frames_seen, 4);
        assert_eq!(session.counters.no_face, 1);
        assert_eq!(session.counters.multiple_faces, 1);
        assert_eq!(session.counters.detector_errors, 1);
        assert_eq!(ctl.state(), &EnrollmentState::Collecting);
    }

    #[test]
    fn test_small_face_not_counted_as_second_face() {
        let mut ctl = controller();
        ctl.start("bob").unwrap();
        let mut tiny = face();
        tiny.width = 30.0;
        tiny.height = 30.0;
        let mut detector = ScriptedDetector(VecDeque::from(vec![Ok(vec![face(), tiny])]));
        assert!(matches!(
            ctl.feed(&textured_frame(0), &mut detector).unwrap(),
            FeedOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn test_flat_frame_fails_quality() {
        let mut ctl = controller();
        ctl.start("bob").unwrap();
        let flat = Frame::new(vec![128; (W * H) as usize], W, H, 0);
        let mut detector = ScriptedDetector(VecDeque::from(vec![Ok(vec![face()])]));
        assert!(matches!(ctl.feed(&flat, &mut detector).unwrap(), FeedOutcome::LowQuality(_)));
        assert_eq!(ctl.session().unwrap().counters.low_quality, 1);
    }

    #[test]
    fn test_too_few_valid_samples_fails() {
        let mut ctl = controller();
        ctl.start("carol").unwrap();
        collect_all(&mut ctl);

        let mut embedder = ScriptedEmbedder(VecDeque::from(vec![
            Err(()),
            Err(()),
            Err(()),
            Ok(vec![1.0, 0.0]),
            Ok(vec![1.0, 0.0]),
        ]));
        let state = ctl.validate(&mut embedder).unwrap().clone();
        assert_eq!(
            state,
            EnrollmentState::Failed {
                reason: EnrollmentFailure::TooFewValidSamples { valid: 2, required: 3 }
            }
        );
        assert!(ctl.session().is_none());
    }

    #[test]
    fn test_inconsistent_samples_fail() {
        let mut ctl = controller();
        ctl.start("dave").unwrap();
        collect_all(&mut ctl);

        let mut embedder = ScriptedEmbedder(VecDeque::from(vec![
            Ok(vec![1.0, 0.0]),
            Ok(vec![0.0, 1.0]),
            Ok(vec![-1.0, 0.0]),
            Ok(vec![0.0, -1.0]),
            Ok(vec![1.0, 0.0]),
        ]));
        let state = ctl.validate(&mut embedder).unwrap();
        assert!(matches!(
            state,
            EnrollmentState::Failed { reason: EnrollmentFailure::InconsistentEnrollment { .. } }
        ));
    }

    #[test]
    fn test_commit_failure_leaves_gallery_empty() {
        let store = MemoryStore::new();
        let gallery = Gallery::open(store.clone()).unwrap();
        let mut ctl = controller();
        ctl.start("erin").unwrap();
        collect_all(&mut ctl);
        ctl.validate(&mut ScriptedEmbedder(VecDeque::new())).unwrap();

        store.fail_writes(true);
        let state = ctl.commit(&gallery).unwrap();
        assert!(matches!(
            state,
            EnrollmentState::Failed { reason: EnrollmentFailure::CommitFailed { .. } }
        ));
        assert!(gallery.find_by_name("erin").is_none());
        assert!(store.rows().is_empty());
    }

    #[test]
    fn test_cancel_rules() {
        let mut ctl = controller();
        assert_eq!(ctl.cancel(), Err(EnrollmentError::NoActiveSession));

        ctl.start("frank").unwrap();
        assert_eq!(ctl.start("frank"), Err(EnrollmentError::SessionAlreadyActive));
        ctl.cancel().unwrap();
        assert_eq!(ctl.state(), &EnrollmentState::Cancelled);
        assert_eq!(ctl.cancel(), Err(EnrollmentError::NotCancellable(StateKind::Cancelled)));

        ctl.start("frank").unwrap();
        collect_all(&mut ctl);
        ctl.validate(&mut ScriptedEmbedder(VecDeque::new())).unwrap();
        assert_eq!(ctl.cancel(), Err(EnrollmentError::NotCancellable(StateKind::Committing)));
    }

    #[test]
    fn test_cancel_during_validating() {
        let mut ctl = controller();
        ctl.start("gina").unwrap();
        collect_all(&mut ctl);
        ctl.cancel().unwrap();
        assert_eq!(ctl.state(), &EnrollmentState::Cancelled);
        assert!(matches!(
            ctl.validate(&mut ScriptedEmbedder(VecDeque::new())),
            Err(EnrollmentError::WrongState { operation: "validate", .. })
        ));
    }

    #[test]
    fn test_feed_without_session() {
        let mut ctl = controller();
        let mut detector = ScriptedDetector(VecDeque::new());
        assert_eq!(
            ctl.feed(&textured_frame(0), &mut detector).err(),
            Some(EnrollmentError::NoActiveSession)
        );
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(matches!(controller().start("  "), Err(EnrollmentError::InvalidName(_))));
    }

    #[test]
    fn test_config_validation() {
        let bad = EnrollmentConfig { min_valid_samples: 6, ..EnrollmentConfig::default() };
        assert!(EnrollmentController::new(bad).is_err());
        let zero = EnrollmentConfig { sample_count: 0, ..EnrollmentConfig::default() };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_consistency_score() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        let c = Embedding::new(vec![0.0, 1.0]);
        assert_eq!(consistency_score(&[&a]), 1.0);
        assert!((consistency_score(&[&a, &b]) - 1.0).abs() < 1e-6);
        // c agrees with nobody: mean similarity 0.
        assert!(consistency_score(&[&a, &b, &c]).abs() < 1e-6);
    }
}
