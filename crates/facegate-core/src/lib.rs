//! facegate-core: face enrollment and live identity matching.
//!
//! SCRFD locates faces and ArcFace embeds them, both through ONNX Runtime.
//! Embeddings are matched against an identity gallery with a two-threshold
//! policy; the enrollment controller and the live pipeline tie the pieces
//! together.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod queue;
pub mod types;

pub use alignment::{FaceCrop, ALIGNED_SIZE};
pub use detector::{DetectionFilter, DetectorError, FaceDetector, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, EmbedderError, FaceEmbedder};
pub use enrollment::{
    EnrollmentConfig, EnrollmentController, EnrollmentError, EnrollmentEvent, EnrollmentFailure,
    EnrollmentState, StateKind,
};
pub use gallery::{
    CandidateEmbedding, Gallery, GalleryError, GallerySnapshot, GalleryStats, GalleryStore,
    Identity, IdentityId, IdentitySummary, MemoryStore, ReenrollPolicy, ReferenceEmbedding,
    StoreError,
};
pub use matcher::{Candidate, CosineMatcher, Decision, MatchResult, Matcher, MatcherError};
pub use pipeline::{
    CaptureError, FrameSource, Pipeline, PipelineConfig, PipelineError, PipelineHandle,
    PipelineParts, PipelineStats, PipelineStatus, Recognition, ResultSink,
};
pub use quality::QualityFilter;
pub use types::{Detection, Embedding, Frame};
