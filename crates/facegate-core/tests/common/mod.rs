#![allow(dead_code)]

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use facegate_core::{
    CandidateEmbedding, CaptureError, Detection, DetectorError, EmbedderError, Embedding,
    EnrollmentEvent, FaceCrop, FaceDetector, FaceEmbedder, Frame, FrameSource, GalleryStore,
    Identity, IdentityId, Recognition, ResultSink, StoreError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FRAME_W: u32 = 320;
pub const FRAME_H: u32 = 240;
pub const DIM: usize = 8;

/// Base direction every test face embeds near.
pub fn base_vector() -> Vec<f32> {
    vec![0.5, 0.1, -0.3, 0.7, 0.2, -0.1, 0.4, 0.05]
}

pub fn normalized(values: Vec<f32>) -> Embedding {
    let mut e = Embedding::new(values);
    e.l2_normalize();
    e
}

/// `base` with a small deterministic perturbation on one axis.
pub fn near(base: &[f32], seed: u64) -> Embedding {
    let mut v = base.to_vec();
    let axis = (seed as usize) % v.len();
    v[axis] += 0.02 * ((seed % 3) as f32 + 1.0);
    normalized(v)
}

pub fn candidates(base: &[f32], count: u64) -> Vec<CandidateEmbedding> {
    (0..count)
        .map(|i| CandidateEmbedding {
            embedding: near(base, i),
            quality: 0.9,
            captured_at: Utc::now(),
        })
        .collect()
}

/// A high-contrast frame that passes the sharpness and exposure checks.
pub fn textured_frame(sequence: u64) -> Frame {
    let data = (0..FRAME_H)
        .flat_map(|y| (0..FRAME_W).map(move |x| if (x / 3 + y / 3) % 2 == 0 { 60 } else { 190 }))
        .collect();
    Frame::new(data, FRAME_W, FRAME_H, sequence)
}

pub fn good_face() -> Detection {
    Detection {
        x: 60.0,
        y: 20.0,
        width: 200.0,
        height: 200.0,
        confidence: 0.95,
        landmarks: None,
    }
}

/// Detector whose answer depends only on the frame's sequence number.
pub struct SequenceDetector {
    faces: Box<dyn Fn(u64) -> Vec<Detection> + Send>,
}

impl SequenceDetector {
    pub fn new(faces: impl Fn(u64) -> Vec<Detection> + Send + 'static) -> Self {
        Self { faces: Box::new(faces) }
    }

    /// One good face in every frame.
    pub fn always_one() -> Self {
        Self::new(|_| vec![good_face()])
    }
}

impl FaceDetector for SequenceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        facegate_core::detector::check_frame(frame)?;
        Ok((self.faces)(frame.sequence))
    }
}

/// Embeds every crop near a fixed direction, varying slightly per call.
pub struct NearEmbedder {
    base: Vec<f32>,
    calls: u64,
}

impl NearEmbedder {
    pub fn new(base: Vec<f32>) -> Self {
        Self { base, calls: 0 }
    }
}

impl FaceEmbedder for NearEmbedder {
    fn dimension(&self) -> usize {
        self.base.len()
    }

    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError> {
        facegate_core::embedder::check_crop(crop)?;
        self.calls += 1;
        Ok(near(&self.base, self.calls))
    }
}

/// Frames pushed by the test; times out when none are pending.
pub struct ChannelSource {
    rx: Receiver<Frame>,
}

pub fn channel_source() -> (Sender<Frame>, ChannelSource) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (tx, ChannelSource { rx })
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Disconnected("test source closed".into())),
        }
    }
}

#[derive(Clone, Default)]
pub struct CollectingSink {
    pub recognitions: Arc<Mutex<Vec<Recognition>>>,
    pub events: Arc<Mutex<Vec<EnrollmentEvent>>>,
    pub delivered: Arc<AtomicU64>,
}

impl CollectingSink {
    pub fn recognitions(&self) -> Vec<Recognition> {
        self.recognitions.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<EnrollmentEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ResultSink for CollectingSink {
    fn on_recognition(&mut self, recognition: &Recognition) {
        self.recognitions.lock().unwrap().push(recognition.clone());
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_enrollment(&mut self, event: &EnrollmentEvent) {
        self.events.lock().unwrap().push(event.clone());
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store that returns identities in exactly the order given.
pub struct VecStore(pub Vec<Identity>);

impl GalleryStore for VecStore {
    fn load_all(&mut self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.0.clone())
    }

    fn save(&mut self, identity: &Identity) -> Result<(), StoreError> {
        self.0.retain(|i| i.id() != identity.id());
        self.0.push(identity.clone());
        Ok(())
    }

    fn delete(&mut self, id: &IdentityId) -> Result<(), StoreError> {
        self.0.retain(|i| i.id() != id);
        Ok(())
    }
}
