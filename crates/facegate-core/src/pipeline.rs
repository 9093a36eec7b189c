//! Live recognition pipeline.
//!
//! Layout: `capture → [frames, drop-oldest] → inference → [recognitions,
//! drop-oldest | enrollment events, blocking] → sink`
//!
//! Each stage runs on its own OS thread. The inference stage owns the
//! detector, embedder and enrollment controller; control requests reach it
//! through a [`PipelineHandle`] and are drained between steps, so a request
//! never interrupts a step that is already running.

use crate::alignment::FaceCrop;
use crate::detector::{DetectionFilter, FaceDetector};
use crate::embedder::FaceEmbedder;
use crate::enrollment::{
    EnrollmentConfig, EnrollmentController, EnrollmentError, EnrollmentEvent, EnrollmentState,
    SampleCounters, StateKind,
};
use crate::gallery::Gallery;
use crate::matcher::{MatchResult, Matcher};
use crate::queue::{drop_oldest, DropOldestReceiver, DropOldestSender};
use crate::types::{Detection, Frame};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const RECOGNITION_QUEUE_CAPACITY: usize = 16;
const EVENT_QUEUE_CAPACITY: usize = 16;
const COMMAND_QUEUE_CAPACITY: usize = 4;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// No frame arrived in time. The pipeline skips the cycle.
    #[error("timed out waiting for a frame")]
    Timeout,
    /// The source is gone for good. Ends the pipeline.
    #[error("frame source disconnected: {0}")]
    Disconnected(String),
}

/// Polling camera contract.
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;
}

/// Receives everything the pipeline produces. Runs on the sink thread.
pub trait ResultSink: Send {
    fn on_recognition(&mut self, recognition: &Recognition);
    fn on_enrollment(&mut self, event: &EnrollmentEvent);
}

/// A match decision for one face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub frame_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub detection: Detection,
    pub result: MatchResult,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("pipeline stopped")]
    ChannelClosed,
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub capture_timeout: Duration,
    /// Frame queue depth, 1 or 2.
    pub frame_queue_capacity: usize,
    pub warmup_frames: usize,
    pub detection: DetectionFilter,
    pub enrollment: EnrollmentConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(1000),
            frame_queue_capacity: 2,
            warmup_frames: 0,
            detection: DetectionFilter::default(),
            enrollment: EnrollmentConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=2).contains(&self.frame_queue_capacity) {
            return Err(PipelineError::InvalidConfig(format!(
                "frame queue capacity must be 1 or 2, got {}",
                self.frame_queue_capacity
            )));
        }
        if self.capture_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig("capture timeout must be non-zero".into()));
        }
        self.enrollment.validate()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    capture_timeouts: AtomicU64,
    frames_processed: AtomicU64,
    detector_errors: AtomicU64,
    embedder_errors: AtomicU64,
    unusable_crops: AtomicU64,
    recognitions_emitted: AtomicU64,
    recognitions_dropped: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            frames_captured: get(&self.frames_captured),
            frames_dropped: get(&self.frames_dropped),
            capture_timeouts: get(&self.capture_timeouts),
            frames_processed: get(&self.frames_processed),
            detector_errors: get(&self.detector_errors),
            embedder_errors: get(&self.embedder_errors),
            unusable_crops: get(&self.unusable_crops),
            recognitions_emitted: get(&self.recognitions_emitted),
            recognitions_dropped: get(&self.recognitions_dropped),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub capture_timeouts: u64,
    pub frames_processed: u64,
    pub detector_errors: u64,
    pub embedder_errors: u64,
    /// Detections that could not be cropped from the frame.
    pub unusable_crops: u64,
    pub recognitions_emitted: u64,
    pub recognitions_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentProgress {
    pub session_id: Uuid,
    pub name: String,
    pub collected: usize,
    pub required: usize,
    pub counters: SampleCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub enrollment: EnrollmentState,
    pub progress: Option<EnrollmentProgress>,
    pub stats: PipelineStats,
}

/// Requests sent from handles to the inference thread.
enum Command {
    StartEnrollment {
        name: String,
        reply: oneshot::Sender<Result<Uuid, EnrollmentError>>,
    },
    CancelEnrollment {
        reply: oneshot::Sender<Result<(), EnrollmentError>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Clone-safe handle to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
    stats: Arc<StatsCounters>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Start enrolling `name`. Recognition output pauses until the session ends.
    pub async fn start_enrollment(&self, name: &str) -> Result<Uuid, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartEnrollment { name: name.to_string(), reply }).await?;
        Ok(rx.await.map_err(|_| PipelineError::ChannelClosed)??)
    }

    pub async fn cancel_enrollment(&self) -> Result<(), PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::CancelEnrollment { reply }).await?;
        Ok(rx.await.map_err(|_| PipelineError::ChannelClosed)??)
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }).await?;
        rx.await.map_err(|_| PipelineError::ChannelClosed)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Ask every stage to stop. Returns immediately; join with [`Pipeline::join`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn request(&self, command: Command) -> Result<(), PipelineError> {
        self.tx.send(command).await.map_err(|_| PipelineError::ChannelClosed)
    }
}

/// The collaborators a pipeline runs with.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn FaceDetector>,
    pub embedder: Box<dyn FaceEmbedder>,
    pub matcher: Box<dyn Matcher>,
    pub gallery: Arc<Gallery>,
    pub sink: Box<dyn ResultSink>,
}

/// Join handles for the three stage threads.
pub struct Pipeline {
    capture: JoinHandle<()>,
    inference: JoinHandle<()>,
    sink: JoinHandle<()>,
}

impl Pipeline {
    /// Wait for every stage to exit. Call after [`PipelineHandle::shutdown`]
    /// or once the frame source has disconnected.
    pub fn join(self) -> Result<(), PipelineError> {
        let capture = self.capture.join();
        let inference = self.inference.join();
        let sink = self.sink.join();
        capture.map_err(|_| PipelineError::ThreadPanicked("capture"))?;
        inference.map_err(|_| PipelineError::ThreadPanicked("inference"))?;
        sink.map_err(|_| PipelineError::ThreadPanicked("sink"))?;
        tracing::info!("pipeline stopped");
        Ok(())
    }
}

/// Spawn the capture, inference and sink threads.
pub fn spawn(config: PipelineConfig, parts: PipelineParts) -> Result<(PipelineHandle, Pipeline), PipelineError> {
    config.validate()?;
    let controller = EnrollmentController::new(config.enrollment)?;

    let stats = Arc::new(StatsCounters::default());
    let shutdown = Arc::new(AtomicBool::new(false));

    let (frame_tx, frame_rx) = drop_oldest::<Frame>(config.frame_queue_capacity);
    let (rec_tx, rec_rx) = drop_oldest::<Recognition>(RECOGNITION_QUEUE_CAPACITY);
    let (event_tx, event_rx) = crossbeam_channel::bounded::<EnrollmentEvent>(EVENT_QUEUE_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(COMMAND_QUEUE_CAPACITY);

    let sink = spawn_sink(parts.sink, rec_rx, event_rx)?;

    let inference = InferenceStage {
        detector: parts.detector,
        embedder: parts.embedder,
        matcher: parts.matcher,
        gallery: parts.gallery,
        filter: config.detection,
        controller,
        commands: cmd_rx,
        frames: frame_rx,
        recognitions: rec_tx,
        events: event_tx,
        stats: Arc::clone(&stats),
        shutdown: Arc::clone(&shutdown),
        poll: config.capture_timeout,
    };
    let inference = std::thread::Builder::new()
        .name("facegate-inference".into())
        .spawn(move || inference.run())
        .map_err(|source| PipelineError::Spawn { stage: "inference", source })?;

    let capture = spawn_capture(
        parts.source,
        frame_tx,
        config,
        Arc::clone(&stats),
        Arc::clone(&shutdown),
    )?;

    tracing::info!(
        frame_queue = config.frame_queue_capacity,
        capture_timeout_ms = config.capture_timeout.as_millis() as u64,
        warmup_frames = config.warmup_frames,
        "pipeline started"
    );

    let handle = PipelineHandle { tx: cmd_tx, stats, shutdown };
    Ok((handle, Pipeline { capture, inference, sink }))
}

fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    frame_tx: DropOldestSender<Frame>,
    config: PipelineConfig,
    stats: Arc<StatsCounters>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("facegate-capture".into())
        .spawn(move || {
            let mut warmup_left = config.warmup_frames;
            if warmup_left > 0 {
                tracing::info!(count = warmup_left, "discarding warmup frames");
            }

            while !shutdown.load(Ordering::Acquire) {
                match source.next_frame(config.capture_timeout) {
                    Ok(_) if warmup_left > 0 => warmup_left -= 1,
                    Ok(frame) => {
                        StatsCounters::bump(&stats.frames_captured, 1);
                        match frame_tx.send(frame) {
                            Ok(evicted) => StatsCounters::bump(&stats.frames_dropped, evicted as u64),
                            Err(_) => break,
                        }
                    }
                    Err(CaptureError::Timeout) => {
                        StatsCounters::bump(&stats.capture_timeouts, 1);
                        tracing::debug!("capture timeout");
                    }
                    Err(CaptureError::Disconnected(reason)) => {
                        tracing::error!(%reason, "frame source disconnected; stopping pipeline");
                        break;
                    }
                }
            }
            tracing::info!("capture stage exiting");
        })
        .map_err(|source| PipelineError::Spawn { stage: "capture", source })
}

fn spawn_sink(
    mut sink: Box<dyn ResultSink>,
    recognitions: DropOldestReceiver<Recognition>,
    events: Receiver<EnrollmentEvent>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("facegate-sink".into())
        .spawn(move || {
            let closed_recognitions = crossbeam_channel::never::<Recognition>();
            let closed_events = crossbeam_channel::never::<EnrollmentEvent>();
            let mut recognitions_open = true;
            let mut events_open = true;

            while recognitions_open || events_open {
                let rec_rx = if recognitions_open { recognitions.receiver() } else { &closed_recognitions };
                let event_rx = if events_open { &events } else { &closed_events };
                crossbeam_channel::select! {
                    recv(event_rx) -> msg => match msg {
                        Ok(event) => sink.on_enrollment(&event),
                        Err(_) => events_open = false,
                    },
                    recv(rec_rx) -> msg => match msg {
                        Ok(recognition) => sink.on_recognition(&recognition),
                        Err(_) => recognitions_open = false,
                    },
                }
            }
            tracing::info!("sink stage exiting");
        })
        .map_err(|source| PipelineError::Spawn { stage: "sink", source })
}

struct InferenceStage {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
    matcher: Box<dyn Matcher>,
    gallery: Arc<Gallery>,
    filter: DetectionFilter,
    controller: EnrollmentController,
    commands: mpsc::Receiver<Command>,
    frames: DropOldestReceiver<Frame>,
    recognitions: DropOldestSender<Recognition>,
    events: Sender<EnrollmentEvent>,
    stats: Arc<StatsCounters>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
}

impl InferenceStage {
    fn run(mut self) {
        tracing::info!("inference stage started");
        loop {
            self.drain_commands();
            self.forward_events();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Validation and commit need no frame; one step per iteration so
            // a cancel can land between them.
            match self.controller.state().kind() {
                StateKind::Validating => {
                    if let Err(e) = self.controller.validate(self.embedder.as_mut()) {
                        tracing::error!(error = %e, "enrollment validation step rejected");
                    }
                    continue;
                }
                StateKind::Committing => {
                    if let Err(e) = self.controller.commit(&self.gallery) {
                        tracing::error!(error = %e, "enrollment commit step rejected");
                    }
                    continue;
                }
                _ => {}
            }

            let frame = match self.frames.receiver().recv_timeout(self.poll) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            StatsCounters::bump(&self.stats.frames_processed, 1);

            if self.controller.state().kind() == StateKind::Collecting {
                if let Err(e) = self.controller.feed(&frame, self.detector.as_mut()) {
                    tracing::error!(error = %e, "enrollment feed rejected");
                }
            } else if !self.recognize(&frame) {
                break;
            }
        }
        self.forward_events();
        tracing::info!("inference stage exiting");
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::StartEnrollment { name, reply } => {
                    let _ = reply.send(self.controller.start(&name));
                }
                Command::CancelEnrollment { reply } => {
                    let _ = reply.send(self.controller.cancel());
                }
                Command::Status { reply } => {
                    let progress = self.controller.session().map(|s| EnrollmentProgress {
                        session_id: s.id,
                        name: s.name.clone(),
                        collected: s.accepted_samples(),
                        required: s.required_samples,
                        counters: s.counters,
                    });
                    let _ = reply.send(PipelineStatus {
                        enrollment: self.controller.state().clone(),
                        progress,
                        stats: self.stats.snapshot(),
                    });
                }
            }
        }
    }

    /// Enrollment events are never dropped: this blocks while the sink catches up.
    fn forward_events(&mut self) {
        for event in self.controller.drain_events() {
            if self.events.send(event).is_err() {
                tracing::warn!("sink stage gone; enrollment event discarded");
            }
        }
    }

    /// Detect, embed and match every face in `frame`. Returns false once the
    /// sink has gone away.
    fn recognize(&mut self, frame: &Frame) -> bool {
        let detections = match self.detector.detect(frame) {
            Ok(d) => self.filter.apply(d),
            Err(e) => {
                StatsCounters::bump(&self.stats.detector_errors, 1);
                tracing::warn!(sequence = frame.sequence, error = %e, "detector failed; frame skipped");
                return true;
            }
        };
        if detections.is_empty() {
            return true;
        }

        let snapshot = self.gallery.all_embeddings();
        for detection in detections {
            let Some(crop) = FaceCrop::from_detection(frame, &detection) else {
                StatsCounters::bump(&self.stats.unusable_crops, 1);
                tracing::debug!(
                    sequence = frame.sequence,
                    x = detection.x,
                    y = detection.y,
                    width = detection.width,
                    height = detection.height,
                    "detection lies outside the frame; face skipped"
                );
                continue;
            };
            let embedding = match self.embedder.embed(&crop) {
                Ok(e) => e,
                Err(e) => {
                    StatsCounters::bump(&self.stats.embedder_errors, 1);
                    tracing::warn!(sequence = frame.sequence, error = %e, "embedder failed; face skipped");
                    continue;
                }
            };

            let result = self.matcher.decide(&embedding, &snapshot);
            let recognition = Recognition {
                frame_sequence: frame.sequence,
                captured_at: frame.captured_at,
                detection,
                result,
            };
            match self.recognitions.send(recognition) {
                Ok(evicted) => {
                    StatsCounters::bump(&self.stats.recognitions_emitted, 1);
                    StatsCounters::bump(&self.stats.recognitions_dropped, evicted as u64);
                }
                Err(_) => {
                    tracing::warn!("sink stage gone; stopping inference");
                    return false;
                }
            }
        }
        true
    }
}
