//! V4L2 camera capture via the `v4l` crate.
//!
//! A dedicated reader thread owns the mmap stream, converts each buffer to
//! grayscale, drops dark frames and pushes the rest into a drop-oldest queue.
//! [`CameraSource::next_frame`] polls that queue with a timeout.

use crate::frame::{self, PixelFormat};
use crossbeam_channel::RecvTimeoutError;
use facegate_core::queue::{drop_oldest, DropOldestReceiver, DropOldestSender};
use facegate_core::{CaptureError, Frame, FrameSource};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
/// Consecutive dequeue failures before the stream is declared lost.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("failed to start capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    /// Depth of the reader → consumer queue.
    pub queue_capacity: usize,
    /// Fraction of dark pixels above which a frame is discarded.
    pub dark_threshold: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            queue_capacity: 2,
            dark_threshold: 0.95,
        }
    }
}

#[derive(Debug, Default)]
struct ReaderStats {
    delivered: AtomicU64,
    dark: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Live V4L2 camera implementing [`FrameSource`].
pub struct CameraSource {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    frames: DropOldestReceiver<Frame>,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    stats: Arc<ReaderStats>,
    reader: Option<JoinHandle<()>>,
}

impl CameraSource {
    /// Open a V4L2 device by path (e.g. "/dev/video0") and start streaming.
    pub fn open(device_path: &str, config: CameraConfig) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        // Ask for YUYV; IR cameras often answer with GREY or Y16 instead.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = config.width;
        fmt.height = config.height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let (tx, frames) = drop_oldest(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));
        let stats = Arc::new(ReaderStats::default());

        let reader = Reader {
            device,
            pixel_format,
            width: negotiated.width,
            height: negotiated.height,
            dark_threshold: config.dark_threshold,
            tx,
            stop: Arc::clone(&stop),
            last_error: Arc::clone(&last_error),
            stats: Arc::clone(&stats),
        };
        let reader = std::thread::Builder::new()
            .name("facegate-camera".into())
            .spawn(move || reader.run())?;

        Ok(Self {
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            fourcc: negotiated.fourcc,
            frames,
            stop,
            last_error,
            stats,
            reader: Some(reader),
        })
    }

    /// Frames delivered to the queue so far.
    pub fn frames_delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    /// Frames discarded as dark.
    pub fn dark_frames(&self) -> u64 {
        self.stats.dark.load(Ordering::Relaxed)
    }

    /// Frames evicted because the consumer fell behind.
    pub fn frames_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn capture_errors(&self) -> u64 {
        self.stats.errors.load(Ordering::Relaxed)
    }

    /// List V4L2 video capture devices under /dev/video0..15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        match self.frames.receiver().recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                let reason = self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or_else(|| "capture thread stopped".to_string());
                Err(CaptureError::Disconnected(reason))
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!(device = %self.device_path, "camera reader thread panicked");
            }
        }
    }
}

/// State owned by the reader thread.
struct Reader {
    device: Device,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    dark_threshold: f32,
    tx: DropOldestSender<Frame>,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    stats: Arc<ReaderStats>,
}

impl Reader {
    fn run(self) {
        let mut stream = match MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS) {
            Ok(s) => s,
            Err(e) => {
                self.fail(format!("failed to create mmap stream: {e}"));
                return;
            }
        };
        tracing::debug!(format = ?self.pixel_format, "camera stream started");

        let mut sequence = 0u64;
        let mut consecutive_errors = 0u32;

        while !self.stop.load(Ordering::Acquire) {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "failed to dequeue buffer");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.fail(format!("stream lost after {consecutive_errors} dequeue errors: {e}"));
                        return;
                    }
                    continue;
                }
            };
            consecutive_errors = 0;

            let gray = match self.pixel_format.to_grayscale(buf, self.width, self.height) {
                Ok(gray) => gray,
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, seq = meta.sequence, "dropping malformed buffer");
                    continue;
                }
            };

            if frame::is_dark_frame(&gray, self.dark_threshold) {
                self.stats.dark.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(seq = meta.sequence, "skipping dark frame");
                continue;
            }

            let frame = Frame::new(gray, self.width, self.height, sequence);
            sequence += 1;
            match self.tx.send(frame) {
                Ok(evicted) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    self.stats.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
                }
                // Consumer went away.
                Err(_) => break,
            }
        }
        tracing::debug!("camera stream stopped");
    }

    fn fail(&self, reason: String) {
        tracing::error!(%reason, "camera capture stopped");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }
}
