//! facegate-hw: V4L2 camera capture for the recognition pipeline.
//!
//! Implements the core `FrameSource` contract over a V4L2 device, with
//! grayscale conversion for YUYV, GREY and Y16 cameras.

pub mod camera;
pub mod frame;

pub use camera::{CameraConfig, CameraError, CameraSource, DeviceInfo};
pub use frame::PixelFormat;
