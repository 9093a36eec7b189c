//! Raw V4L2 buffer conversion to 8-bit grayscale, and dark-frame detection.

use thiserror::Error;
use v4l::FourCC;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel formats the camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel. Luma is every even byte.
    Yuyv,
    /// 8-bit grayscale, 1 byte/pixel.
    Grey,
    /// 16-bit little-endian grayscale, 2 bytes/pixel.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Grey => 1,
            Self::Yuyv | Self::Y16 => 2,
        }
    }

    /// Convert one raw buffer to `width * height` grayscale bytes.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        let pixels = width as usize * height as usize;
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(FrameError::ShortBuffer {
                format: self,
                expected,
                actual: buf.len(),
            });
        }
        let buf = &buf[..expected];

        Ok(match self {
            Self::Grey => buf.to_vec(),
            Self::Yuyv => buf.iter().step_by(2).copied().collect(),
            // Keep the high byte of each little-endian sample.
            Self::Y16 => buf.chunks_exact(2).map(|px| px[1]).collect(),
        })
    }
}

/// Pixels below this value count as dark.
const DARK_PIXEL: u8 = 32;

/// Fraction of pixels darker than [`DARK_PIXEL`].
pub fn dark_fraction(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 1.0;
    }
    gray.iter().filter(|&&p| p < DARK_PIXEL).count() as f32 / gray.len() as f32
}

/// True when more than `threshold` of the frame is dark (lens covered,
/// emitter between pulses, exposure not settled).
pub fn is_dark_frame(gray: &[u8], threshold: f32) -> bool {
    dark_fraction(gray) > threshold
}
