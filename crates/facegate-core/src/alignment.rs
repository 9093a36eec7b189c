//! Face normalization: turn a detection into the 112×112 crop the embedder expects.
//!
//! With landmarks, the face is aligned to the InsightFace reference points by a
//! 4-DOF similarity transform. Without them, the clamped bounding box is cropped
//! and resized.

use crate::types::{Detection, Frame};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Side length of a normalized face crop.
pub const ALIGNED_SIZE: usize = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// A normalized grayscale face region.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl FaceCrop {
    pub fn new(pixels: Vec<u8>, width: usize, height: usize) -> Self {
        Self { pixels, width, height }
    }

    /// True for a square `ALIGNED_SIZE` crop with a matching buffer.
    pub fn is_normalized(&self) -> bool {
        self.width == ALIGNED_SIZE
            && self.height == ALIGNED_SIZE
            && self.pixels.len() == ALIGNED_SIZE * ALIGNED_SIZE
    }

    /// Crop and normalize a detected face.
    ///
    /// Returns `None` when the frame is malformed or the box lies entirely
    /// outside it.
    pub fn from_detection(frame: &Frame, detection: &Detection) -> Option<Self> {
        if !frame.is_well_formed() {
            return None;
        }
        match &detection.landmarks {
            Some(landmarks) => Some(align_face(frame, landmarks)),
            None => crop_and_resize(frame, detection),
        }
    }
}

/// 2×3 similarity transform `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
type Similarity = [f32; 6];

/// Least-squares similarity transform (scale, rotation, translation) from
/// `src` to `dst`, solved in closed form on centered coordinates.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    let mut spread = 0.0f32;
    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - msx, sy - msy);
        let (dx, dy) = (dx - mdx, dy - mdy);
        spread += sx * sx + sy * sy;
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
    }

    if spread < 1e-12 {
        // Degenerate landmarks: pure translation onto the reference centroid.
        return [1.0, 0.0, mdx - msx, 0.0, 1.0, mdy - msy];
    }

    let a = dot / spread;
    let b = cross / spread;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);

    [a, -b, tx, b, a, ty]
}

/// Bilinear sample with zero (black) outside the frame.
fn sample_bilinear(frame: &[u8], width: usize, height: usize, sx: f32, sy: f32) -> f32 {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> f32 {
        if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
            frame[y as usize * width + x as usize] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp `frame` through the inverse of `m` into an `out_size`² crop.
fn warp_similarity(frame: &[u8], width: usize, height: usize, m: &Similarity, out_size: usize) -> Vec<u8> {
    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return vec![0u8; out_size * out_size];
    }
    let (ia, ib) = (a / det, b / det);

    let mut output = Vec::with_capacity(out_size * out_size);
    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;
            let val = sample_bilinear(frame, width, height, sx, sy);
            output.push(val.round().clamp(0.0, 255.0) as u8);
        }
    }
    output
}

/// Align a face to the canonical 112×112 position using its five landmarks.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> FaceCrop {
    let m = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    let pixels = warp_similarity(
        &frame.data,
        frame.width as usize,
        frame.height as usize,
        &m,
        ALIGNED_SIZE,
    );
    FaceCrop::new(pixels, ALIGNED_SIZE, ALIGNED_SIZE)
}

/// Crop the detection box (clamped to the frame) and resize it to 112×112.
fn crop_and_resize(frame: &Frame, detection: &Detection) -> Option<FaceCrop> {
    let x1 = detection.x.max(0.0).floor() as u32;
    let y1 = detection.y.max(0.0).floor() as u32;
    let x2 = ((detection.x + detection.width).ceil().max(0.0) as u32).min(frame.width);
    let y2 = ((detection.y + detection.height).ceil().max(0.0) as u32).min(frame.height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let image = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())?;
    let cropped = imageops::crop_imm(&image, x1, y1, x2 - x1, y2 - y1).to_image();
    let resized = imageops::resize(
        &cropped,
        ALIGNED_SIZE as u32,
        ALIGNED_SIZE as u32,
        FilterType::Triangle,
    );
    Some(FaceCrop::new(resized.into_raw(), ALIGNED_SIZE, ALIGNED_SIZE))
}
