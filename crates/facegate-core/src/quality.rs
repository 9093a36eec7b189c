//! Enrollment sample quality heuristics: sharpness, size, frontal pose, exposure.
//!
//! Each component is scored in [0, 1]; a sample's overall score is its weakest
//! component, so one bad property is enough to discard it.

use crate::alignment::FaceCrop;
use crate::types::Detection;
use serde::Serialize;

/// Laplacian variance at which a crop counts as fully sharp.
const SHARPNESS_REFERENCE: f32 = 150.0;
/// Face box side (px) at which the size score saturates.
const FULL_SIZE_PX: f32 = 160.0;
/// Nose offset from the eye midpoint, as a fraction of eye distance, that scores zero.
const MAX_YAW_OFFSET: f32 = 0.5;
/// Eye-line tilt (radians) that scores zero.
const MAX_ROLL_RAD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityReport {
    pub sharpness: f32,
    pub size: f32,
    pub frontal: f32,
    pub exposure: f32,
}

impl QualityReport {
    pub fn score(&self) -> f32 {
        self.sharpness
            .min(self.size)
            .min(self.frontal)
            .min(self.exposure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFilter {
    pub min_score: f32,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self { min_score: 0.5 }
    }
}

impl QualityFilter {
    pub fn new(min_score: f32) -> Self {
        Self { min_score }
    }

    pub fn assess(&self, detection: &Detection, crop: &FaceCrop) -> QualityReport {
        QualityReport {
            sharpness: (laplacian_variance(crop) / SHARPNESS_REFERENCE).clamp(0.0, 1.0),
            size: (detection.min_side() / FULL_SIZE_PX).clamp(0.0, 1.0),
            frontal: frontal_score(detection),
            exposure: exposure_score(crop),
        }
    }

    pub fn passes(&self, report: &QualityReport) -> bool {
        report.score() >= self.min_score
    }
}

/// Variance of the 4-neighbour Laplacian over the crop interior.
pub fn laplacian_variance(crop: &FaceCrop) -> f32 {
    let (w, h) = (crop.width, crop.height);
    if w < 3 || h < 3 || crop.pixels.len() < w * h {
        return 0.0;
    }

    let px = |x: usize, y: usize| crop.pixels[y * w + x] as f32;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap as f64;
            sum_sq += (lap * lap) as f64;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0) as f32
}

/// Frontal-pose score from landmark symmetry. Detections without landmarks
/// cannot be judged and score 1.0.
fn frontal_score(detection: &Detection) -> f32 {
    let Some(lm) = &detection.landmarks else {
        return 1.0;
    };
    let (left_eye, right_eye, nose) = (lm[0], lm[1], lm[2]);

    let eye_dx = right_eye.0 - left_eye.0;
    let eye_dy = right_eye.1 - left_eye.1;
    let eye_dist = (eye_dx * eye_dx + eye_dy * eye_dy).sqrt();
    if eye_dist < 1.0 {
        return 0.0;
    }

    let mid_x = (left_eye.0 + right_eye.0) / 2.0;
    let yaw = ((nose.0 - mid_x).abs() / eye_dist / MAX_YAW_OFFSET).min(1.0);
    let roll = (eye_dy.atan2(eye_dx).abs() / MAX_ROLL_RAD).min(1.0);

    1.0 - yaw.max(roll)
}

/// 1.0 at mid-grey, falling to 0.0 for a black or white crop.
fn exposure_score(crop: &FaceCrop) -> f32 {
    if crop.pixels.is_empty() {
        return 0.0;
    }
    let mean = crop.pixels.iter().map(|&p| p as f32).sum::<f32>() / crop.pixels.len() as f32;
    (1.0 - (mean - 127.5).abs() / 127.5).clamp(0.0, 1.0)
}
