//! Face embedding: the `FaceEmbedder` contract and its ArcFace implementation.
//!
//! ArcFace (w600k_r50) maps a normalized 112×112 face crop to a
//! 512-dimensional, L2-normalized embedding.

use crate::alignment::{FaceCrop, ALIGNED_SIZE};
use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("face crop must be {ALIGNED_SIZE}x{ALIGNED_SIZE}, got {width}x{height} ({len} bytes)")]
    InvalidInput { width: usize, height: usize, len: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a normalized face crop to a fixed-dimension embedding.
///
/// Must be deterministic for a given crop. Crops that are not
/// `ALIGNED_SIZE`² are rejected with [`EmbedderError::InvalidInput`].
pub trait FaceEmbedder: Send {
    /// Model-defined embedding dimension.
    fn dimension(&self) -> usize;

    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError>;
}

/// Precondition check shared by embedder implementations.
pub fn check_crop(crop: &FaceCrop) -> Result<(), EmbedderError> {
    if crop.is_normalized() {
        Ok(())
    } else {
        Err(EmbedderError::InvalidInput {
            width: crop.width,
            height: crop.height,
            len: crop.pixels.len(),
        })
    }
}

/// ArcFace-based face embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 grayscale crop into a NCHW float tensor.
    fn preprocess(crop: &FaceCrop) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
            let pixel = crop.pixels[y * ALIGNED_SIZE + x] as f32;
            (pixel - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError> {
        check_crop(crop)?;

        let input = Self::preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        let mut embedding = Embedding {
            values: raw_data.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        };
        embedding.l2_normalize();
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(value: u8) -> FaceCrop {
        FaceCrop::new(vec![value; ALIGNED_SIZE * ALIGNED_SIZE], ALIGNED_SIZE, ALIGNED_SIZE)
    }

    #[test]
    fn test_preprocess_output_shape() {
        let tensor = ArcFaceEmbedder::preprocess(&crop(128));
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let tensor = ArcFaceEmbedder::preprocess(&crop(128));
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let mut face = crop(0);
        for (i, p) in face.pixels.iter_mut().enumerate() {
            *p = (i % 251) as u8;
        }
        let tensor = ArcFaceEmbedder::preprocess(&face);
        for y in (0..ALIGNED_SIZE).step_by(7) {
            for x in (0..ALIGNED_SIZE).step_by(5) {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_check_crop_rejects_unnormalized_input() {
        let wrong = FaceCrop::new(vec![0u8; 64 * 64], 64, 64);
        assert!(matches!(
            check_crop(&wrong),
            Err(EmbedderError::InvalidInput { width: 64, height: 64, len: 4096 })
        ));
        assert!(check_crop(&crop(10)).is_ok());
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx").err();
        assert!(matches!(err, Some(EmbedderError::ModelNotFound(_))));
    }
}
