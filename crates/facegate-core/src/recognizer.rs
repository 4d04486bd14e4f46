//! MobileFaceNet face embedding extractor via ONNX Runtime.
//!
//! Extracts 192-dimensional embeddings from face crops. The crop is resized
//! to 112x112 and fed as an NHWC RGB tensor scaled to [0, 1].

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const MOBILEFACENET_INPUT_SIZE: u32 = 112;
const MOBILEFACENET_SCALE: f32 = 255.0;
pub const MOBILEFACENET_EMBEDDING_DIM: usize = 192;
const MOBILEFACENET_MODEL_VERSION: &str = "mobile_face_net";

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("extractor has been released")]
    Released,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face image into an embedding.
///
/// Output length is fixed per implementation and identical pixels yield
/// identical embeddings. `release` frees the backing model; later calls to
/// `extract` fail with [`ExtractionError::Released`].
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError>;

    /// Length of every embedding this extractor produces.
    fn dimension(&self) -> usize;

    fn release(&self) {}
}

/// MobileFaceNet-based face embedding extractor.
///
/// The ONNX session needs exclusive access per run, so it sits behind a
/// mutex; concurrent callers serialize on inference.
pub struct MobileFaceNet {
    session: Mutex<Option<Session>>,
}

impl MobileFaceNet {
    /// Load the MobileFaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ExtractionError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractionError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded MobileFaceNet model"
        );

        Ok(Self {
            session: Mutex::new(Some(session)),
        })
    }

    /// Resize to 112x112 and pack into a [1, 112, 112, 3] float tensor.
    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let size = MOBILEFACENET_INPUT_SIZE;
        let resized = if image.dimensions() == (size, size) {
            image.clone()
        } else {
            imageops::resize(image, size, size, FilterType::Triangle)
        };

        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, y, x, c]] = pixel.0[c] as f32 / MOBILEFACENET_SCALE;
            }
        }
        tensor
    }
}

impl EmbeddingExtractor for MobileFaceNet {
    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractionError> {
        let input = Self::preprocess(image);

        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(ExtractionError::Released)?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values: Vec<f32> = raw_data.to_vec();
        if values.len() != MOBILEFACENET_EMBEDDING_DIM {
            return Err(ExtractionError::InferenceFailed(format!(
                "expected {MOBILEFACENET_EMBEDDING_DIM}-dim embedding, got {}",
                values.len()
            )));
        }

        Ok(Embedding::new(values).with_model_version(MOBILEFACENET_MODEL_VERSION))
    }

    fn dimension(&self) -> usize {
        MOBILEFACENET_EMBEDDING_DIM
    }

    fn release(&self) {
        if self.session.lock().take().is_some() {
            tracing::info!("MobileFaceNet session released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let img = RgbImage::from_pixel(640, 480, Rgb([10, 20, 30]));
        let tensor = MobileFaceNet::preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 112, 112, 3]);
    }

    #[test]
    fn test_preprocess_scaling() {
        let img = RgbImage::from_pixel(112, 112, Rgb([255, 0, 51]));
        let tensor = MobileFaceNet::preprocess(&img);
        assert!((tensor[[0, 5, 7, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 5, 7, 1]].abs() < 1e-6);
        assert!((tensor[[0, 5, 7, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        // left half red, right half blue
        let img = RgbImage::from_fn(112, 112, |x, _| {
            if x < 56 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let tensor = MobileFaceNet::preprocess(&img);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 111, 2]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 0, 111, 0]].abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = MobileFaceNet::load("/nonexistent/mobile_face_net.onnx")
            .err()
            .expect("missing model must fail");
        assert!(matches!(err, ExtractionError::ModelNotFound(_)));
    }
}
