use crate::{
    model_service::{ModelError, ModelService},
    preprocessing::{PreprocessError, Preprocessor},
};
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageError};
use ndarray::{ArrayD, Axis};
use serde::Serialize;
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tracing::instrument;

/// Output neuron read from the first (and only) batch entry.
pub const TARGET_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("Error decoding image: {0}")]
    Decode(ImageError),
    #[error("Preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Model failed: {0}")]
    Model(#[from] ModelError),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
    #[error("Scoring task failed: {0}")]
    TaskJoin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub score: f64,
}

impl Score {
    /// Percentage of `probability`, rounded to two decimals.
    pub fn from_probability(probability: f32) -> Result<Self, ScoringError> {
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(ScoringError::InvalidOutput(format!(
                "probability {} is outside [0, 1]",
                probability
            )));
        }
        let percentage = f64::from(probability) * 100.;
        Ok(Self {
            score: (percentage * 100.).round() / 100.,
        })
    }
}

#[derive(Clone)]
pub struct ScoringPipeline<M: ModelService> {
    model_service: M,
    preprocessor: Preprocessor,
}

impl<M: ModelService> ScoringPipeline<M> {
    pub fn new(model_service: M, preprocessor: Preprocessor) -> Self {
        Self {
            model_service,
            preprocessor,
        }
    }

    /// Decodes and scores an upload off the async runtime.
    pub async fn score_upload(self: Arc<Self>, data: Bytes) -> Result<Score, ScoringError> {
        tokio::task::spawn_blocking(move || {
            let photo = decode_photo(&data)?;
            self.score(photo)
        })
        .await
        .map_err(|e| ScoringError::TaskJoin(e.to_string()))?
    }

    #[instrument(skip(self, photo))]
    pub fn score(&self, photo: DynamicImage) -> Result<Score, ScoringError> {
        let input = self.preprocessor.prepare(photo)?;

        tracing::info!("Doing the forward propagation...");
        let output = self.model_service.forward(&input)?;

        let probability = extract_probability(&output)?;
        let score = Score::from_probability(probability)?;
        tracing::info!("Done. Photo score is {}%.", score.score);

        Ok(score)
    }
}

pub fn decode_photo(data: &[u8]) -> Result<DynamicImage, ScoringError> {
    let photo = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ScoringError::Decode(ImageError::IoError(e)))?
        .decode()
        .map_err(ScoringError::Decode)?;

    let (width, height) = photo.dimensions();
    tracing::info!("Photo resolution is {}x{} pixels.", width, height);

    Ok(photo)
}

/// Reads `output[0][TARGET_CLASS]`, trailing singleton axes included.
fn extract_probability(output: &ArrayD<f32>) -> Result<f32, ScoringError> {
    if output.ndim() == 0 || output.shape()[0] == 0 {
        return Err(ScoringError::InvalidOutput(format!(
            "unexpected output shape {:?}",
            output.shape()
        )));
    }

    output
        .index_axis(Axis(0), 0)
        .iter()
        .nth(TARGET_CLASS)
        .copied()
        .ok_or_else(|| {
            ScoringError::InvalidOutput(format!(
                "output shape {:?} has no class {}",
                output.shape(),
                TARGET_CLASS
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::{Array4, IxDyn};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct FixedModelService {
        output: ArrayD<f32>,
        seen_shapes: Arc<Mutex<Vec<Vec<usize>>>>,
    }

    impl FixedModelService {
        fn new(probabilities: &[f32]) -> Self {
            Self {
                output: ArrayD::from_shape_vec(IxDyn(&[1, probabilities.len()]), probabilities.to_vec())
                    .unwrap(),
                seen_shapes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ModelService for FixedModelService {
        fn forward(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            self.seen_shapes.lock().unwrap().push(input.shape().to_vec());
            Ok(self.output.clone())
        }
    }

    #[derive(Clone)]
    struct FailingModelService;

    impl ModelService for FailingModelService {
        fn forward(&self, _input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError> {
            Err(ModelError::Inference("backend unavailable".to_string()))
        }
    }

    fn photo(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(
            width,
            height,
            Rgb([90, 140, 200]),
        ))
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        photo(width, height)
            .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Jpeg)
            .unwrap();
        data
    }

    #[test]
    fn test_score_rounds_to_two_decimals() {
        assert_eq!(Score::from_probability(0.734_21).unwrap().score, 73.42);
        assert_eq!(Score::from_probability(0.5).unwrap().score, 50.0);
        assert_eq!(Score::from_probability(0.0).unwrap().score, 0.0);
        assert_eq!(Score::from_probability(1.0).unwrap().score, 100.0);
    }

    #[test]
    fn test_score_rejects_out_of_range_probability() {
        assert!(Score::from_probability(1.5).is_err());
        assert!(Score::from_probability(-0.1).is_err());
        assert!(Score::from_probability(f32::NAN).is_err());
    }

    #[test]
    fn test_extract_probability_reads_second_class() {
        let output = ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![0.25, 0.75]).unwrap();
        assert_eq!(extract_probability(&output).unwrap(), 0.75);

        let output = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 1]), vec![0.4, 0.6]).unwrap();
        assert_eq!(extract_probability(&output).unwrap(), 0.6);
    }

    #[test]
    fn test_extract_probability_rejects_single_class() {
        let output = ArrayD::from_shape_vec(IxDyn(&[1, 1]), vec![0.9]).unwrap();
        assert!(matches!(
            extract_probability(&output),
            Err(ScoringError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_score_feeds_fixed_input_shape() {
        let model = FixedModelService::new(&[0.1, 0.9]);
        let pipeline = ScoringPipeline::new(model.clone(), Preprocessor::default());

        for (width, height) in [(640, 480), (480, 640), (240, 159)] {
            let score = pipeline.score(photo(width, height)).unwrap();
            assert_eq!(score.score, 90.0);
        }

        let shapes = model.seen_shapes.lock().unwrap();
        assert_eq!(shapes.len(), 3);
        assert!(shapes.iter().all(|shape| shape == &[1, 3, 159, 240]));
    }

    #[test]
    fn test_score_is_deterministic() {
        let pipeline = ScoringPipeline::new(FixedModelService::new(&[0.3, 0.7]), Preprocessor::default());

        let first = pipeline.score(photo(320, 200)).unwrap();
        let second = pipeline.score(photo(320, 200)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_score_propagates_model_errors() {
        let pipeline = ScoringPipeline::new(FailingModelService, Preprocessor::default());

        let err = pipeline.score(photo(64, 64)).unwrap_err();
        assert!(matches!(err, ScoringError::Model(ModelError::Inference(_))));
    }

    #[tokio::test]
    async fn test_score_upload_decodes_jpeg() {
        let pipeline = Arc::new(ScoringPipeline::new(
            FixedModelService::new(&[0.2, 0.8]),
            Preprocessor::default(),
        ));

        let score = pipeline
            .score_upload(Bytes::from(jpeg_bytes(640, 480)))
            .await
            .unwrap();

        assert_eq!(score.score, 80.0);
    }

    #[tokio::test]
    async fn test_score_upload_rejects_corrupt_data() {
        let pipeline = Arc::new(ScoringPipeline::new(
            FixedModelService::new(&[0.2, 0.8]),
            Preprocessor::default(),
        ));

        let err = pipeline
            .score_upload(Bytes::from_static(b"definitely not a jpeg"))
            .await
            .unwrap_err();

        assert!(matches!(err, ScoringError::Decode(_)));
    }
}
