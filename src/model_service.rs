use ndarray::{Array4, ArrayD};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("session mutex poisoned: {0}")]
    SessionPoisoned(String),
    #[error("failed to build tensor: {0}")]
    Tensor(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model produced no output named `{0}`")]
    MissingOutput(String),
    #[error("invalid tensor shape: {0}")]
    OutputShape(String),
}

/// A loaded classifier that can run one forward pass.
///
/// Implementations own any state the pass mutates; callers hand over a
/// freshly built NCHW tensor for every request.
pub trait ModelService: Send + Sync + Clone + 'static {
    fn forward(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError>;
}
