mod health;
mod metrics;
mod score_photo;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use score_photo::{allowed_file, UploadError};

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/", post(score_photo::score_photo::<M>))
        .route("/health_check", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<M>))
}
