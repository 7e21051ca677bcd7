mod ort_service;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod model_service;
pub mod preprocessing;
pub mod scoring;

pub use app::start_app;
pub use routes::{allowed_file, UploadError};
pub use server::{build_router, SharedState};
pub use telemetry::Metrics;
