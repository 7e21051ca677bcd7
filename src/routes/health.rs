use crate::preprocessing::{INPUT_HEIGHT, INPUT_WIDTH};
use axum::response::{IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
    input_width: u32,
    input_height: u32,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(HealthStatus {
        status: "Available",
        input_width: INPUT_WIDTH,
        input_height: INPUT_HEIGHT,
    })
}
