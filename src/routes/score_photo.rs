use crate::{
    model_service::ModelService,
    scoring::{Score, ScoringError},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{multipart::Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const ROUTE: &str = "/";
const FILE_FIELD: &str = "file";
const ALLOWED_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("File not present in request")]
    MissingFile,
    #[error("File name is not present in request")]
    MissingFileName,
    #[error("Invalid file type")]
    InvalidFileType,
    #[error("Malformed multipart body: {0}")]
    MalformedMultipart(String),
    #[error("Scoring failed: {0}")]
    Scoring(#[from] ScoringError),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match self {
            UploadError::MissingFile
            | UploadError::MissingFileName
            | UploadError::InvalidFileType
            | UploadError::MalformedMultipart(_) => StatusCode::BAD_REQUEST,
            UploadError::Scoring(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Accepts only names whose text after the last `.` is an allowed
/// extension, compared case-insensitively.
pub fn allowed_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .map(|(_, extension)| ALLOWED_EXTENSIONS.contains(&extension.to_lowercase().as_str()))
        .unwrap_or(false)
}

struct Upload {
    file_name: String,
    data: Bytes,
}

/// Finds the `file` part. Parts without a filename are plain form values and
/// do not count as the upload.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::MalformedMultipart(e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        if file_name.is_empty() {
            return Err(UploadError::MissingFileName);
        }
        if !allowed_file(&file_name) {
            return Err(UploadError::InvalidFileType);
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| UploadError::MalformedMultipart(e.body_text()))?;

        return Ok(Upload { file_name, data });
    }

    Err(UploadError::MissingFile)
}

#[instrument(skip(state, multipart))]
pub async fn score_photo<M: ModelService>(
    State(state): State<SharedState<M>>,
    mut multipart: Multipart,
) -> Result<Json<Score>, UploadError> {
    tracing::info!("API called!");
    state.metrics.record_request(ROUTE);

    let upload = read_upload(&mut multipart).await.inspect_err(|e| {
        tracing::warn!("Rejected upload: {}", e);
    })?;
    tracing::info!(
        "Received a photo! {} ({} bytes)",
        upload.file_name,
        upload.data.len()
    );

    let started = Instant::now();
    let result = state.pipeline.clone().score_upload(upload.data).await;
    state
        .metrics
        .record_scoring_duration(started.elapsed().as_millis() as u64, ROUTE);

    let score = result.inspect_err(|e| tracing::error!("Scoring failed: {}", e))?;
    state.metrics.record_score(score.score, ROUTE);

    Ok(Json(score))
}
