use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{engine::TallyError, store::StoreError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    #[error(transparent)]
    Tally(#[from] TallyError),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        AppError::Tally(error.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MalformedPayload | AppError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            AppError::Tally(TallyError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            AppError::Tally(TallyError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Tally(TallyError::Storage(message)) => {
                error!("Storage failure: {message}");

                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
