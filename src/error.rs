//! Application-wide error type and its HTTP mapping.

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("{0}")]
  NotFound(String),

  #[error("{0}")]
  BadRequest(String),

  /// Generation requested but no language model is configured.
  #[error("{0}")]
  Unavailable(String),

  #[error("language model error: {0}")]
  Llm(String),

  #[error("generator execution failed: {0}")]
  Runner(String),

  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("archive error: {0}")]
  Archive(#[from] zip::result::ZipError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

impl AppError {
  pub fn not_found(what: impl Into<String>) -> Self {
    AppError::NotFound(what.into())
  }

  pub fn status(&self) -> StatusCode {
    match self {
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
      AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      AppError::Llm(_) => StatusCode::BAD_GATEWAY,
      AppError::Runner(_) => StatusCode::UNPROCESSABLE_ENTITY,
      AppError::Database(_) | AppError::Archive(_) | AppError::Io(_) | AppError::Json(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!(target: "gestalt_backend", %status, error = %self, "Request failed");
    } else {
      warn!(target: "gestalt_backend", %status, error = %self, "Request rejected");
    }
    (status, Json(json!({ "detail": self.to_string() }))).into_response()
  }
}
