//! Error types for the algorithm runner.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to fetch image: {0}")]
    ImageFetch(String),

    #[error("Image is {0} bytes, above the configured limit")]
    ImageTooLarge(usize),

    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::ImageFetch(_) => (StatusCode::BAD_GATEWAY, "image_fetch_failed"),
            Error::ImageTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "image_too_large"),
            Error::UnsupportedImage(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_image"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
