//! The user-facing JSON web server. A single route accepts an image upload
//! and answers with the text the model reads in it.

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use thiserror::Error;

mod protocol;
pub mod routes;

pub use protocol::{ErrorResponse, PredictResponse};

/// Message returned when the request carries no file upload
pub const NO_FILE: &str = "No file provided";

/// Everything that can go wrong while serving a request
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No file provided")]
    NoFile,

    #[error("upload exceeds the limit of {0} bytes")]
    PayloadTooLarge(usize),

    /// Multipart errors can wrap non-`Send` actix errors, so only the
    /// message is kept
    #[error("failed to read upload: {0}")]
    Upload(String),

    #[error("{0}")]
    Decode(#[from] image::ImageError),

    #[error("{0}")]
    Inference(#[from] anyhow::Error),
}

impl actix_web::error::ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(ErrorResponse {
                error: self.to_string(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NoFile => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            // Undecodable images are reported like any other failure
            ServiceError::Upload(_) | ServiceError::Decode(_) | ServiceError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<actix_multipart::MultipartError> for ServiceError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        ServiceError::Upload(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ServiceError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ServiceError::Inference(anyhow::anyhow!(err.to_string()))
    }
}

/// Upload limits for the prediction route
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

/// Register the service's routes. `app_data` must already hold the
/// transcriber and the [`UploadLimit`].
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(routes::predict);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::ResponseError;

    #[actix_web::test]
    async fn test_error_statuses() {
        assert_eq!(ServiceError::NoFile.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::PayloadTooLarge(10).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServiceError::Inference(anyhow::anyhow!("out of memory")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let decode = image::load_from_memory(b"not an image").unwrap_err();
        assert_eq!(
            ServiceError::from(decode).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_error_body() {
        let response = ServiceError::NoFile.error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": NO_FILE }));
    }
}
