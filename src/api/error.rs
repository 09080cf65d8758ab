//! HTTP error responses
//!
//! Chat endpoints answer with the OpenAI error body, the generation
//! endpoints with the TGI one. Validation failures are 400, a rejected
//! client key is 401, an upstream rate limit is 429, and everything else
//! is 500 carrying the failure message.

use crate::core::backend::BackendError;
use crate::core::constants::error_type;
use crate::models::{openai, tgi};
use crate::pipeline::PipelineError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Which error body to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    OpenAI,
    Tgi,
}

/// An error ready to be sent to the client
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
    pub param: Option<String>,
    pub format: ErrorFormat,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
            param: None,
            format: ErrorFormat::OpenAI,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            error_type::AUTHENTICATION,
            "Invalid API key",
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_type::NOT_FOUND, message)
    }

    pub fn with_format(mut self, format: ErrorFormat) -> Self {
        self.format = format;
        self
    }

    /// Map a pipeline failure to a status code and error type
    pub fn from_pipeline(err: PipelineError, format: ErrorFormat) -> Self {
        let api_error = match err {
            PipelineError::Validation(v) => Self {
                status: StatusCode::BAD_REQUEST,
                error_type: error_type::INVALID_REQUEST,
                message: v.message,
                param: v.param,
                format,
            },
            PipelineError::Backend(b) => Self::from_backend(b, format),
        };

        if api_error.status.is_server_error() {
            error!("Request failed: {}", api_error.message);
        }
        api_error
    }

    fn from_backend(err: BackendError, format: ErrorFormat) -> Self {
        let (status, kind) = match &err {
            BackendError::RateLimit(_) => (StatusCode::TOO_MANY_REQUESTS, error_type::RATE_LIMIT),
            BackendError::BadRequest(_) => (StatusCode::BAD_REQUEST, error_type::INVALID_REQUEST),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, error_type::SERVER),
        };
        Self {
            status,
            error_type: kind,
            message: err.to_string(),
            param: None,
            format,
        }
    }

    /// JSON body in the OpenAI shape
    pub fn openai_body(&self) -> openai::ErrorResponse {
        openai::ErrorResponse {
            error: openai::ErrorDetail {
                message: self.message.clone(),
                error_type: self.error_type.to_string(),
                param: self.param.clone(),
                code: None,
            },
        }
    }

    /// JSON body in the TGI shape
    pub fn tgi_body(&self) -> tgi::ErrorResponse {
        tgi::ErrorResponse {
            error: self.message.clone(),
            error_type: self.error_type.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.format {
            ErrorFormat::OpenAI => (self.status, Json(self.openai_body())).into_response(),
            ErrorFormat::Tgi => (self.status, Json(self.tgi_body())).into_response(),
        }
    }
}
