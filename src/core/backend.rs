//! Backend abstraction layer for inference servers
//!
//! This module defines a common trait for the servers the gateway forwards
//! to (a TGI instance speaking its native API, or any OpenAI-compatible chat
//! server) together with the error type they share.

use crate::models::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::models::tgi::{GenerateRequest, GenerateResponse, InfoResponse, StreamResponse};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Error types for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Backend timed out: {0}")]
    Timeout(String),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl BackendError {
    /// Classify a non-success upstream status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => BackendError::Authentication(message),
            429 => BackendError::RateLimit(message),
            400 | 422 => BackendError::BadRequest(message),
            503 => BackendError::Unavailable(message),
            _ => BackendError::Api { status, message },
        }
    }

    /// Whether a failed non-streaming call may be repeated
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::RateLimit(_) | BackendError::Unavailable(_) | BackendError::Timeout(_) => {
                true
            }
            BackendError::Api { status, .. } => matches!(status, 502 | 504),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connect() {
            BackendError::Unavailable(e.to_string())
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            BackendError::from_status(status.as_u16(), e.to_string())
        } else {
            BackendError::Unexpected(e.to_string())
        }
    }
}

/// Stream of TGI token events
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, BackendError>> + Send>>;

/// Stream of chat completion chunks
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, BackendError>> + Send>>;

/// Trait for inference backends
///
/// Requests arrive already validated; `max_tokens` / `max_new_tokens` are
/// always set.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Raw text generation
    async fn generate(
        &self,
        request: &GenerateRequest,
        request_id: &str,
    ) -> Result<GenerateResponse, BackendError>;

    /// Raw text generation, one event per token
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        request_id: &str,
    ) -> Result<TokenStream, BackendError>;

    /// Chat completion
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatCompletionResponse, BackendError>;

    /// Streaming chat completion
    async fn chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChunkStream, BackendError>;

    /// Model and server information
    async fn info(&self) -> Result<InfoResponse, BackendError>;

    /// Liveness of the backend
    async fn health(&self) -> Result<(), BackendError>;

    /// Cancel an in-flight request
    async fn cancel_request(&self, request_id: &str) -> bool;

    /// Get the backend name
    fn backend_name(&self) -> &str;
}

/// Supported backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Tgi,
    OpenAI,
}

impl BackendType {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tgi" | "text-generation-inference" => Some(BackendType::Tgi),
            "openai" | "openai-compatible" | "messages" => Some(BackendType::OpenAI),
            _ => None,
        }
    }
}
