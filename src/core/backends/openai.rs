//! OpenAI-compatible backend
//!
//! Forwards chat requests to any server exposing `/chat/completions`
//! (TGI's Messages API, vLLM, OpenAI itself). Raw generation requests are
//! sent as single-turn chats.

use crate::conversion::request_converter::convert_generate_to_chat;
use crate::conversion::response_converter::{
    convert_chat_to_generate_response, convert_chunk_stream_to_tokens,
};
use crate::core::backend::{Backend, BackendError, ChunkStream, TokenStream};
use crate::core::requests::RequestRegistry;
use crate::core::retry::RetryPolicy;
use crate::core::sse;
use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ErrorResponse,
    StreamOptions,
};
use crate::models::tgi::{GenerateRequest, GenerateResponse, InfoResponse};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// OpenAI-compatible backend
pub struct OpenAIBackend {
    client: Client,
    api_key: String,
    base_url: String,
    served_model: String,
    registry: Arc<RequestRegistry>,
    retry: RetryPolicy,
}

impl OpenAIBackend {
    /// Create a new OpenAI-compatible backend
    ///
    /// # Arguments
    ///
    /// * `api_key` - Bearer token for the upstream
    /// * `base_url` - API base URL, e.g. `http://tgi:8080/v1`
    /// * `served_model` - Model name sent upstream
    /// * `timeout` - Request timeout in seconds
    /// * `registry` - Shared in-flight request registry
    /// * `retry` - Retry policy for non-streaming calls
    pub fn new(
        api_key: String,
        base_url: String,
        served_model: String,
        timeout: u64,
        registry: Arc<RequestRegistry>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url,
            served_model,
            registry,
            retry,
        })
    }

    /// Classify upstream errors and provide helpful messages
    fn classify_error(error_detail: &str) -> String {
        let error_lower = error_detail.to_lowercase();

        if error_lower.contains("invalid_api_key") || error_lower.contains("unauthorized") {
            return "Invalid API key. Please check openai.api_key in the configuration."
                .to_string();
        }

        if error_lower.contains("rate_limit") || error_lower.contains("quota") {
            return "Rate limit exceeded. Please wait and try again.".to_string();
        }

        if error_lower.contains("model")
            && (error_lower.contains("not found") || error_lower.contains("does not exist"))
        {
            return "Model not found. Please check model.served_model in the configuration."
                .to_string();
        }

        match serde_json::from_str::<ErrorResponse>(error_detail) {
            Ok(err) => err.error.message,
            Err(_) => error_detail.to_string(),
        }
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BackendError::from_status(
            status.as_u16(),
            Self::classify_error(&error_text),
        ))
    }

    fn upstream_request(&self, request: &ChatCompletionRequest) -> ChatCompletionRequest {
        let mut request = request.clone();
        request.model = self.served_model.clone();
        request
    }

    async fn send_completion_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| BackendError::Decode(format!("Failed to parse response: {}", e)))
    }

    async fn send_stream_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let response = Self::check(response).await?;
        let chunks = sse::data_stream(response).map(|payload| {
            payload.and_then(|p| {
                serde_json::from_str::<ChatCompletionChunk>(&p)
                    .map_err(|e| BackendError::Decode(format!("invalid chunk ({}): {}", e, p)))
            })
        });
        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl Backend for OpenAIBackend {
    async fn generate(
        &self,
        request: &GenerateRequest,
        request_id: &str,
    ) -> Result<GenerateResponse, BackendError> {
        let mut chat_request = convert_generate_to_chat(request, &self.served_model);
        chat_request.stream = false;
        chat_request.stream_options = None;

        let response = self.chat_completion(&chat_request, request_id).await?;
        convert_chat_to_generate_response(&response, request.parameters.details)
    }

    async fn generate_stream(
        &self,
        request: GenerateRequest,
        request_id: &str,
    ) -> Result<TokenStream, BackendError> {
        let chat_request = convert_generate_to_chat(&request, &self.served_model);
        let chunks = self.chat_completion_stream(chat_request, request_id).await?;
        Ok(convert_chunk_stream_to_tokens(chunks))
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let guard = self.registry.register(request_id);
        let upstream = self.upstream_request(request);

        debug!("POST /chat/completions for {}", request_id);
        guard
            .run(
                self.retry
                    .run("chat completion", || self.send_completion_request(&upstream)),
            )
            .await
    }

    async fn chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChunkStream, BackendError> {
        let guard = self.registry.register(request_id);
        let mut upstream = self.upstream_request(&request);
        upstream.stream = true;
        if upstream.stream_options.is_none() {
            upstream.stream_options = Some(StreamOptions {
                include_usage: true,
            });
        }

        debug!("POST /chat/completions (stream) for {}", request_id);
        let chunks = guard.run(self.send_stream_request(&upstream)).await?;
        Ok(guard.wrap_stream(chunks))
    }

    async fn info(&self) -> Result<InfoResponse, BackendError> {
        Ok(InfoResponse {
            model_id: self.served_model.clone(),
            ..Default::default()
        })
    }

    async fn health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn cancel_request(&self, request_id: &str) -> bool {
        let cancelled = self.registry.cancel(request_id);
        if cancelled {
            info!("Cancelled request {}", request_id);
        }
        cancelled
    }

    fn backend_name(&self) -> &str {
        "OpenAI-compatible"
    }
}
