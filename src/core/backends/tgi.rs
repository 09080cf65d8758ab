//! Text Generation Inference backend
//!
//! Talks to a TGI router through its native API. Chat requests are rendered
//! into a prompt with the configured template and served by `/generate` or
//! `/generate_stream`.

use crate::conversion::request_converter::convert_chat_to_generate;
use crate::conversion::response_converter::{
    convert_generate_to_chat_response, convert_token_stream_to_chunks, estimate_tokens,
};
use crate::core::backend::{Backend, BackendError, ChunkStream, TokenStream};
use crate::core::requests::RequestRegistry;
use crate::core::retry::RetryPolicy;
use crate::core::sse;
use crate::core::template::ChatTemplate;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::models::tgi::{
    ErrorResponse, GenerateRequest, GenerateResponse, InfoResponse, StreamResponse,
};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// TGI backend
pub struct TgiBackend {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    template: ChatTemplate,
    registry: Arc<RequestRegistry>,
    retry: RetryPolicy,
}

impl TgiBackend {
    /// Create a new TGI backend
    ///
    /// # Arguments
    ///
    /// * `base_url` - TGI router URL, e.g. `http://127.0.0.1:8080`
    /// * `api_token` - Optional bearer token (for hosted endpoints)
    /// * `template` - Prompt template for chat requests
    /// * `timeout` - Request timeout in seconds
    /// * `registry` - Shared in-flight request registry
    /// * `retry` - Retry policy for non-streaming calls
    pub fn new(
        base_url: String,
        api_token: Option<String>,
        template: ChatTemplate,
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
            base_url,
            api_token,
            template,
            registry,
            retry,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Turn a non-success response into a classified error
    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err.error,
            Err(_) => body,
        };
        Err(BackendError::from_status(status.as_u16(), message))
    }

    async fn send_generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, BackendError> {
        let response = self
            .request(reqwest::Method::POST, "/generate")
            .json(request)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json::<GenerateResponse>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn open_stream(&self, request: &GenerateRequest) -> Result<TokenStream, BackendError> {
        let response = self
            .request(reqwest::Method::POST, "/generate_stream")
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let response = Self::check(response).await?;
        let events = sse::data_stream(response)
            .map(|payload| payload.and_then(|p| parse_stream_event(&p)));
        Ok(Box::pin(events))
    }
}

/// Parse one `/generate_stream` payload
///
/// TGI reports failures mid-stream as `{"error": ..., "error_type": ...}`.
pub fn parse_stream_event(payload: &str) -> Result<StreamResponse, BackendError> {
    match serde_json::from_str::<StreamResponse>(payload) {
        Ok(event) => Ok(event),
        Err(parse_err) => match serde_json::from_str::<ErrorResponse>(payload) {
            Ok(err) => Err(BackendError::Api {
                status: 500,
                message: format!("{}: {}", err.error_type, err.error),
            }),
            Err(_) => Err(BackendError::Decode(format!(
                "invalid stream event ({}): {}",
                parse_err, payload
            ))),
        },
    }
}

#[async_trait]
impl Backend for TgiBackend {
    async fn generate(
        &self,
        request: &GenerateRequest,
        request_id: &str,
    ) -> Result<GenerateResponse, BackendError> {
        let guard = self.registry.register(request_id);
        let mut request = request.clone();
        request.stream = false;

        debug!("POST /generate for {}", request_id);
        guard
            .run(self.retry.run("generate", || self.send_generate(&request)))
            .await
    }

    async fn generate_stream(
        &self,
        mut request: GenerateRequest,
        request_id: &str,
    ) -> Result<TokenStream, BackendError> {
        let guard = self.registry.register(request_id);
        request.stream = true;

        debug!("POST /generate_stream for {}", request_id);
        let events = guard.run(self.open_stream(&request)).await?;
        Ok(guard.wrap_stream(events))
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let generate_request = convert_chat_to_generate(request, self.template);
        let prompt_tokens = estimate_tokens(&generate_request.inputs);

        let response = self.generate(&generate_request, request_id).await?;

        Ok(convert_generate_to_chat_response(
            &response,
            request_id,
            &request.model,
            prompt_tokens,
            &generate_request.parameters.stop,
        ))
    }

    async fn chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChunkStream, BackendError> {
        let generate_request = convert_chat_to_generate(&request, self.template);
        let prompt_tokens = estimate_tokens(&generate_request.inputs);
        let stops = generate_request.parameters.stop.clone();

        let tokens = self.generate_stream(generate_request, request_id).await?;

        Ok(convert_token_stream_to_chunks(
            tokens,
            request_id.to_string(),
            request.model,
            prompt_tokens,
            stops,
        ))
    }

    async fn info(&self) -> Result<InfoResponse, BackendError> {
        let response = self.request(reqwest::Method::GET, "/info").send().await?;
        Self::check(response)
            .await?
            .json::<InfoResponse>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn health(&self) -> Result<(), BackendError> {
        let response = self.request(reqwest::Method::GET, "/health").send().await?;
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
        "TGI"
    }
}
