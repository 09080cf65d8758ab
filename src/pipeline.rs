//! Text generation pipeline
//!
//! Bundles preprocessing (validation, defaults, truncation), the backend
//! call and postprocessing (stop sequence trimming, full-text assembly)
//! behind one call per request kind.

use crate::conversion::response_converter::filter_token_stream;
use crate::conversion::stop::trim_at_stop;
use crate::core::backend::{Backend, BackendError, ChunkStream, TokenStream};
use crate::core::config::RequestLimits;
use crate::core::validation::{
    ValidationError, resolve_max_tokens, truncate_messages, validate_chat_request,
    validate_inputs, validate_sampling,
};
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::models::tgi::{GenerateRequest, GenerateResponse};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Pipeline failure
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Text generation pipeline over a backend
pub struct TextGenerationPipeline {
    backend: Arc<dyn Backend>,
    limits: RequestLimits,
    model_id: String,
    served_model: String,
}

impl TextGenerationPipeline {
    /// Create a pipeline
    ///
    /// # Arguments
    ///
    /// * `backend` - Backend that runs inference
    /// * `limits` - Request limits and defaults
    /// * `model_id` - Model name reported to clients
    /// * `served_model` - Model name sent to the backend
    pub fn new(
        backend: Arc<dyn Backend>,
        limits: RequestLimits,
        model_id: String,
        served_model: String,
    ) -> Self {
        Self {
            backend,
            limits,
            model_id,
            served_model,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Validate a generation request and fill in defaults
    ///
    /// `return_full_text` is handled by postprocessing, so the backend is
    /// always asked for the continuation only.
    pub fn preprocess_generate(
        &self,
        mut request: GenerateRequest,
    ) -> Result<GenerateRequest, ValidationError> {
        validate_inputs(&request.inputs, &self.limits)?;

        let params = &mut request.parameters;
        validate_sampling(params.temperature, params.top_p)?;
        params.max_new_tokens = Some(resolve_max_tokens(params.max_new_tokens, &self.limits)?);
        // TGI rejects temperature 0 and top_p 1
        match params.temperature {
            Some(t) if t > 0.0 => params.do_sample = true,
            Some(_) => {
                params.temperature = None;
                params.do_sample = false;
            }
            None => {}
        }
        params.top_p = params.top_p.filter(|p| *p < 1.0);
        params.return_full_text = Some(false);

        Ok(request)
    }

    /// Validate a chat request, truncate long conversations and fill in
    /// defaults
    pub fn preprocess_chat(
        &self,
        mut request: ChatCompletionRequest,
    ) -> Result<ChatCompletionRequest, ValidationError> {
        request.messages = truncate_messages(request.messages, self.limits.max_messages);
        validate_chat_request(&request, &self.limits)?;
        request.max_tokens = Some(resolve_max_tokens(request.max_tokens, &self.limits)?);
        request.model = self.served_model.clone();
        Ok(request)
    }

    /// Run a generation request to completion
    pub async fn run(
        &self,
        request: GenerateRequest,
        request_id: &str,
    ) -> Result<GenerateResponse, PipelineError> {
        let full_text = request.parameters.return_full_text.unwrap_or(false);
        let prompt = request.inputs.clone();
        let request = self.preprocess_generate(request)?;

        info!(
            "Generate {}: {} chars, max_new_tokens={:?}",
            request_id,
            prompt.len(),
            request.parameters.max_new_tokens
        );

        let response = self.backend.generate(&request, request_id).await?;
        Ok(postprocess(response, &prompt, &request.parameters.stop, full_text))
    }

    /// Run a generation request as a token stream
    ///
    /// Stop sequences are cut from the tokens and the final `generated_text`,
    /// matching what `run` returns.
    pub async fn run_stream(
        &self,
        request: GenerateRequest,
        request_id: &str,
    ) -> Result<TokenStream, PipelineError> {
        let request = self.preprocess_generate(request)?;
        info!(
            "Generate stream {}: max_new_tokens={:?}",
            request_id, request.parameters.max_new_tokens
        );
        let stops = request.parameters.stop.clone();
        let tokens = self.backend.generate_stream(request, request_id).await?;
        Ok(filter_token_stream(tokens, stops))
    }

    /// Run a chat completion
    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatCompletionResponse, PipelineError> {
        let request = self.preprocess_chat(request)?;
        info!(
            "Chat {}: messages={}, max_tokens={:?}",
            request_id,
            request.messages.len(),
            request.max_tokens
        );

        let mut response = self.backend.chat_completion(&request, request_id).await?;
        response.id = request_id.to_string();
        response.model = self.model_id.clone();
        Ok(response)
    }

    /// Run a streaming chat completion
    pub async fn chat_stream(
        &self,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChunkStream, PipelineError> {
        let request = self.preprocess_chat(request)?;
        info!(
            "Chat stream {}: messages={}, max_tokens={:?}",
            request_id,
            request.messages.len(),
            request.max_tokens
        );

        let chunks = self
            .backend
            .chat_completion_stream(request, request_id)
            .await?;

        let id = request_id.to_string();
        let model = self.model_id.clone();
        Ok(Box::pin(chunks.map(move |item| {
            item.map(|mut chunk| {
                chunk.id = id.clone();
                chunk.model = model.clone();
                chunk
            })
        })))
    }
}

/// Trim the continuation at stop sequences and optionally prepend the prompt
fn postprocess(
    mut response: GenerateResponse,
    prompt: &str,
    stops: &[String],
    full_text: bool,
) -> GenerateResponse {
    let trimmed = trim_at_stop(&response.generated_text, stops).to_string();
    debug!(
        "Postprocess: {} chars generated, {} kept",
        response.generated_text.len(),
        trimmed.len()
    );

    response.generated_text = if full_text {
        format!("{}{}", prompt, trimmed)
    } else {
        trimmed
    };
    response
}
