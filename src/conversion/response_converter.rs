//! Response conversion between the TGI generation API and the chat API
//!
//! Supports both non-streaming responses and token streams, in both
//! directions.

use crate::conversion::stop::{StopSequenceFilter, trim_at_stop};
use crate::core::backend::{BackendError, ChunkStream, TokenStream};
use crate::core::constants::{CHARS_PER_TOKEN, finish, object, role};
use crate::models::openai::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta, ChatMessage, ChunkChoice,
    Usage,
};
use crate::models::tgi::{Details, FinishReason, GenerateResponse, StreamResponse, Token};
use futures::StreamExt;
use tracing::warn;

/// Rough token count for text the backend did not count for us
pub fn estimate_tokens(text: &str) -> u32 {
    std::cmp::max(1, text.chars().count() / CHARS_PER_TOKEN) as u32
}

/// Map a TGI finish reason to the chat API's
pub fn finish_reason_to_openai(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => finish::LENGTH,
        FinishReason::EosToken | FinishReason::StopSequence => finish::STOP,
    }
}

/// Map a chat API finish reason to TGI's
pub fn finish_reason_from_openai(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::EosToken,
    }
}

/// Build a single-choice streaming chunk
pub fn make_chunk(
    id: &str,
    model: &str,
    created: i64,
    delta: ChatDelta,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: object::CHAT_COMPLETION_CHUNK.to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage,
    }
}

/// Convert a TGI generation response to a chat completion
///
/// # Arguments
///
/// * `response` - The TGI response
/// * `id` - Completion id
/// * `model` - Model name reported to the client
/// * `prompt_tokens` - Prompt token count (estimated by the caller)
/// * `stops` - Stop sequences to cut from the generated text
pub fn convert_generate_to_chat_response(
    response: &GenerateResponse,
    id: &str,
    model: &str,
    prompt_tokens: u32,
    stops: &[String],
) -> ChatCompletionResponse {
    let text = trim_at_stop(&response.generated_text, stops);

    let (finish_reason, completion_tokens) = match &response.details {
        Some(details) => (
            finish_reason_to_openai(details.finish_reason),
            details.generated_tokens,
        ),
        None => (finish::STOP, estimate_tokens(&response.generated_text)),
    };

    ChatCompletionResponse {
        id: id.to_string(),
        object: object::CHAT_COMPLETION.to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new(role::ASSISTANT, text),
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: Usage::new(prompt_tokens, completion_tokens),
    }
}

/// Convert a chat completion to a TGI generation response
pub fn convert_chat_to_generate_response(
    response: &ChatCompletionResponse,
    with_details: bool,
) -> Result<GenerateResponse, BackendError> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| BackendError::Decode("response contains no choices".to_string()))?;

    let details = with_details.then(|| Details {
        finish_reason: finish_reason_from_openai(choice.finish_reason.as_deref()),
        generated_tokens: response.usage.completion_tokens,
        seed: None,
    });

    Ok(GenerateResponse {
        generated_text: choice.message.content.clone(),
        details,
    })
}

/// Convert a TGI token stream into chat completion chunks
///
/// The first chunk carries the assistant role. Special tokens are dropped and
/// stop sequences are cut from the text. The final TGI event produces a last
/// chunk with `finish_reason` and usage.
pub fn convert_token_stream_to_chunks(
    tokens: TokenStream,
    id: String,
    model: String,
    prompt_tokens: u32,
    stops: Vec<String>,
) -> ChunkStream {
    let stream = async_stream::stream! {
        let created = chrono::Utc::now().timestamp();
        let mut filter = StopSequenceFilter::new(stops);
        let mut generated = 0u32;
        let mut finished = false;

        yield Ok(make_chunk(
            &id,
            &model,
            created,
            ChatDelta {
                role: Some(role::ASSISTANT.to_string()),
                content: None,
            },
            None,
            None,
        ));

        tokio::pin!(tokens);

        while let Some(item) = tokens.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            generated += 1;

            let mut text = if event.token.special {
                String::new()
            } else {
                filter.push(&event.token.text)
            };

            if let Some(details) = event.details {
                text.push_str(&filter.finish());
                if !text.is_empty() {
                    yield Ok(make_chunk(
                        &id,
                        &model,
                        created,
                        ChatDelta { role: None, content: Some(text) },
                        None,
                        None,
                    ));
                }
                yield Ok(make_chunk(
                    &id,
                    &model,
                    created,
                    ChatDelta::default(),
                    Some(finish_reason_to_openai(details.finish_reason)),
                    Some(Usage::new(prompt_tokens, details.generated_tokens)),
                ));
                finished = true;
                break;
            }

            if !text.is_empty() {
                yield Ok(make_chunk(
                    &id,
                    &model,
                    created,
                    ChatDelta { role: None, content: Some(text) },
                    None,
                    None,
                ));
            }
        }

        if !finished {
            warn!("Token stream for {} ended after {} tokens without details", id, generated);
            yield Err(BackendError::Unexpected(
                "backend stream ended before generation finished".to_string(),
            ));
        }
    };

    Box::pin(stream)
}

/// Convert chat completion chunks into TGI token events
///
/// Each content delta becomes one token event. The chunk carrying
/// `finish_reason` produces the final event with `generated_text` and
/// details; a stream that ends without one yields an error instead.
pub fn convert_chunk_stream_to_tokens(chunks: ChunkStream) -> TokenStream {
    let stream = async_stream::stream! {
        let mut generated_text = String::new();
        let mut index = 0u32;
        let mut finish_reason: Option<FinishReason> = None;
        let mut completion_tokens: Option<u32> = None;

        tokio::pin!(chunks);

        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            if let Some(usage) = chunk.usage {
                completion_tokens = Some(usage.completion_tokens);
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                generated_text.push_str(&content);
                yield Ok(StreamResponse {
                    index,
                    token: Token {
                        id: index,
                        text: content,
                        logprob: None,
                        special: false,
                    },
                    generated_text: None,
                    details: None,
                });
                index += 1;
            }

            if let Some(reason) = choice.finish_reason {
                finish_reason = Some(finish_reason_from_openai(Some(&reason)));
            }
        }

        // usage may arrive in a chunk after the one carrying finish_reason
        let Some(reason) = finish_reason else {
            warn!("Chat stream ended after {} tokens without a finish reason", index);
            yield Err(BackendError::Unexpected(
                "backend stream ended before generation finished".to_string(),
            ));
            return;
        };
        yield Ok(StreamResponse {
            index,
            token: Token {
                id: index,
                text: String::new(),
                logprob: None,
                special: true,
            },
            generated_text: Some(generated_text),
            details: Some(Details {
                finish_reason: reason,
                generated_tokens: completion_tokens.unwrap_or(index),
                seed: None,
            }),
        });
    };

    Box::pin(stream)
}

/// Apply stop sequences to a TGI token stream
///
/// Token text that may start a stop sequence is held back, and nothing after
/// a match is emitted. The final event keeps its details, with the finish
/// reason set to `stop_sequence` on a match, and its `generated_text` is cut
/// at the first stop sequence.
pub fn filter_token_stream(tokens: TokenStream, stops: Vec<String>) -> TokenStream {
    if stops.iter().all(|s| s.is_empty()) {
        return tokens;
    }

    let stream = async_stream::stream! {
        let mut filter = StopSequenceFilter::new(stops.clone());
        tokio::pin!(tokens);

        while let Some(item) = tokens.next().await {
            let mut event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut text = if event.token.special {
                String::new()
            } else {
                filter.push(&event.token.text)
            };

            if event.details.is_none() {
                if !text.is_empty() {
                    event.token.text = text;
                    yield Ok(event);
                }
                continue;
            }

            text.push_str(&filter.finish());
            if event.token.special {
                if !text.is_empty() {
                    yield Ok(StreamResponse {
                        index: event.index,
                        token: Token {
                            id: event.token.id,
                            text,
                            logprob: None,
                            special: false,
                        },
                        generated_text: None,
                        details: None,
                    });
                }
            } else {
                event.token.text = text;
            }

            if filter.is_stopped() {
                if let Some(details) = event.details.as_mut() {
                    details.finish_reason = FinishReason::StopSequence;
                }
            }
            event.generated_text = event
                .generated_text
                .map(|t| trim_at_stop(&t, &stops).to_string());
            yield Ok(event);
            return;
        }
    };

    Box::pin(stream)
}
