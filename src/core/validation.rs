//! Request validation
//!
//! Checks run before a request reaches the backend. Every failure maps to an
//! HTTP 400 with an `invalid_request_error` body.

use crate::core::config::RequestLimits;
use crate::core::constants::role;
use crate::models::openai::{ChatCompletionRequest, ChatMessage};
use thiserror::Error;
use tracing::warn;

/// A rejected request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub param: Option<String>,
}

impl ValidationError {
    pub fn new(param: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            param: Some(param.to_string()),
        }
    }
}

/// Validate a chat completion request
pub fn validate_chat_request(
    request: &ChatCompletionRequest,
    limits: &RequestLimits,
) -> Result<(), ValidationError> {
    if request.messages.is_empty() {
        return Err(ValidationError::new("messages", "messages must not be empty"));
    }

    for (i, msg) in request.messages.iter().enumerate() {
        if !role::ALL.contains(&msg.role.as_str()) {
            return Err(ValidationError::new(
                &format!("messages[{}].role", i),
                format!(
                    "unsupported role '{}', expected one of: system, user, assistant",
                    msg.role
                ),
            ));
        }
        if msg.role == role::USER && msg.content.trim().is_empty() {
            return Err(ValidationError::new(
                &format!("messages[{}].content", i),
                "user message content must not be empty",
            ));
        }
    }

    if let Some(last) = request.messages.last() {
        if last.role == role::SYSTEM {
            return Err(ValidationError::new(
                "messages",
                "the last message must be from the user or assistant",
            ));
        }
    }

    let total_chars: usize = request
        .messages
        .iter()
        .map(|m| m.content.chars().count())
        .sum();
    if total_chars > limits.max_input_chars {
        return Err(ValidationError::new(
            "messages",
            format!(
                "input is {} characters, the limit is {}",
                total_chars, limits.max_input_chars
            ),
        ));
    }

    if let Some(n) = request.n {
        if n != 1 {
            return Err(ValidationError::new("n", "only n = 1 is supported"));
        }
    }

    validate_sampling(request.temperature, request.top_p)
}

/// Validate sampling parameters
pub fn validate_sampling(
    temperature: Option<f32>,
    top_p: Option<f32>,
) -> Result<(), ValidationError> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ValidationError::new(
                "temperature",
                "temperature must be between 0 and 2",
            ));
        }
    }
    if let Some(p) = top_p {
        if !(p > 0.0 && p <= 1.0) {
            return Err(ValidationError::new(
                "top_p",
                "top_p must be greater than 0 and at most 1",
            ));
        }
    }
    Ok(())
}

/// Validate raw pipeline input
pub fn validate_inputs(inputs: &str, limits: &RequestLimits) -> Result<(), ValidationError> {
    if inputs.trim().is_empty() {
        return Err(ValidationError::new("inputs", "inputs must not be empty"));
    }
    let chars = inputs.chars().count();
    if chars > limits.max_input_chars {
        return Err(ValidationError::new(
            "inputs",
            format!(
                "input is {} characters, the limit is {}",
                chars, limits.max_input_chars
            ),
        ));
    }
    Ok(())
}

/// Resolve the generation length for a request
///
/// Absent means the configured default; present values are clamped into the
/// configured range. Zero is rejected.
pub fn resolve_max_tokens(
    requested: Option<u32>,
    limits: &RequestLimits,
) -> Result<u32, ValidationError> {
    match requested {
        None => Ok(limits.default_max_tokens),
        Some(0) => Err(ValidationError::new(
            "max_tokens",
            "max_tokens must be at least 1",
        )),
        Some(n) => Ok(n.clamp(limits.min_tokens, limits.max_tokens)),
    }
}

/// Drop the oldest non-system messages beyond `max_messages`
///
/// System messages are always kept, as is the newest message.
pub fn truncate_messages(messages: Vec<ChatMessage>, max_messages: usize) -> Vec<ChatMessage> {
    if messages.len() <= max_messages {
        return messages;
    }

    let original_count = messages.len();
    let system_count = messages.iter().filter(|m| m.role == role::SYSTEM).count();
    let keep_other = max_messages.saturating_sub(system_count).max(1);
    let other_count = original_count - system_count;
    let mut to_drop = other_count.saturating_sub(keep_other);

    let truncated: Vec<ChatMessage> = messages
        .into_iter()
        .filter(|m| {
            if to_drop > 0 && m.role != role::SYSTEM {
                to_drop -= 1;
                false
            } else {
                true
            }
        })
        .collect();

    warn!(
        "Context truncated: {} messages -> {} messages (removed {} oldest messages)",
        original_count,
        truncated.len(),
        original_count - truncated.len()
    );
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "tgi".to_string(),
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            seed: None,
            n: None,
            stream: false,
            stream_options: None,
        }
    }

    #[test]
    fn test_accepts_simple_conversation() {
        let req = request(vec![
            ChatMessage::new(role::SYSTEM, "Be brief."),
            ChatMessage::new(role::USER, "Hi"),
        ]);
        assert!(validate_chat_request(&req, &RequestLimits::default()).is_ok());
    }

    #[test]
    fn test_rejects_empty_messages() {
        let err = validate_chat_request(&request(vec![]), &RequestLimits::default()).unwrap_err();
        assert_eq!(err.param.as_deref(), Some("messages"));
    }

    #[test]
    fn test_rejects_unknown_role_and_blank_user() {
        let limits = RequestLimits::default();
        let bad_role = request(vec![ChatMessage::new("tool", "x")]);
        assert!(validate_chat_request(&bad_role, &limits).is_err());

        let blank = request(vec![ChatMessage::new(role::USER, "   ")]);
        let err = validate_chat_request(&blank, &limits).unwrap_err();
        assert_eq!(err.param.as_deref(), Some("messages[0].content"));
    }

    #[test]
    fn test_rejects_trailing_system_message() {
        let req = request(vec![
            ChatMessage::new(role::USER, "Hi"),
            ChatMessage::new(role::SYSTEM, "Be brief."),
        ]);
        assert!(validate_chat_request(&req, &RequestLimits::default()).is_err());
    }

    #[test]
    fn test_rejects_oversized_input() {
        let limits = RequestLimits {
            max_input_chars: 4,
            ..Default::default()
        };
        let req = request(vec![ChatMessage::new(role::USER, "too long")]);
        assert!(validate_chat_request(&req, &limits).is_err());
    }

    #[test]
    fn test_input_limit_counts_characters() {
        let limits = RequestLimits {
            max_input_chars: 4,
            ..Default::default()
        };
        // 4 characters, 8 bytes
        let req = request(vec![ChatMessage::new(role::USER, "ñäöü")]);
        assert!(validate_chat_request(&req, &limits).is_ok());
        assert!(validate_inputs("日本語だ", &limits).is_ok());
        assert!(validate_inputs("日本語です", &limits).is_err());
    }

    #[test]
    fn test_sampling_ranges() {
        assert!(validate_sampling(Some(0.0), Some(1.0)).is_ok());
        assert!(validate_sampling(Some(2.5), None).is_err());
        assert!(validate_sampling(None, Some(0.0)).is_err());
        assert!(validate_sampling(None, Some(1.5)).is_err());
    }

    #[test]
    fn test_resolve_max_tokens() {
        let limits = RequestLimits {
            default_max_tokens: 64,
            min_tokens: 8,
            max_tokens: 512,
            ..Default::default()
        };
        assert_eq!(resolve_max_tokens(None, &limits), Ok(64));
        assert_eq!(resolve_max_tokens(Some(4), &limits), Ok(8));
        assert_eq!(resolve_max_tokens(Some(9000), &limits), Ok(512));
        assert!(resolve_max_tokens(Some(0), &limits).is_err());
    }

    #[test]
    fn test_validate_inputs() {
        let limits = RequestLimits::default();
        assert!(validate_inputs("Write a poem", &limits).is_ok());
        assert!(validate_inputs("", &limits).is_err());
        assert!(validate_inputs(" \n", &limits).is_err());
    }

    #[test]
    fn test_truncate_keeps_system_and_newest() {
        let messages = vec![
            ChatMessage::new(role::SYSTEM, "sys"),
            ChatMessage::new(role::USER, "1"),
            ChatMessage::new(role::ASSISTANT, "2"),
            ChatMessage::new(role::USER, "3"),
            ChatMessage::new(role::ASSISTANT, "4"),
            ChatMessage::new(role::USER, "5"),
        ];
        let truncated = truncate_messages(messages, 3);
        let contents: Vec<&str> = truncated.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "4", "5"]);
    }

    #[test]
    fn test_truncate_noop_under_limit() {
        let messages = vec![ChatMessage::new(role::USER, "1")];
        assert_eq!(truncate_messages(messages.clone(), 3), messages);
    }
}
