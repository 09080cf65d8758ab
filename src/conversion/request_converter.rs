//! Request conversion between the chat API and the TGI generation API
//!
//! A chat request becomes a single prompt for TGI `/generate`; a raw
//! generation request becomes a one-message chat for OpenAI-compatible
//! backends.

use crate::core::constants::role;
use crate::core::template::ChatTemplate;
use crate::models::openai::{ChatCompletionRequest, ChatMessage, StopSequences, StreamOptions};
use crate::models::tgi::{GenerateParameters, GenerateRequest};
use tracing::debug;

/// Convert a chat request into a TGI generation request
///
/// The conversation is rendered with `template`, whose stop sequences are
/// appended to the client's. TGI rejects a zero temperature and a `top_p`
/// of 1, so those are expressed as greedy decoding / omitted instead.
///
/// # Arguments
///
/// * `chat_request` - The validated chat request (`max_tokens` resolved)
/// * `template` - Prompt template for the served model
pub fn convert_chat_to_generate(
    chat_request: &ChatCompletionRequest,
    template: ChatTemplate,
) -> GenerateRequest {
    let inputs = template.render(&chat_request.messages);

    let mut stop = chat_request.stop_sequences();
    for s in template.stop_sequences() {
        if !stop.iter().any(|existing| existing == s) {
            stop.push(s.to_string());
        }
    }

    let temperature = chat_request.temperature.unwrap_or(1.0);
    let do_sample = temperature > 0.0;

    debug!(
        "Rendered {} messages with {} template ({} chars)",
        chat_request.messages.len(),
        template.name(),
        inputs.len()
    );

    GenerateRequest {
        inputs,
        parameters: GenerateParameters {
            max_new_tokens: chat_request.max_tokens,
            temperature: if do_sample {
                chat_request.temperature
            } else {
                None
            },
            top_p: chat_request.top_p.filter(|p| *p < 1.0),
            top_k: None,
            repetition_penalty: None,
            do_sample,
            stop,
            seed: chat_request.seed,
            return_full_text: Some(false),
            details: true,
        },
        stream: chat_request.stream,
    }
}

/// Convert a TGI generation request into a single-turn chat request
///
/// # Arguments
///
/// * `generate_request` - The validated generation request
/// * `model` - Model name to send upstream
pub fn convert_generate_to_chat(
    generate_request: &GenerateRequest,
    model: &str,
) -> ChatCompletionRequest {
    let params = &generate_request.parameters;

    let temperature = match (params.do_sample, params.temperature) {
        (false, _) => Some(0.0),
        (true, t) => t,
    };

    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::new(role::USER, generate_request.inputs.clone())],
        max_tokens: params.max_new_tokens,
        temperature,
        top_p: params.top_p,
        stop: if params.stop.is_empty() {
            None
        } else {
            Some(StopSequences::Many(params.stop.clone()))
        },
        seed: params.seed,
        n: None,
        stream: generate_request.stream,
        stream_options: if generate_request.stream {
            Some(StreamOptions {
                include_usage: true,
            })
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "tgi".to_string(),
            messages: vec![
                ChatMessage::new(role::SYSTEM, "You are a poet."),
                ChatMessage::new(role::USER, "Write a poem"),
            ],
            max_tokens: Some(20),
            temperature: Some(0.7),
            top_p: Some(1.0),
            stop: Some(StopSequences::Single("\n\n".to_string())),
            seed: Some(7),
            n: None,
            stream: true,
            stream_options: None,
        }
    }

    #[test]
    fn test_chat_to_generate() {
        let generate = convert_chat_to_generate(&chat_request(), ChatTemplate::ChatMl);

        assert!(generate.inputs.ends_with("<|im_start|>assistant\n"));
        assert!(generate.stream);
        let params = &generate.parameters;
        assert_eq!(params.max_new_tokens, Some(20));
        assert_eq!(params.temperature, Some(0.7));
        assert!(params.do_sample);
        assert_eq!(params.top_p, None);
        assert_eq!(params.stop, vec!["\n\n".to_string(), "<|im_end|>".to_string()]);
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.return_full_text, Some(false));
        assert!(params.details);
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let mut request = chat_request();
        request.temperature = Some(0.0);
        let generate = convert_chat_to_generate(&request, ChatTemplate::Plain);
        assert!(!generate.parameters.do_sample);
        assert_eq!(generate.parameters.temperature, None);
        assert_eq!(generate.parameters.stop, vec!["\n\n".to_string()]);
    }

    #[test]
    fn test_template_stop_not_duplicated() {
        let mut request = chat_request();
        request.stop = Some(StopSequences::Single("</s>".to_string()));
        let generate = convert_chat_to_generate(&request, ChatTemplate::Zephyr);
        assert_eq!(generate.parameters.stop, vec!["</s>".to_string()]);
    }

    #[test]
    fn test_generate_to_chat() {
        let generate = GenerateRequest {
            inputs: "Write a poem".to_string(),
            parameters: GenerateParameters {
                max_new_tokens: Some(50),
                stop: vec!["###".to_string()],
                ..Default::default()
            },
            stream: false,
        };

        let chat = convert_generate_to_chat(&generate, "served");
        assert_eq!(chat.model, "served");
        assert_eq!(chat.messages, vec![ChatMessage::new(role::USER, "Write a poem")]);
        assert_eq!(chat.max_tokens, Some(50));
        assert_eq!(chat.temperature, Some(0.0));
        assert_eq!(chat.stop_sequences(), vec!["###".to_string()]);
        assert!(chat.stream_options.is_none());
    }
}
