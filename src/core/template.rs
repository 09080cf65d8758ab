//! Chat prompt templates
//!
//! Backends that only take raw text (TGI `/generate`) need the conversation
//! flattened into one prompt. Each template also contributes the stop
//! sequences that mark the end of an assistant turn.

use crate::core::constants::role;
use crate::models::openai::ChatMessage;

/// Supported prompt formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>role\ncontent<|im_end|>`
    ChatMl,
    /// `[INST] ... [/INST]` with the system prompt folded into the first turn
    Llama2,
    /// `<|role|>\ncontent</s>`
    Zephyr,
    /// `role: content` lines
    Plain,
}

impl ChatTemplate {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chatml" | "chat_ml" => Some(ChatTemplate::ChatMl),
            "llama2" | "llama-2" | "llama_2" => Some(ChatTemplate::Llama2),
            "zephyr" => Some(ChatTemplate::Zephyr),
            "plain" | "none" => Some(ChatTemplate::Plain),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatTemplate::ChatMl => "chatml",
            ChatTemplate::Llama2 => "llama2",
            ChatTemplate::Zephyr => "zephyr",
            ChatTemplate::Plain => "plain",
        }
    }

    /// Stop sequences that end an assistant turn
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            ChatTemplate::ChatMl => &["<|im_end|>"],
            ChatTemplate::Llama2 | ChatTemplate::Zephyr => &["</s>"],
            ChatTemplate::Plain => &[],
        }
    }

    /// Render messages into a prompt ending with the assistant prefix
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            ChatTemplate::ChatMl => render_chatml(messages),
            ChatTemplate::Llama2 => render_llama2(messages),
            ChatTemplate::Zephyr => render_zephyr(messages),
            ChatTemplate::Plain => render_plain(messages),
        }
    }
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            msg.role, msg.content
        ));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn render_llama2(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    let mut system: Vec<&str> = Vec::new();
    let last = messages.len().saturating_sub(1);

    for (i, msg) in messages.iter().enumerate() {
        match msg.role.as_str() {
            role::SYSTEM => system.push(&msg.content),
            role::USER => push_llama2_turn(&mut prompt, &mut system, &msg.content),
            role::ASSISTANT => {
                if !system.is_empty() {
                    push_llama2_turn(&mut prompt, &mut system, "");
                }
                prompt.push(' ');
                prompt.push_str(&msg.content);
                // a trailing assistant message is continued, not closed
                if i != last {
                    prompt.push_str(" </s>");
                }
            }
            _ => {}
        }
    }

    if !system.is_empty() {
        push_llama2_turn(&mut prompt, &mut system, "");
    }
    prompt
}

/// Open an `[INST]` turn, folding in any pending system messages
fn push_llama2_turn(prompt: &mut String, system: &mut Vec<&str>, content: &str) {
    prompt.push_str("<s>[INST] ");
    if !system.is_empty() {
        prompt.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", system.join("\n\n")));
        system.clear();
    }
    prompt.push_str(content);
    prompt.push_str(" [/INST]");
}

fn render_zephyr(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str(&format!("<|{}|>\n{}</s>\n", msg.role, msg.content));
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

fn render_plain(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str(&format!("{}: {}\n", msg.role, msg.content));
    }
    prompt.push_str("assistant:");
    prompt
}
