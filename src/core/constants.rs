//! Constants for message roles, object names and finish reasons
//!
//! String constants shared by the wire models, the conversion layer and the
//! HTTP handlers.

/// Message role constants
pub mod role {
    /// User role identifier
    pub const USER: &str = "user";

    /// Assistant role identifier
    pub const ASSISTANT: &str = "assistant";

    /// System role identifier
    pub const SYSTEM: &str = "system";

    /// Roles accepted in chat requests
    pub const ALL: [&str; 3] = [SYSTEM, USER, ASSISTANT];
}

/// Response object type constants
pub mod object {
    /// Non-streaming chat completion
    pub const CHAT_COMPLETION: &str = "chat.completion";

    /// Streaming chat completion chunk
    pub const CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";

    /// Model card
    pub const MODEL: &str = "model";

    /// List wrapper
    pub const LIST: &str = "list";
}

/// OpenAI finish reason constants
pub mod finish {
    /// Generation hit a stop condition
    pub const STOP: &str = "stop";

    /// Generation hit the token limit
    pub const LENGTH: &str = "length";
}

/// Error type constants used in error bodies
pub mod error_type {
    /// Request failed validation
    pub const INVALID_REQUEST: &str = "invalid_request_error";

    /// Client credentials rejected
    pub const AUTHENTICATION: &str = "authentication_error";

    /// Upstream rate limit
    pub const RATE_LIMIT: &str = "rate_limit_error";

    /// Unknown resource
    pub const NOT_FOUND: &str = "not_found_error";

    /// Anything else
    pub const SERVER: &str = "server_error";
}

/// Request id prefixes
pub mod id_prefix {
    /// Chat completions
    pub const CHAT: &str = "chatcmpl-";

    /// Pipeline generation
    pub const GENERATE: &str = "gen-";
}

/// Header carrying the request id, usable with the cancel endpoint
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied request id accepted
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// SSE payload that terminates a chat stream
pub const DONE_MARKER: &str = "[DONE]";

/// Characters per token used when the backend reports no prompt token count
pub const CHARS_PER_TOKEN: usize = 4;
