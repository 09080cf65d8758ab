//! Server-sent event parsing for upstream streams
//!
//! Both TGI `/generate_stream` and OpenAI-style chat streams send one JSON
//! payload per `data:` line. Chat streams end with `data: [DONE]`.

use crate::core::backend::BackendError;
use crate::core::constants::DONE_MARKER;
use futures::stream::Stream;
use futures::{StreamExt, TryStreamExt};
use std::pin::Pin;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;

/// Classification of one SSE line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A `data:` payload
    Data(String),
    /// The `[DONE]` terminator
    Done,
    /// Blank lines, comments and non-data fields
    Skip,
}

/// Classify a single line of an SSE body
pub fn parse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    let Some(payload) = trimmed.strip_prefix("data:") else {
        return SseLine::Skip;
    };

    let payload = payload.trim_start();
    if payload == DONE_MARKER {
        SseLine::Done
    } else if payload.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Data(payload.to_string())
    }
}

/// Turn an SSE response body into a stream of `data:` payloads
pub fn data_stream(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>> {
    let byte_stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    let reader = tokio_util::io::StreamReader::new(byte_stream);
    let lines = LinesStream::new(tokio::io::BufReader::new(reader).lines());

    lines_to_payloads(lines.map_err(|e| BackendError::Unexpected(e.to_string())))
}

/// Filter a line stream down to data payloads, stopping at `[DONE]`
pub fn lines_to_payloads<S>(
    lines: S,
) -> Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>
where
    S: Stream<Item = Result<String, BackendError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => match parse_line(&line) {
                    SseLine::Data(payload) => yield Ok(payload),
                    SseLine::Done => break,
                    SseLine::Skip => continue,
                },
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
