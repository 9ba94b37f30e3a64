//! Shared HTTP plumbing for the adapters: status classification and SSE
//! decoding.

use futures::{Stream, StreamExt};
use reqwest::StatusCode;

use super::{Backend, ChunkStream};
use crate::error::BackendError;

/// Upper bound on error body text carried into a `BackendError`.
const MAX_ERROR_BODY: usize = 512;

/// Map a non-success HTTP status onto the canonical error kinds.
pub(crate) fn status_error(backend: Backend, status: StatusCode, body: &str) -> BackendError {
    let reason = format!("{} {}", status.as_u16(), truncate_body(body));
    match status.as_u16() {
        401 | 403 => BackendError::auth(backend, reason),
        402 | 429 => BackendError::quota(backend, reason),
        _ => BackendError::transient(backend, reason),
    }
}

/// Transport-level failures (connect, timeout, decode) are always transient.
pub(crate) fn transport_error(backend: Backend, err: reqwest::Error) -> BackendError {
    BackendError::transient(backend, err.to_string())
}

pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &body[..end])
}

/// Read the body of a failed response and classify it.
pub(crate) async fn response_error(backend: Backend, response: reqwest::Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(backend, status, &body)
}

/// Extracts the text delta from one decoded SSE `data:` payload.
pub(crate) type DeltaExtractor = fn(&serde_json::Value) -> Option<String>;

enum SseLine {
    Chunk(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str, extract: DeltaExtractor) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => match extract(&value) {
            Some(text) if !text.is_empty() => SseLine::Chunk(text),
            _ => SseLine::Skip,
        },
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable SSE payload");
            SseLine::Skip
        }
    }
}

type ByteStream = std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    eof: bool,
    done: bool,
}

/// Decode a server-sent-events response body into text chunks.
pub(crate) fn sse_stream(
    backend: Backend,
    response: reqwest::Response,
    extract: DeltaExtractor,
) -> ChunkStream {
    let bytes: ByteStream = Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string())),
    );
    decode_sse(backend, bytes, extract)
}

fn decode_sse(backend: Backend, bytes: ByteStream, extract: DeltaExtractor) -> ChunkStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        eof: false,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, move |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim(), extract) {
                    SseLine::Chunk(text) => return Some((Ok(text), state)),
                    SseLine::Done => {
                        state.done = true;
                        return None;
                    }
                    SseLine::Skip => continue,
                }
            }
            if state.eof {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(reason)) => {
                    state.done = true;
                    return Some((Err(BackendError::transient(backend, reason)), state));
                }
                None => {
                    state.eof = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    }))
}
