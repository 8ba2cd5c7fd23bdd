//! Response framing shared by the HTTP adapters
//!
//! Byte chunks are cut into lines (NDJSON and SSE are both line based) and
//! handed to a per-backend [`LineDecoder`] that turns them into
//! [`ProviderEvent`]s.

use std::collections::VecDeque;

use colloquy_core::error::{AgentError, Result};
use colloquy_core::provider::{NormalizedMessage, ProviderEvent, ProviderStream};
use futures::StreamExt;
use futures::stream::{self, BoxStream};

/// Splits a byte stream into lines; partial lines and split UTF-8 sequences
/// wait for the next chunk
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Unterminated trailing line, if any
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// Turns protocol lines into provider events
pub(crate) trait LineDecoder: Send + 'static {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ProviderEvent>>;

    /// End of body. Must yield the final [`ProviderEvent::Done`] unless a
    /// line already did.
    fn finish(&mut self) -> Result<Vec<ProviderEvent>>;
}

/// One server-sent event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Accumulates `event:`/`data:` lines until the blank line that ends an event
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    /// Dispatch whatever has been collected
    pub(crate) fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Map a request failure onto the error taxonomy
pub(crate) fn request_error(e: &reqwest::Error) -> AgentError {
    if e.is_connect() || e.is_timeout() {
        AgentError::ProviderUnavailable(e.to_string())
    } else {
        AgentError::Provider(e.to_string())
    }
}

/// Whether an error body says the model emitted an unparseable tool call
pub(crate) fn reports_malformed_output(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("tool_use_failed")
        || (lower.contains("tool call") && (lower.contains("pars") || lower.contains("invalid")))
}

/// Classify a non-success HTTP status
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    match status.as_u16() {
        429 => AgentError::RateLimited(body.to_string()),
        401 | 403 => AgentError::Auth(body.to_string()),
        _ if reports_malformed_output(body) => AgentError::MalformedOutput(body.to_string()),
        code => AgentError::Provider(format!("HTTP {code}: {body}")),
    }
}

/// Send a request and reject non-success statuses
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| request_error(&e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = %status, "Provider request failed");
    Err(status_error(status, &body))
}

struct FrameState<D> {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    lines: LineBuffer,
    decoder: D,
    pending: VecDeque<Result<ProviderEvent>>,
    finished: bool,
}

impl<D: LineDecoder> FrameState<D> {
    fn decode(&mut self, lines: Vec<String>) {
        for line in lines {
            match self.decoder.decode_line(&line) {
                Ok(events) => self.pending.extend(events.into_iter().map(Ok)),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, error: AgentError) {
        self.pending.push_back(Err(error));
        self.finished = true;
    }

    fn end(&mut self) {
        if let Some(line) = self.lines.finish() {
            self.decode(vec![line]);
        }
        if self.finished {
            return;
        }
        match self.decoder.finish() {
            Ok(events) => self.pending.extend(events.into_iter().map(Ok)),
            Err(e) => self.pending.push_back(Err(e)),
        }
        self.finished = true;
    }
}

/// Stream a response body through `decoder`
pub(crate) fn decode_body<D: LineDecoder>(response: reqwest::Response, decoder: D) -> ProviderStream {
    let state = FrameState {
        bytes: response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed(),
        lines: LineBuffer::default(),
        decoder,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.lines.push(&chunk);
                    state.decode(lines);
                }
                Some(Err(e)) => state.fail(request_error(&e)),
                None => state.end(),
            }
        }
    }))
}

/// The final reply among decoded events
pub(crate) fn final_reply(events: Vec<ProviderEvent>) -> Result<NormalizedMessage> {
    events
        .into_iter()
        .rev()
        .find_map(|e| match e {
            ProviderEvent::Done(reply) => Some(reply),
            _ => None,
        })
        .ok_or_else(|| AgentError::Provider("response carried no final message".into()))
}

/// Run `decoder` over a complete body
#[cfg(test)]
pub(crate) fn decode_text<D: LineDecoder>(mut decoder: D, body: &str) -> Result<Vec<ProviderEvent>> {
    let mut lines = LineBuffer::default();
    let mut events = Vec::new();
    for line in lines.push(body.as_bytes()) {
        events.extend(decoder.decode_line(&line)?);
    }
    if let Some(line) = lines.finish() {
        events.extend(decoder.decode_line(&line)?);
    }
    events.extend(decoder.finish()?);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_utf8() {
        let mut buf = LineBuffer::default();
        let text = "héllo\r\nwörld";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo"]);
        assert_eq!(buf.finish().as_deref(), Some("wörld"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_sse_parser() {
        let mut parser = SseParser::default();
        assert_eq!(parser.push_line(": keep-alive"), None);
        assert_eq!(parser.push_line("event: message_start"), None);
        assert_eq!(parser.push_line("data: {\"a\":1}"), None);
        assert_eq!(
            parser.push_line(""),
            Some(SseEvent {
                event: Some("message_start".into()),
                data: "{\"a\":1}".into(),
            })
        );

        parser.push_line("data:line one");
        parser.push_line("data: line two");
        let event = parser.push_line("").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "line one\nline two");

        assert_eq!(parser.push_line(""), None);
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;

        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow"),
            AgentError::RateLimited(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key"),
            AgentError::Auth(_)
        ));
        assert!(matches!(
            status_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"error parsing tool call: unexpected end of JSON input"}"#
            ),
            AgentError::MalformedOutput(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, r#"{"error":{"code":"tool_use_failed"}}"#),
            AgentError::MalformedOutput(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "upstream"),
            AgentError::Provider(_)
        ));
    }
}
