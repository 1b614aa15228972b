//! Streaming replies from the remote chat service.
//!
//! With `response_mode: "streaming"` the service answers with a line-delimited
//! body: each event is a `data: {json}` line, blank lines and `:` comments are
//! keep-alives, and `data: [DONE]` (or a `message_end` event) terminates the
//! stream. An `error` event ends the stream with a [`RemoteError::Stream`].

use futures_util::{Stream, StreamExt};
use parley_types::remote::{RemoteChatRequest, RemoteError, StreamChunk};
use parley_types::settings::ServiceSettings;
use secrecy::ExposeSecret;

use super::client::{ChatMessagesBody, chat_url, error_for_status, transport_error};

pub type StreamItem = Result<StreamChunk, RemoteError>;

/// One parsed line of a streaming body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Chunk(StreamChunk),
    Done,
    /// Keep-alive, comment or an event carrying no text.
    Skip,
}

pub fn parse_stream_line(line: &str) -> Result<StreamLine, RemoteError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| RemoteError::Deserialization(format!("stream event: {e}")))?;
    match value.get("event").and_then(|v| v.as_str()) {
        Some("error") => {
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("remote reported an error");
            return Err(RemoteError::Stream(message.to_string()));
        }
        Some("message_end") => return Ok(StreamLine::Done),
        _ => {}
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|e| RemoteError::Deserialization(format!("stream chunk: {e}")))?;
    if chunk.answer.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Chunk(chunk))
    }
}

/// Issue a streaming request and yield its chunks.
pub(crate) fn chat_stream(
    client: reqwest::Client,
    settings: ServiceSettings,
    request: RemoteChatRequest,
) -> impl Stream<Item = StreamItem> + Send + 'static {
    async_stream::try_stream! {
        let response = client
            .post(chat_url(&settings))
            .bearer_auth(settings.api_key.expose_secret())
            .timeout(settings.request_timeout())
            .json(&ChatMessagesBody::new(&request, "streaming"))
            .send()
            .await
            .map_err(|e| transport_error(e, &settings))?;
        let response = error_for_status(response).await?;

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut done = false;

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| RemoteError::Stream(format!("response body read: {e}")))?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_stream_line(&String::from_utf8_lossy(&line))? {
                    StreamLine::Chunk(chunk) => yield chunk,
                    StreamLine::Done => {
                        done = true;
                        break 'read;
                    }
                    StreamLine::Skip => {}
                }
            }
        }

        if !done && !buffer.is_empty() {
            let tail = String::from_utf8_lossy(&buffer);
            if let StreamLine::Chunk(chunk) = parse_stream_line(&tail)? {
                yield chunk;
            }
        }
    }
}
