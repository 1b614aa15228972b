//! HttpChatBackend -- concrete [`ChatBackend`] for the remote chat service.
//!
//! Sends `POST {base_url}/chat-messages` with a bearer API key taken from the
//! active [`ServiceSettings`]. The key is only exposed while building request
//! headers and never appears in logs.

use parley_core::backend::ChatBackend;
use parley_types::remote::{RemoteChatReply, RemoteChatRequest, RemoteError};
use parley_types::settings::ServiceSettings;
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::sync::mpsc;

use super::streaming::{StreamItem, chat_stream};

/// Request body for `/chat-messages`.
#[derive(Debug, Serialize)]
pub(crate) struct ChatMessagesBody<'a> {
    inputs: serde_json::Map<String, serde_json::Value>,
    query: &'a str,
    response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    user: &'a str,
}

impl<'a> ChatMessagesBody<'a> {
    pub(crate) fn new(request: &'a RemoteChatRequest, response_mode: &'static str) -> Self {
        Self {
            inputs: serde_json::Map::new(),
            query: &request.query,
            response_mode,
            conversation_id: request.conversation_id.as_deref(),
            user: &request.user,
        }
    }
}

/// Map a non-success HTTP status to a [`RemoteError`].
pub(crate) fn status_error(status: reqwest::StatusCode, body: String) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::AuthenticationFailed,
        429 => RemoteError::RateLimited,
        s if s >= 500 => RemoteError::Server { status: s, body },
        s => RemoteError::Rejected { status: s, body },
    }
}

/// Pass successful responses through; turn anything else into an error.
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = %status, "remote chat service returned an error");
    Err(status_error(status, body))
}

pub(crate) fn transport_error(err: reqwest::Error, settings: &ServiceSettings) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout {
            secs: settings.request_timeout_secs,
        }
    } else {
        RemoteError::Transport(err.to_string())
    }
}

pub(crate) fn chat_url(settings: &ServiceSettings) -> String {
    format!("{}/chat-messages", settings.base_url.trim_end_matches('/'))
}

/// Remote chat service over HTTP.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
}

impl HttpChatBackend {
    pub fn new() -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Stream a reply incrementally.
    ///
    /// A producer task reads the response body and forwards parsed chunks onto
    /// a channel of `capacity`; the receiver yields `None` once the remote
    /// signals completion or an error has been delivered.
    pub fn stream(
        &self,
        settings: &ServiceSettings,
        request: &RemoteChatRequest,
        capacity: usize,
    ) -> mpsc::Receiver<StreamItem> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = chat_stream(self.client.clone(), settings.clone(), request.clone());

        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                let is_err = item.is_err();
                if tx.send(item).await.is_err() || is_err {
                    break;
                }
            }
        });

        rx
    }
}

impl ChatBackend for HttpChatBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        settings: &ServiceSettings,
        request: &RemoteChatRequest,
    ) -> Result<RemoteChatReply, RemoteError> {
        let response = self
            .client
            .post(chat_url(settings))
            .bearer_auth(settings.api_key.expose_secret())
            .timeout(settings.request_timeout())
            .json(&ChatMessagesBody::new(request, "blocking"))
            .send()
            .await
            .map_err(|e| transport_error(e, settings))?;

        error_for_status(response)
            .await?
            .json::<RemoteChatReply>()
            .await
            .map_err(|e| RemoteError::Deserialization(format!("failed to parse reply: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use chrono::Utc;
    use secrecy::SecretString;

    async fn echo(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(serde_json::json!({
            "answer": format!(
                "{auth}|{}|{}|{}",
                body["query"].as_str().unwrap_or_default(),
                body["response_mode"].as_str().unwrap_or_default(),
                body["conversation_id"].as_str().unwrap_or("-"),
            ),
            "conversation_id": "remote-conv",
            "message_id": "remote-msg",
        }))
    }

    async fn fail_with(Path(code): Path<u16>) -> impl IntoResponse {
        (StatusCode::from_u16(code).unwrap(), "boom")
    }

    async fn slow() -> impl IntoResponse {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        "late"
    }

    async fn streamed() -> impl IntoResponse {
        concat!(
            "data: {\"event\":\"message\",\"answer\":\"Hel\",\"conversation_id\":\"c1\"}\n\n",
            ": keep-alive\n\n",
            "data: {\"event\":\"message\",\"answer\":\"lo\",\"conversation_id\":\"c1\"}\n\n",
            "data: [DONE]\n\n",
        )
    }

    /// Serve a fake remote on an ephemeral port and return its base URL.
    pub(crate) async fn fake_remote() -> String {
        let app = Router::new()
            .route("/ok/chat-messages", post(echo))
            .route("/status/{code}/chat-messages", post(fail_with))
            .route("/slow/chat-messages", post(slow))
            .route("/stream/chat-messages", post(streamed));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub(crate) fn settings_for(base_url: String) -> ServiceSettings {
        let mut settings = ServiceSettings::new(
            "fake",
            base_url,
            SecretString::from("sk-fake-1234"),
            "tester",
            Utc::now(),
        );
        settings.request_timeout_secs = 1;
        settings
    }

    fn request(conversation_id: Option<&str>) -> RemoteChatRequest {
        RemoteChatRequest {
            query: "hello".to_string(),
            conversation_id: conversation_id.map(str::to_string),
            user: "tester".to_string(),
        }
    }

    #[tokio::test]
    async fn sends_blocking_request_with_bearer_key() {
        let base = fake_remote().await;
        let backend = HttpChatBackend::new().unwrap();

        let reply = backend
            .send(&settings_for(format!("{base}/ok/")), &request(Some("c-9")))
            .await
            .unwrap();
        assert_eq!(reply.answer, "Bearer sk-fake-1234|hello|blocking|c-9");
        assert_eq!(reply.conversation_id.as_deref(), Some("remote-conv"));
        assert_eq!(reply.message_id.as_deref(), Some("remote-msg"));

        let reply = backend
            .send(&settings_for(format!("{base}/ok")), &request(None))
            .await
            .unwrap();
        assert!(reply.answer.ends_with("|-"));
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let base = fake_remote().await;
        let backend = HttpChatBackend::new().unwrap();
        let send = |code: u16| {
            let backend = backend.clone();
            let settings = settings_for(format!("{base}/status/{code}"));
            async move { backend.send(&settings, &request(None)).await.unwrap_err() }
        };

        assert!(matches!(send(401).await, RemoteError::AuthenticationFailed));
        assert!(matches!(send(429).await, RemoteError::RateLimited));
        assert!(matches!(send(500).await, RemoteError::Server { status: 500, .. }));
        assert!(matches!(send(400).await, RemoteError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn request_timeout_is_reported() {
        let base = fake_remote().await;
        let backend = HttpChatBackend::new().unwrap();
        let err = backend
            .send(&settings_for(format!("{base}/slow")), &request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { secs: 1 }));
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_transport_error() {
        let backend = HttpChatBackend::new().unwrap();
        let err = backend
            .send(&settings_for("http://127.0.0.1:1".to_string()), &request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[tokio::test]
    async fn stream_delivers_chunks_until_done() {
        let base = fake_remote().await;
        let backend = HttpChatBackend::new().unwrap();
        let mut rx = backend.stream(&settings_for(format!("{base}/stream")), &request(None), 1);

        let mut answer = String::new();
        while let Some(item) = rx.recv().await {
            let chunk = item.unwrap();
            assert_eq!(chunk.conversation_id.as_deref(), Some("c1"));
            answer.push_str(&chunk.answer);
        }
        assert_eq!(answer, "Hello");
    }

    #[tokio::test]
    async fn stream_reports_http_errors() {
        let base = fake_remote().await;
        let backend = HttpChatBackend::new().unwrap();
        let mut rx = backend.stream(&settings_for(format!("{base}/status/503")), &request(None), 4);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Err(RemoteError::Server { status: 503, .. })));
        assert!(rx.recv().await.is_none());
    }
}
