//! ChatBackend trait definition.
//!
//! This is the port the batch worker calls to reach the remote conversational
//! service. Uses RPITIT like the repository traits; the HTTP implementation
//! lives in parley-infra (`HttpChatBackend`).

use parley_types::remote::{RemoteChatReply, RemoteChatRequest, RemoteError};
use parley_types::settings::ServiceSettings;

/// Trait for remote chat service backends.
///
/// Settings are passed per call so that activating new settings takes effect
/// on the next batch without rebuilding the backend.
pub trait ChatBackend: Send + Sync + 'static {
    /// Human-readable backend name (e.g., "http").
    fn name(&self) -> &str;

    /// Send one blocking request and wait for the full reply.
    ///
    /// Any non-success status or transport error is returned as `RemoteError`.
    /// Callers are responsible for bounding the call with a timeout.
    fn send(
        &self,
        settings: &ServiceSettings,
        request: &RemoteChatRequest,
    ) -> impl std::future::Future<Output = Result<RemoteChatReply, RemoteError>> + Send;
}
