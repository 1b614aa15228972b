//! Axum router configuration with middleware.
//!
//! All pipeline routes are under `/api/v1/`; `/health` sits at the root.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Intake
        .route("/messages", post(handlers::message::post_message))
        .route("/flush", post(handlers::message::flush))
        .route("/batches/open", get(handlers::message::open_batches))
        // Conversations
        .route(
            "/conversations/{id}/messages",
            get(handlers::message::list_messages),
        )
        .route(
            "/conversations/{id}/archive",
            post(handlers::message::archive_conversation),
        )
        // Tasks
        .route("/tasks/{id}", get(handlers::task::get_task))
        .route(
            "/tasks/by-batch/{batch_id}",
            get(handlers::task::get_task_by_batch_id),
        )
        .route("/tasks/{id}/retry", post(handlers::failure::retry_task))
        .route(
            "/batches/{batch_id}/retry",
            post(handlers::failure::retry_batch),
        )
        // Failures
        .route("/failed", get(handlers::failure::list_failed))
        .route("/failed/retry", post(handlers::failure::retry_many))
        .route("/failed/{id}", get(handlers::failure::get_failed))
        .route("/failed/{id}/retry", post(handlers::failure::retry_failed))
        // Settings
        .route(
            "/settings",
            get(handlers::settings::list_settings).post(handlers::settings::create_settings),
        )
        .route(
            "/settings/active",
            get(handlers::settings::get_active_settings),
        )
        .route(
            "/settings/{id}/activate",
            post(handlers::settings::activate_settings),
        )
        // Stats
        .route("/stats", get(handlers::stats::get_stats));

    Router::new()
        .route("/health", get(handlers::stats::health))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use serde_json::{Value, json};

    use super::*;
    use crate::state::Workers;

    async fn echo(Json(body): Json<Value>) -> impl IntoResponse {
        Json(json!({
            "answer": format!("echo: {}", body["query"].as_str().unwrap_or_default()),
            "conversation_id": "remote-conv-1",
            "message_id": "remote-msg-1",
        }))
    }

    async fn broken() -> impl IntoResponse {
        (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Fake remote chat service: `/ok` answers, `/broken` fails with 500.
    async fn fake_remote() -> String {
        spawn(
            Router::new()
                .route("/ok/chat-messages", post(echo))
                .route("/broken/chat-messages", post(broken)),
        )
        .await
    }

    struct Harness {
        _dir: tempfile::TempDir,
        api: String,
        remote: String,
        client: reqwest::Client,
        workers: Workers,
    }

    impl Harness {
        async fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (state, receiver) = AppState::open(dir.path()).await.unwrap();
            let workers = state.start_workers(receiver, false);
            let api = spawn(build_router(state)).await;
            Self {
                _dir: dir,
                api,
                remote: fake_remote().await,
                client: reqwest::Client::new(),
                workers,
            }
        }

        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let resp = self
                .client
                .get(format!("{}{path}", self.api))
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }

        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let resp = self
                .client
                .post(format!("{}{path}", self.api))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }

        async fn use_remote(&self, route: &str, threshold: u32) -> Value {
            let (status, body) = self
                .post(
                    "/api/v1/settings",
                    json!({
                        "name": route,
                        "base_url": format!("{}/{route}", self.remote),
                        "api_key": "sk-test-abcd1234",
                        "user_id": "tester",
                        "batch_threshold": threshold,
                        "request_timeout_secs": 5,
                        "activate": true,
                    }),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            body["data"].clone()
        }

        /// Poll a task until it reaches a terminal status.
        async fn wait_for_task(&self, task_id: &str) -> Value {
            for _ in 0..100 {
                let (_, body) = self.get(&format!("/api/v1/tasks/{task_id}")).await;
                let status = body["data"]["status"].as_str().unwrap_or_default().to_string();
                if matches!(status.as_str(), "completed" | "failed" | "timeout") {
                    return body["data"].clone();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("task {task_id} never finished");
        }
    }

    #[tokio::test]
    async fn health_is_served_outside_the_api_prefix() {
        let harness = Harness::start().await;
        let (status, body) = harness.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        harness.workers.shutdown().await;
    }

    #[tokio::test]
    async fn threshold_batch_is_delivered_through_the_api() {
        let harness = Harness::start().await;
        let settings = harness.use_remote("ok", 2).await;
        assert_eq!(settings["key_hint"], "...1234");
        assert_eq!(settings["is_active"], true);

        let (status, first) = harness
            .post("/api/v1/messages", json!({ "content": "hello" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let conversation_id = first["data"]["conversation_id"].as_str().unwrap().to_string();

        let (_, open) = harness.get("/api/v1/batches/open").await;
        assert_eq!(open["data"].as_array().unwrap().len(), 1);

        let (_, second) = harness
            .post(
                "/api/v1/messages",
                json!({ "content": "world", "conversation_id": conversation_id }),
            )
            .await;
        let task_id = second["data"]["task_id"].as_str().unwrap().to_string();
        assert_eq!(first["data"]["task_id"].as_str().unwrap(), task_id);

        let task = harness.wait_for_task(&task_id).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["message_count"], 2);
        let response = task["response"].as_str().unwrap();
        assert!(response.starts_with("echo: "));
        assert!(response.contains("hello") && response.contains("world"));

        let (_, history) = harness
            .get(&format!("/api/v1/conversations/{conversation_id}/messages"))
            .await;
        let roles: Vec<&str> = history["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "user", "assistant"]);

        harness.workers.shutdown().await;
    }

    #[tokio::test]
    async fn failed_batch_can_be_retried_by_task() {
        let harness = Harness::start().await;
        harness.use_remote("broken", 1).await;

        let (_, posted) = harness
            .post("/api/v1/messages", json!({ "content": "are you there?" }))
            .await;
        let task_id = posted["data"]["task_id"].as_str().unwrap().to_string();
        let task = harness.wait_for_task(&task_id).await;
        assert_eq!(task["status"], "failed");

        let (_, failed) = harness
            .get(&format!("/api/v1/failed?task_id={task_id}&retried=false"))
            .await;
        let records = failed["data"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        let failed_id = records[0]["id"].as_str().unwrap().to_string();

        harness.use_remote("ok", 1).await;
        let (status, report) = harness
            .post(&format!("/api/v1/tasks/{task_id}/retry"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["data"]["success"], true);

        let mut retried = Value::Null;
        for _ in 0..100 {
            let (_, body) = harness.get(&format!("/api/v1/failed/{failed_id}")).await;
            if body["data"]["retried"] == true {
                retried = body["data"].clone();
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(retried["retried"], true);
        assert_eq!(retried["retry_history"].as_array().unwrap().len(), 1);

        // A second retry of the same record is refused.
        let (status, body) = harness
            .post(&format!("/api/v1/failed/{failed_id}/retry"), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "ALREADY_RETRIED");

        harness.workers.shutdown().await;
    }

    #[tokio::test]
    async fn errors_use_the_envelope() {
        let harness = Harness::start().await;

        let (status, body) = harness
            .get(&format!("/api/v1/tasks/{}", uuid::Uuid::now_v7()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["data"].is_null());
        assert_eq!(body["errors"][0]["code"], "NOT_FOUND");

        let (status, body) = harness
            .post("/api/v1/messages", json!({ "content": "   " }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");

        let (status, _) = harness
            .post(
                &format!("/api/v1/settings/{}/activate", uuid::Uuid::now_v7()),
                json!({}),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Unknown batch ids are reported, not raised.
        let (status, body) = harness
            .post("/api/v1/batches/batch_missing/retry", json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["success"], false);

        harness.workers.shutdown().await;
    }

    #[tokio::test]
    async fn flush_without_settings_dispatches_the_open_batch() {
        let harness = Harness::start().await;

        let (_, posted) = harness
            .post("/api/v1/messages", json!({ "content": "queued" }))
            .await;
        let conversation_id = posted["data"]["conversation_id"].as_str().unwrap().to_string();

        let (status, flushed) = harness
            .post(
                &format!("/api/v1/flush?conversation_id={conversation_id}"),
                json!({}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let task_id = flushed["data"]["id"].as_str().unwrap().to_string();

        // No active settings: the remote call fails and the member is retriable.
        let task = harness.wait_for_task(&task_id).await;
        assert_eq!(task["status"], "failed");

        let (_, stats) = harness.get("/api/v1/stats").await;
        assert_eq!(stats["data"]["unretried_failures"], 1);
        assert_eq!(stats["data"]["tasks"]["failed"], 1);

        // Flushing again finds nothing open.
        let (_, again) = harness
            .post(
                &format!("/api/v1/flush?conversation_id={conversation_id}"),
                json!({}),
            )
            .await;
        assert!(again["data"].is_null());

        harness.workers.shutdown().await;
    }
}
