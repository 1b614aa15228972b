//! Batch worker.
//!
//! Executes one closed batch: a single remote call under an explicit timeout,
//! then an all-or-nothing reduction of the outcome onto every member. Remote
//! errors, non-success statuses and timeouts all take the failure path; only
//! errors while recording the outcome escape `execute`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_types::error::{PipelineError, RepositoryError};
use parley_types::event::{BatchEvent, BatchEventKind};
use parley_types::failure::{FailedMessage, FailureContext};
use parley_types::message::{
    META_BATCH_ID, META_MEMBER_MESSAGE_IDS, META_REMOTE_MESSAGE_ID, META_TASK_ID, Message,
};
use parley_types::remote::{RemoteChatReply, RemoteChatRequest, RemoteError};
use parley_types::task::{Task, TaskStatus};
use parley_types::work::{BatchWorkItem, RetryLink};
use parley_types::Metadata;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::ChatBackend;
use crate::clock::Clock;
use crate::event::EventBus;
use crate::repository::{BatchFailure, BatchStore, BatchSuccess, SettingsRepository};

/// Result of executing one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed { task_id: Uuid, response: String },
    Failed { task_id: Uuid, error: String },
    /// The task was no longer pending (duplicate delivery after recovery).
    Skipped { task_id: Uuid },
    /// The outcome could not be recorded because the task or its retry
    /// claim moved on while the remote call ran. Nothing else was written.
    Superseded { task_id: Uuid, reason: String },
}

/// Why a batch failed, as recorded in each member's failure context.
#[derive(Debug, Clone)]
pub struct FailureCause {
    pub class: String,
    pub code: Option<String>,
    pub message: String,
}

impl FailureCause {
    /// Cause recorded for batches abandoned mid-flight by a restart.
    pub fn interrupted() -> Self {
        Self {
            class: "InterruptedError".to_string(),
            code: Some("timeout".to_string()),
            message: "processing interrupted before an outcome was recorded".to_string(),
        }
    }
}

impl From<&RemoteError> for FailureCause {
    fn from(err: &RemoteError) -> Self {
        Self {
            class: err.class().to_string(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

pub struct BatchWorker<B, S, K, C> {
    store: Arc<B>,
    settings: Arc<S>,
    backend: Arc<K>,
    clock: Arc<C>,
    events: EventBus,
}

impl<B, S, K, C> BatchWorker<B, S, K, C>
where
    B: BatchStore,
    S: SettingsRepository,
    K: ChatBackend,
    C: Clock,
{
    pub fn new(
        store: Arc<B>,
        settings: Arc<S>,
        backend: Arc<K>,
        clock: Arc<C>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            settings,
            backend,
            clock,
            events,
        }
    }

    pub async fn execute(&self, item: BatchWorkItem) -> Result<BatchOutcome, PipelineError> {
        let task = &item.task;
        if !self.store.mark_processing(&task.id, self.clock.now()).await? {
            debug!(task_id = %task.id, "task no longer pending, skipping");
            return Ok(BatchOutcome::Skipped { task_id: task.id });
        }

        match self.call_remote(&item).await {
            Ok(reply) => self.record_success(&item, reply).await,
            Err(err) => {
                warn!(
                    task_id = %task.id,
                    batch_id = %task.batch_id,
                    error = %err,
                    "remote call failed"
                );
                self.record_failure(
                    task,
                    &item.messages,
                    &FailureCause::from(&err),
                    TaskStatus::Failed,
                    item.retry.as_ref(),
                )
                .await
            }
        }
    }

    /// Request timeout of the active settings, if any are active.
    pub async fn request_timeout_secs(&self) -> Result<Option<u64>, PipelineError> {
        Ok(self
            .settings
            .active_settings()
            .await?
            .map(|settings| settings.request_timeout_secs))
    }

    async fn call_remote(&self, item: &BatchWorkItem) -> Result<RemoteChatReply, RemoteError> {
        let settings = self
            .settings
            .active_settings()
            .await
            .map_err(|e| RemoteError::Transport(format!("failed to load settings: {e}")))?
            .ok_or(RemoteError::NotConfigured)?;

        let remote_id = self
            .store
            .get_conversation(&item.task.conversation_id)
            .await
            .map_err(|e| RemoteError::Transport(format!("failed to load conversation: {e}")))?
            .and_then(|c| c.remote_id);

        let request = RemoteChatRequest {
            query: item.aggregated_content.clone(),
            conversation_id: remote_id,
            user: settings.user_id.clone(),
        };

        debug!(
            task_id = %item.task.id,
            backend = self.backend.name(),
            timeout_secs = settings.request_timeout_secs,
            "calling remote service"
        );

        match tokio::time::timeout(
            settings.request_timeout(),
            self.backend.send(&settings, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                secs: settings.request_timeout_secs,
            }),
        }
    }

    async fn record_success(
        &self,
        item: &BatchWorkItem,
        reply: RemoteChatReply,
    ) -> Result<BatchOutcome, PipelineError> {
        let task = &item.task;
        let now = self.clock.now();

        let mut metadata = Metadata::new();
        metadata.insert(META_TASK_ID.to_string(), task.id.to_string().into());
        metadata.insert(META_BATCH_ID.to_string(), task.batch_id.clone().into());
        metadata.insert(
            META_MEMBER_MESSAGE_IDS.to_string(),
            serde_json::Value::Array(
                task.message_ids
                    .iter()
                    .map(|id| id.to_string().into())
                    .collect(),
            ),
        );
        if let Some(remote_message_id) = &reply.message_id {
            metadata.insert(
                META_REMOTE_MESSAGE_ID.to_string(),
                remote_message_id.clone().into(),
            );
        }
        let assistant = Message::assistant(task.conversation_id, &reply.answer, metadata, now);

        let recorded = self
            .store
            .record_batch_success(&BatchSuccess {
                task_id: task.id,
                conversation_id: task.conversation_id,
                member_ids: task.message_ids.clone(),
                response: reply.answer.clone(),
                reply: assistant,
                remote_conversation_id: reply.conversation_id.clone(),
                completed_at: now,
                retry: item.retry.clone(),
            })
            .await;
        match recorded {
            Err(RepositoryError::Conflict(reason)) => return self.supersede(task, reason).await,
            other => other?,
        }

        info!(
            task_id = %task.id,
            batch_id = %task.batch_id,
            message_count = task.message_count,
            "batch completed"
        );

        self.publish(
            task,
            BatchEventKind::Succeeded {
                content: reply.answer.clone(),
            },
            now,
        );

        Ok(BatchOutcome::Completed {
            task_id: task.id,
            response: reply.answer,
        })
    }

    /// Reduce a batch to failure: members `failed`, one failure record per
    /// member, task terminal with `status`.
    ///
    /// Also used by crash recovery with `TaskStatus::Timeout`.
    pub async fn record_failure(
        &self,
        task: &Task,
        members: &[Message],
        cause: &FailureCause,
        status: TaskStatus,
        retry: Option<&RetryLink>,
    ) -> Result<BatchOutcome, PipelineError> {
        let now = self.clock.now();
        let failures = members
            .iter()
            .map(|member| failure_record(task, member, cause, now))
            .collect();

        let recorded = self
            .store
            .record_batch_failure(&BatchFailure {
                task_id: task.id,
                status,
                error: cause.message.clone(),
                member_ids: task.message_ids.clone(),
                failures,
                failed_at: now,
                retry: retry.cloned(),
            })
            .await;
        match recorded {
            Err(RepositoryError::Conflict(reason)) => return self.supersede(task, reason).await,
            other => other?,
        }

        info!(
            task_id = %task.id,
            batch_id = %task.batch_id,
            status = %status,
            error_class = %cause.class,
            "batch failed"
        );

        self.publish(
            task,
            BatchEventKind::Failed {
                error: cause.message.clone(),
            },
            now,
        );

        Ok(BatchOutcome::Failed {
            task_id: task.id,
            error: cause.message.clone(),
        })
    }

    /// Give up on a run whose outcome lost a race. Members and failure
    /// records stay as the winning writer left them.
    async fn supersede(&self, task: &Task, reason: String) -> Result<BatchOutcome, PipelineError> {
        warn!(
            task_id = %task.id,
            batch_id = %task.batch_id,
            reason = %reason,
            "batch outcome superseded, nothing recorded"
        );
        self.store
            .abandon_task(&task.id, &reason, self.clock.now())
            .await?;
        Ok(BatchOutcome::Superseded {
            task_id: task.id,
            reason,
        })
    }

    fn publish(&self, task: &Task, kind: BatchEventKind, now: DateTime<Utc>) {
        self.events.publish(BatchEvent {
            conversation_id: task.conversation_id,
            task_id: task.id,
            batch_id: task.batch_id.clone(),
            kind,
            triggering_message_id: task.message_ids.last().copied(),
            is_final: true,
            timestamp: now,
        });
    }
}

fn failure_record(
    task: &Task,
    member: &Message,
    cause: &FailureCause,
    now: DateTime<Utc>,
) -> FailedMessage {
    let context = FailureContext {
        exception_class: cause.class.clone(),
        exception_code: cause.code.clone(),
        content: member.content.clone(),
        role: member.role,
        task_id: Some(task.id),
        batch_processing: true,
    };
    let mut failure = FailedMessage::new(
        member.id,
        Some(task.id),
        cause.message.clone(),
        member.retry_count + 1,
        context,
        now,
    );
    failure.correlation_id = Some(task.batch_id.clone());
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use parley_types::conversation::Conversation;
    use parley_types::message::MessageStatus;

    use crate::batch::content::OrdinalLabel;
    use crate::batch::membership;
    use crate::clock::ManualClock;
    use crate::test_support::{MemoryStore, MockBackend, active_settings};

    type TestWorker = BatchWorker<MemoryStore, MemoryStore, MockBackend, ManualClock>;

    async fn worker_with(
        backend: MockBackend,
        threshold: Option<u32>,
    ) -> (TestWorker, Arc<MemoryStore>, Arc<MockBackend>, EventBus) {
        let store = Arc::new(MemoryStore::default());
        if let Some(threshold) = threshold {
            store.create_settings(&active_settings(threshold)).await.unwrap();
        }
        let backend = Arc::new(backend);
        let events = EventBus::new(16);
        let worker = BatchWorker::new(
            Arc::clone(&store),
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::new(ManualClock::default()),
            events.clone(),
        );
        (worker, store, backend, events)
    }

    /// Persist a dispatched batch of `contents` and return its work item.
    async fn dispatched_batch(store: &MemoryStore, contents: &[&str]) -> BatchWorkItem {
        let now = Utc::now();
        let conversation = Conversation::new(now);
        store.create_conversation(&conversation).await.unwrap();

        let label = OrdinalLabel::default();
        let mut task = Task::open(conversation.id, now);
        store.create_task(&task).await.unwrap();
        let mut members = Vec::new();
        for content in contents {
            let mut msg = Message::user(conversation.id, *content, now);
            store.save_message(&msg).await.unwrap();
            membership::attach(&mut task, &mut members, &mut msg, &label).unwrap();
            store.attach_message(&task, &msg).await.unwrap();
        }
        store.mark_dispatched(&task.id, now).await.unwrap();
        task.dispatched_at = Some(now);

        BatchWorkItem {
            aggregated_content: task.aggregated_content.clone(),
            task,
            messages: members,
            retry: None,
        }
    }

    #[tokio::test]
    async fn success_marks_members_sent_and_saves_reply() {
        let (worker, store, backend, events) = worker_with(MockBackend::default(), Some(5)).await;
        backend.push_reply(MockBackend::answer("hello back"));
        let mut rx = events.subscribe();
        let item = dispatched_batch(&store, &["a", "b"]).await;
        let task_id = item.task.id;
        let member_ids = item.task.message_ids.clone();

        let outcome = worker.execute(item).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Completed { .. }));

        let task = store.task(&task_id);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.response.as_deref(), Some("hello back"));
        for id in &member_ids {
            let msg = store.message(id);
            assert_eq!(msg.status, MessageStatus::Sent);
            assert!(msg.sent_at.is_some());
        }

        let replies = store.assistant_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].metadata[META_TASK_ID], task_id.to_string());
        assert_eq!(replies[0].metadata[META_REMOTE_MESSAGE_ID], "remote-msg-1");
        assert_eq!(
            replies[0].metadata[META_MEMBER_MESSAGE_IDS].as_array().unwrap().len(),
            2
        );
        assert_eq!(
            store.conversation(&task.conversation_id).remote_id.as_deref(),
            Some("remote-conv-1")
        );

        let event = rx.recv().await.unwrap();
        assert!(event.is_success());
        assert_eq!(event.triggering_message_id, member_ids.last().copied());
        assert!(event.is_final);

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].query, "消息1：\na\n\n消息2：\nb");
        assert!(requests[0].conversation_id.is_none());
        assert_eq!(requests[0].user, "tester");
    }

    #[tokio::test]
    async fn server_error_fails_every_member() {
        let (worker, store, backend, events) = worker_with(MockBackend::default(), Some(5)).await;
        backend.push_reply(MockBackend::server_error());
        let mut rx = events.subscribe();
        let item = dispatched_batch(&store, &["m1", "m2"]).await;
        let task_id = item.task.id;
        let member_ids = item.task.message_ids.clone();

        let outcome = worker.execute(item).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Failed { .. }));

        let task = store.task(&task_id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("500"));

        for id in &member_ids {
            let msg = store.message(id);
            assert_eq!(msg.status, MessageStatus::Failed);
            assert_eq!(msg.retry_count, 1);
            assert!(msg.error.is_some());
        }

        let failures = store.failures();
        assert_eq!(failures.len(), 2);
        for failure in &failures {
            assert_eq!(failure.task_id, Some(task_id));
            assert!(!failure.retried);
            assert!(failure.context.batch_processing);
            assert_eq!(failure.context.exception_class, "ServerError");
            assert_eq!(failure.context.exception_code.as_deref(), Some("500"));
            assert_eq!(failure.context.task_id, Some(task_id));
        }
        assert!(store.assistant_replies().is_empty());

        let event = rx.recv().await.unwrap();
        assert!(!event.is_success());
    }

    #[tokio::test]
    async fn missing_settings_is_a_configuration_failure() {
        let (worker, store, backend, _events) = worker_with(MockBackend::default(), None).await;
        let item = dispatched_batch(&store, &["x"]).await;

        let outcome = worker.execute(item).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Failed { .. }));
        assert_eq!(backend.request_count(), 0);
        assert_eq!(store.failures()[0].context.exception_class, "ConfigurationError");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_remote_times_out_as_failure() {
        let backend = MockBackend::with_delay(Duration::from_secs(60));
        let (worker, store, _backend, _events) = worker_with(backend, Some(5)).await;
        let item = dispatched_batch(&store, &["slow"]).await;
        let task_id = item.task.id;

        let outcome = worker.execute(item).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Failed { .. }));
        assert_eq!(store.failures()[0].context.exception_class, "TimeoutError");
        assert_eq!(store.task(&task_id).status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn persistence_error_escapes_and_leaves_members_untouched() {
        let (worker, store, backend, _events) = worker_with(MockBackend::default(), Some(5)).await;
        backend.push_reply(MockBackend::server_error());
        let item = dispatched_batch(&store, &["a", "b"]).await;
        let member_ids = item.task.message_ids.clone();
        store.fail_outcomes.store(true, Ordering::SeqCst);

        let err = worker.execute(item).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        for id in &member_ids {
            assert_eq!(store.message(id).status, MessageStatus::Pending);
        }
        assert!(store.failures().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let (worker, store, backend, _events) = worker_with(MockBackend::default(), Some(5)).await;
        let item = dispatched_batch(&store, &["once"]).await;

        worker.execute(item.clone()).await.unwrap();
        let second = worker.execute(item).await.unwrap();

        assert!(matches!(second, BatchOutcome::Skipped { .. }));
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_after_timeout_is_superseded() {
        let backend = MockBackend::with_delay(Duration::from_secs(3));
        let (worker, store, backend, _events) = worker_with(backend, Some(5)).await;
        let item = dispatched_batch(&store, &["late"]).await;
        let task = item.task.clone();
        let members = item.messages.clone();

        // Recovery gives up on the task while the remote call is in flight.
        let recover = async {
            while backend.request_count() == 0 {
                tokio::task::yield_now().await;
            }
            worker
                .record_failure(
                    &task,
                    &members,
                    &FailureCause::interrupted(),
                    TaskStatus::Timeout,
                    None,
                )
                .await
        };
        let (late, recovered) = tokio::join!(worker.execute(item), recover);

        assert!(matches!(recovered, Ok(BatchOutcome::Failed { .. })));
        assert!(matches!(late, Ok(BatchOutcome::Superseded { .. })));
        assert_eq!(store.task(&task.id).status, TaskStatus::Timeout);
        assert!(store.assistant_replies().is_empty());
        assert_eq!(store.failures().len(), 1);
        assert_eq!(store.message(&task.message_ids[0]).status, MessageStatus::Failed);
    }
}
