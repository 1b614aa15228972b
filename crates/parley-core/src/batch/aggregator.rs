//! Message aggregator.
//!
//! Buffers inbound user messages per conversation into one open batch and
//! closes it when the active settings' message threshold is reached or the
//! aggregation window has elapsed. Both checks run after every
//! `add_message`; there is no timer thread (see `StaleBatchSweeper` for the
//! optional periodic sweep).
//!
//! Each conversation's state lives behind its own async mutex, so all
//! read-modify-write of a batch is serialized per conversation while
//! different conversations proceed in parallel.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parley_types::conversation::{Conversation, ConversationStatus};
use parley_types::error::PipelineError;
use parley_types::message::{META_AGGREGATED, Message};
use parley_types::task::Task;
use parley_types::work::{BatchWorkItem, WorkItem};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::content::OrdinalLabel;
use super::membership;
use crate::clock::Clock;
use crate::dispatch::DispatchQueue;
use crate::repository::{BatchStore, SettingsRepository};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Window after which an open batch closes on the next check.
    pub timeout: Duration,
    pub ordinal_label: OrdinalLabel,
}

impl AggregatorConfig {
    pub fn new(timeout_secs: u64, ordinal_label: impl Into<String>) -> Self {
        Self {
            timeout: Duration::seconds(timeout_secs as i64),
            ordinal_label: OrdinalLabel::new(ordinal_label),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::seconds(30),
            ordinal_label: OrdinalLabel::default(),
        }
    }
}

/// Per-conversation aggregation state.
#[derive(Debug)]
pub struct AggregatorState {
    pub conversation_id: Uuid,
    pub open_task: Option<Task>,
    pub window_start: Option<DateTime<Utc>>,
    /// Members of `open_task`, in arrival order.
    pub members: Vec<Message>,
    archived: bool,
}

impl AggregatorState {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            open_task: None,
            window_start: None,
            members: Vec::new(),
            archived: false,
        }
    }

    fn reset(&mut self) {
        self.open_task = None;
        self.window_start = None;
        self.members.clear();
    }
}

/// A batch still collecting messages.
#[derive(Debug, Clone, Serialize)]
pub struct OpenBatch {
    pub conversation_id: Uuid,
    pub task_id: Uuid,
    pub batch_id: String,
    pub message_count: u32,
    pub window_start: Option<DateTime<Utc>>,
}

pub struct Aggregator<B, S, Q, C> {
    store: Arc<B>,
    settings: Arc<S>,
    queue: Arc<Q>,
    clock: Arc<C>,
    config: AggregatorConfig,
    sessions: DashMap<Uuid, Arc<Mutex<AggregatorState>>>,
    current: Mutex<Option<Uuid>>,
}

impl<B, S, Q, C> Aggregator<B, S, Q, C>
where
    B: BatchStore,
    S: SettingsRepository,
    Q: DispatchQueue,
    C: Clock,
{
    pub fn new(
        store: Arc<B>,
        settings: Arc<S>,
        queue: Arc<Q>,
        clock: Arc<C>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            settings,
            queue,
            clock,
            config,
            sessions: DashMap::new(),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// The conversation used when callers do not name one.
    pub async fn current_conversation(&self) -> Option<Uuid> {
        *self.current.lock().await
    }

    /// Buffer one user message and close its batch if a threshold is met.
    ///
    /// Returns the persisted message with its batch back-reference set.
    pub async fn add_message(
        &self,
        content: &str,
        conversation_id: Option<Uuid>,
    ) -> Result<Message, PipelineError> {
        if content.trim().is_empty() {
            return Err(PipelineError::Validation(
                "message content must not be empty".to_string(),
            ));
        }

        let conversation_id = self.resolve_conversation(conversation_id).await?;
        self.buffer(conversation_id, content).await
    }

    /// Append to the session of an already resolved conversation.
    ///
    /// Archival is re-checked under the session lock: the conversation may
    /// have been archived after it was resolved.
    async fn buffer(&self, conversation_id: Uuid, content: &str) -> Result<Message, PipelineError> {
        let session = self.session(conversation_id);
        let mut state = session.lock().await;
        if state.archived {
            return Err(archived(conversation_id));
        }

        let now = self.clock.now();
        let mut message = Message::user(conversation_id, content, now);
        self.store.save_message(&message).await?;
        self.append(&mut state, &mut message, now).await?;
        self.store.touch_conversation(&conversation_id, now).await?;

        debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            "message buffered"
        );

        if self.should_close(&state, now).await? {
            self.close_locked(&mut state, "threshold").await?;
        }

        Ok(message)
    }

    /// Close and dispatch the open batch of a conversation, if it has members.
    ///
    /// Falls back to the current conversation when none is named. Closes
    /// regardless of thresholds or active settings.
    pub async fn force_process(
        &self,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<Task>, PipelineError> {
        let conversation_id = match conversation_id {
            Some(id) => id,
            None => match self.current_conversation().await {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let Some(session) = self.sessions.get(&conversation_id).map(|s| Arc::clone(s.value()))
        else {
            return Ok(None);
        };
        let mut state = session.lock().await;
        self.close_locked(&mut state, "forced").await
    }

    /// Close every open batch whose window has elapsed.
    ///
    /// Like the inline time check, does nothing while no settings are active.
    pub async fn sweep_stale(&self) -> Result<Vec<Task>, PipelineError> {
        if self.settings.active_settings().await?.is_none() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = Vec::new();
        for session in sessions {
            let mut state = session.lock().await;
            let stale = state.open_task.is_some()
                && state
                    .window_start
                    .is_some_and(|start| now - start >= self.config.timeout);
            if !stale {
                continue;
            }
            match self.close_locked(&mut state, "stale").await {
                Ok(Some(task)) => closed.push(task),
                Ok(None) => {}
                Err(e) => warn!(
                    conversation_id = %state.conversation_id,
                    error = %e,
                    "failed to close stale batch"
                ),
            }
        }
        Ok(closed)
    }

    /// Flush any open batch, then mark the conversation archived.
    ///
    /// The session stays registered as an archived tombstone so that a
    /// concurrent `add_message` cannot recreate it.
    pub async fn archive_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Task>, PipelineError> {
        let conversation = self
            .store
            .get_conversation(&conversation_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("conversation", conversation_id))?;

        let session = self.session(conversation_id);
        let flushed = {
            let mut state = session.lock().await;
            let flushed = self.close_locked(&mut state, "archive").await?;
            if !conversation.is_archived() {
                self.store
                    .set_conversation_status(&conversation_id, ConversationStatus::Archived)
                    .await?;
            }
            state.archived = true;
            flushed
        };

        let mut current = self.current.lock().await;
        if *current == Some(conversation_id) {
            *current = None;
        }

        info!(conversation_id = %conversation_id, "conversation archived");
        Ok(flushed)
    }

    /// Batches currently collecting messages.
    pub async fn open_batches(&self) -> Vec<OpenBatch> {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut open = Vec::new();
        for session in sessions {
            let state = session.lock().await;
            if let Some(task) = &state.open_task {
                open.push(OpenBatch {
                    conversation_id: state.conversation_id,
                    task_id: task.id,
                    batch_id: task.batch_id.clone(),
                    message_count: task.message_count,
                    window_start: state.window_start,
                });
            }
        }
        open
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn resolve_conversation(&self, requested: Option<Uuid>) -> Result<Uuid, PipelineError> {
        if let Some(id) = requested {
            let conversation = self
                .store
                .get_conversation(&id)
                .await?
                .ok_or_else(|| PipelineError::not_found("conversation", id))?;
            if conversation.is_archived() {
                return Err(archived(id));
            }
            return Ok(id);
        }

        let mut current = self.current.lock().await;
        if let Some(id) = *current {
            if let Some(conversation) = self.store.get_conversation(&id).await? {
                if !conversation.is_archived() {
                    return Ok(id);
                }
            }
        }

        let conversation = Conversation::new(self.clock.now());
        self.store.create_conversation(&conversation).await?;
        info!(conversation_id = %conversation.id, "started conversation");
        *current = Some(conversation.id);
        Ok(conversation.id)
    }

    fn session(&self, conversation_id: Uuid) -> Arc<Mutex<AggregatorState>> {
        Arc::clone(
            self.sessions
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(AggregatorState::new(conversation_id))))
                .value(),
        )
    }

    /// Add `message` to the open batch, opening one if needed.
    async fn append(
        &self,
        state: &mut AggregatorState,
        message: &mut Message,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let mut task = match state.open_task.take() {
            Some(task) => task,
            None => {
                let task = Task::open(state.conversation_id, now);
                self.store.create_task(&task).await?;
                debug!(
                    conversation_id = %state.conversation_id,
                    task_id = %task.id,
                    batch_id = %task.batch_id,
                    "opened batch"
                );
                state.members.clear();
                state.window_start = Some(now);
                task
            }
        };

        let label = &self.config.ordinal_label;
        if let Err(e) = membership::attach(&mut task, &mut state.members, message, label) {
            state.open_task = Some(task);
            return Err(e.into());
        }

        if let Err(e) = self.store.attach_message(&task, message).await {
            state.members.pop();
            membership::recompute(&mut task, &state.members, label);
            message.task_id = None;
            state.open_task = Some(task);
            return Err(e.into());
        }

        state.open_task = Some(task);
        Ok(())
    }

    async fn should_close(
        &self,
        state: &AggregatorState,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let Some(task) = state.open_task.as_ref() else {
            return Ok(false);
        };
        if task.message_count == 0 {
            return Ok(false);
        }

        let Some(settings) = self.settings.active_settings().await? else {
            debug!(
                conversation_id = %state.conversation_id,
                "no active settings, batch stays open until forced"
            );
            return Ok(false);
        };

        let by_count = task.message_count >= settings.batch_threshold;
        let by_time = state
            .window_start
            .is_some_and(|start| now - start >= self.config.timeout);
        Ok(by_count || by_time)
    }

    /// Freeze and enqueue the open batch. Caller holds the session lock.
    ///
    /// The dispatch mark is persisted before the enqueue. If the enqueue
    /// fails the batch stays frozen in the store for crash recovery, and the
    /// session still moves on to a fresh batch.
    async fn close_locked(
        &self,
        state: &mut AggregatorState,
        reason: &'static str,
    ) -> Result<Option<Task>, PipelineError> {
        let Some(mut task) = state.open_task.take() else {
            return Ok(None);
        };
        if task.message_count == 0 {
            state.open_task = Some(task);
            return Ok(None);
        }

        let now = self.clock.now();
        if let Err(e) = self.store.mark_dispatched(&task.id, now).await {
            state.open_task = Some(task);
            return Err(e.into());
        }
        task.dispatched_at = Some(now);

        let mut messages = std::mem::take(&mut state.members);
        for message in &mut messages {
            message
                .metadata
                .insert(META_AGGREGATED.to_string(), serde_json::Value::Bool(true));
        }
        state.reset();

        let item = WorkItem::Batch(BatchWorkItem {
            task: task.clone(),
            messages,
            aggregated_content: task.aggregated_content.clone(),
            retry: None,
        });

        if let Err(e) = self.queue.enqueue(item) {
            error!(
                conversation_id = %task.conversation_id,
                task_id = %task.id,
                error = %e,
                "failed to enqueue batch, left for recovery"
            );
            return Err(e.into());
        }

        info!(
            conversation_id = %task.conversation_id,
            task_id = %task.id,
            batch_id = %task.batch_id,
            message_count = task.message_count,
            reason,
            "batch dispatched"
        );
        Ok(Some(task))
    }
}

fn archived(conversation_id: Uuid) -> PipelineError {
    PipelineError::Validation(format!("conversation {conversation_id} is archived"))
}
