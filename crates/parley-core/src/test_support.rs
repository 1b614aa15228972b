//! In-memory port implementations shared by the unit tests in this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_types::conversation::{Conversation, ConversationStatus};
use parley_types::error::RepositoryError;
use parley_types::failure::{FailedMessage, RetryClaim, RetryHistoryEntry, RetryOutcome};
use parley_types::message::{META_AGGREGATED, Message, MessageStatus};
use parley_types::remote::{RemoteChatReply, RemoteChatRequest, RemoteError};
use parley_types::settings::ServiceSettings;
use parley_types::task::{Task, TaskStatus};
use parley_types::work::{RetryLink, WorkItem};
use secrecy::SecretString;
use uuid::Uuid;

use crate::backend::ChatBackend;
use crate::dispatch::{DispatchError, DispatchQueue};
use crate::repository::{
    BatchFailure, BatchStore, BatchSuccess, FailureFilter, FailureStore, SettingsRepository,
};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    tasks: HashMap<Uuid, Task>,
    failures: HashMap<Uuid, FailedMessage>,
    settings: Vec<ServiceSettings>,
}

/// One in-memory store implementing every repository port.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// When set, outcome writes fail with a query error.
    pub fail_outcomes: AtomicBool,
}

impl MemoryStore {
    fn with<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn message(&self, id: &Uuid) -> Message {
        self.with(|s| s.messages[id].clone())
    }

    pub fn task(&self, id: &Uuid) -> Task {
        self.with(|s| s.tasks[id].clone())
    }

    pub fn conversation(&self, id: &Uuid) -> Conversation {
        self.with(|s| s.conversations[id].clone())
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.with(|s| {
            let mut tasks: Vec<Task> = s.tasks.values().cloned().collect();
            tasks.sort_by_key(|t| t.id);
            tasks
        })
    }

    pub fn failures(&self) -> Vec<FailedMessage> {
        self.with(|s| {
            let mut failures: Vec<FailedMessage> = s.failures.values().cloned().collect();
            failures.sort_by_key(|f| f.id);
            failures
        })
    }

    pub fn assistant_replies(&self) -> Vec<Message> {
        self.with(|s| {
            let mut replies: Vec<Message> = s
                .messages
                .values()
                .filter(|m| m.status == MessageStatus::Received)
                .cloned()
                .collect();
            replies.sort_by_key(|m| m.id);
            replies
        })
    }

    pub fn insert_failure(&self, failure: FailedMessage) {
        self.with(|s| s.failures.insert(failure.id, failure));
    }

    fn check_outcome(&self) -> Result<(), RepositoryError> {
        if self.fail_outcomes.load(Ordering::SeqCst) {
            Err(RepositoryError::Query("disk I/O error".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Check everything an outcome write requires before anything is changed.
fn check_outcome_preconditions(
    state: &MemoryState,
    task_id: &Uuid,
    retry: Option<&RetryLink>,
) -> Result<(), RepositoryError> {
    let task = state.tasks.get(task_id).ok_or(RepositoryError::NotFound)?;
    if task.status != TaskStatus::Processing {
        return Err(RepositoryError::Conflict(format!(
            "task {task_id} is {}, not processing",
            task.status
        )));
    }
    if let Some(link) = retry {
        for id in &link.failed_message_ids {
            let held = state.failures.get(id).is_some_and(|f| {
                !f.retried && f.claim.is_some_and(|c| c.token == link.claim_token)
            });
            if !held {
                return Err(RepositoryError::Conflict(format!(
                    "retry claim on failed message {id} was lost"
                )));
            }
        }
    }
    Ok(())
}

fn close_failures(
    state: &mut MemoryState,
    member_ids: &[Uuid],
    entry: &RetryHistoryEntry,
    retry: Option<&RetryLink>,
    now: DateTime<Utc>,
) {
    let token = retry.map(|link| link.claim_token);
    for failure in state.failures.values_mut() {
        let claimable = match failure.claim {
            None => true,
            Some(claim) => Some(claim.token) == token || !claim.is_live(now),
        };
        if !failure.retried && claimable && member_ids.contains(&failure.message_id) {
            failure.retried = true;
            failure.claim = None;
            failure.retry_history.push(entry.clone());
        }
    }
}

impl BatchStore for MemoryStore {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), RepositoryError> {
        self.with(|s| s.conversations.insert(conversation.id, conversation.clone()));
        Ok(())
    }

    async fn get_conversation(&self, id: &Uuid) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.with(|s| s.conversations.get(id).cloned()))
    }

    async fn touch_conversation(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with(|s| match s.conversations.get_mut(id) {
            Some(c) => {
                c.last_active_at = at;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    async fn set_conversation_status(
        &self,
        id: &Uuid,
        status: ConversationStatus,
    ) -> Result<(), RepositoryError> {
        self.with(|s| match s.conversations.get_mut(id) {
            Some(c) => {
                c.status = status;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    async fn save_message(&self, message: &Message) -> Result<(), RepositoryError> {
        self.with(|s| s.messages.insert(message.id, message.clone()));
        Ok(())
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<Message>, RepositoryError> {
        Ok(self.with(|s| s.messages.get(id).cloned()))
    }

    async fn get_messages(&self, ids: &[Uuid]) -> Result<Vec<Message>, RepositoryError> {
        Ok(self.with(|s| ids.iter().filter_map(|id| s.messages.get(id).cloned()).collect()))
    }

    async fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, RepositoryError> {
        Ok(self.with(|s| {
            let mut messages: Vec<Message> = s
                .messages
                .values()
                .filter(|m| &m.conversation_id == conversation_id)
                .cloned()
                .collect();
            messages.sort_by_key(|m| (m.created_at, m.id));
            if let Some(limit) = limit {
                messages.truncate(limit as usize);
            }
            messages
        }))
    }

    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        self.with(|s| s.tasks.insert(task.id, task.clone()));
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.with(|s| s.tasks.get(id).cloned()))
    }

    async fn get_task_by_batch_id(&self, batch_id: &str) -> Result<Option<Task>, RepositoryError> {
        Ok(self.with(|s| s.tasks.values().find(|t| t.batch_id == batch_id).cloned()))
    }

    async fn attach_message(&self, task: &Task, message: &Message) -> Result<(), RepositoryError> {
        self.with(|s| {
            let stored = s.tasks.get_mut(&task.id).ok_or(RepositoryError::NotFound)?;
            stored.message_ids = task.message_ids.clone();
            stored.message_count = task.message_count;
            stored.aggregated_content = task.aggregated_content.clone();
            let msg = s
                .messages
                .get_mut(&message.id)
                .ok_or(RepositoryError::NotFound)?;
            msg.task_id = message.task_id;
            msg.status = message.status;
            Ok(())
        })
    }

    async fn mark_dispatched(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with(|s| {
            let task = s.tasks.get_mut(task_id).ok_or(RepositoryError::NotFound)?;
            task.dispatched_at = Some(at);
            let ids = task.message_ids.clone();
            for id in ids {
                if let Some(m) = s.messages.get_mut(&id) {
                    m.metadata
                        .insert(META_AGGREGATED.to_string(), serde_json::Value::Bool(true));
                }
            }
            Ok(())
        })
    }

    async fn mark_processing(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.with(|s| {
            let task = s.tasks.get_mut(task_id).ok_or(RepositoryError::NotFound)?;
            if task.status != TaskStatus::Pending {
                return Ok(false);
            }
            task.status = TaskStatus::Processing;
            task.processed_at = Some(at);
            Ok(true)
        })
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, RepositoryError> {
        Ok(self.with(|s| {
            let mut tasks: Vec<Task> =
                s.tasks.values().filter(|t| t.status == status).cloned().collect();
            tasks.sort_by_key(|t| (t.created_at, t.id));
            tasks
        }))
    }

    async fn count_tasks_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, RepositoryError> {
        Ok(self.with(|s| {
            let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
            for task in s.tasks.values() {
                *counts.entry(task.status).or_default() += 1;
            }
            counts.into_iter().collect()
        }))
    }

    async fn record_batch_success(&self, outcome: &BatchSuccess) -> Result<(), RepositoryError> {
        self.check_outcome()?;
        self.with(|s| {
            check_outcome_preconditions(s, &outcome.task_id, outcome.retry.as_ref())?;
            for id in &outcome.member_ids {
                if let Some(m) = s.messages.get_mut(id) {
                    m.status = MessageStatus::Sent;
                    m.sent_at = Some(outcome.completed_at);
                    m.error = None;
                }
            }
            s.messages.insert(outcome.reply.id, outcome.reply.clone());
            if let Some(remote_id) = &outcome.remote_conversation_id {
                if let Some(c) = s.conversations.get_mut(&outcome.conversation_id) {
                    if c.remote_id.is_none() {
                        c.remote_id = Some(remote_id.clone());
                    }
                }
            }
            let entry = RetryHistoryEntry {
                timestamp: outcome.completed_at,
                outcome: RetryOutcome::Succeeded,
                retry_task_id: outcome.task_id,
                error: None,
                context: retry_context(outcome.retry.as_ref()),
            };
            close_failures(
                s,
                &outcome.member_ids,
                &entry,
                outcome.retry.as_ref(),
                outcome.completed_at,
            );
            let task = s
                .tasks
                .get_mut(&outcome.task_id)
                .ok_or(RepositoryError::NotFound)?;
            task.status = TaskStatus::Completed;
            task.response = Some(outcome.response.clone());
            task.completed_at = Some(outcome.completed_at);
            Ok(())
        })
    }

    async fn record_batch_failure(&self, outcome: &BatchFailure) -> Result<(), RepositoryError> {
        self.check_outcome()?;
        self.with(|s| {
            check_outcome_preconditions(s, &outcome.task_id, outcome.retry.as_ref())?;
            for id in &outcome.member_ids {
                if let Some(m) = s.messages.get_mut(id) {
                    m.status = MessageStatus::Failed;
                    m.error = Some(outcome.error.clone());
                    m.retry_count += 1;
                }
            }
            let entry = RetryHistoryEntry {
                timestamp: outcome.failed_at,
                outcome: RetryOutcome::Failed,
                retry_task_id: outcome.task_id,
                error: Some(outcome.error.clone()),
                context: retry_context(outcome.retry.as_ref()),
            };
            close_failures(
                s,
                &outcome.member_ids,
                &entry,
                outcome.retry.as_ref(),
                outcome.failed_at,
            );
            for failure in &outcome.failures {
                s.failures.insert(failure.id, failure.clone());
            }
            let task = s
                .tasks
                .get_mut(&outcome.task_id)
                .ok_or(RepositoryError::NotFound)?;
            task.status = outcome.status;
            task.error = Some(outcome.error.clone());
            task.completed_at = Some(outcome.failed_at);
            Ok(())
        })
    }

    async fn abandon_task(
        &self,
        task_id: &Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with(|s| {
            let task = s.tasks.get_mut(task_id).ok_or(RepositoryError::NotFound)?;
            if task.status == TaskStatus::Processing {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.completed_at = Some(at);
            }
            Ok(())
        })
    }
}

fn retry_context(retry: Option<&RetryLink>) -> serde_json::Value {
    retry.map(|link| link.context.clone()).unwrap_or_default()
}

impl FailureStore for MemoryStore {
    async fn get_failed(&self, id: &Uuid) -> Result<Option<FailedMessage>, RepositoryError> {
        Ok(self.with(|s| s.failures.get(id).cloned()))
    }

    async fn list_failed(
        &self,
        filter: &FailureFilter,
    ) -> Result<Vec<FailedMessage>, RepositoryError> {
        Ok(self.with(|s| {
            let mut failures: Vec<FailedMessage> = s
                .failures
                .values()
                .filter(|f| filter.retried.is_none_or(|r| f.retried == r))
                .filter(|f| filter.task_id.is_none_or(|t| f.task_id == Some(t)))
                .cloned()
                .collect();
            failures.sort_by(|a, b| b.id.cmp(&a.id));
            if let Some(limit) = filter.limit {
                failures.truncate(limit as usize);
            }
            failures
        }))
    }

    async fn list_unretried_for_task(
        &self,
        task_id: &Uuid,
    ) -> Result<Vec<FailedMessage>, RepositoryError> {
        Ok(self.with(|s| {
            let mut failures: Vec<FailedMessage> = s
                .failures
                .values()
                .filter(|f| !f.retried && f.task_id == Some(*task_id))
                .cloned()
                .collect();
            failures.sort_by_key(|f| f.id);
            failures
        }))
    }

    async fn try_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self.with(|s| match s.failures.get_mut(id) {
            Some(f) if !f.retried => {
                let free = match f.claim {
                    None => true,
                    Some(claim) => claim.token == *token || !claim.is_live(now),
                };
                if free {
                    f.claim = Some(RetryClaim {
                        token: *token,
                        expires_at,
                    });
                }
                free
            }
            _ => false,
        }))
    }

    async fn renew_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self.with(|s| match s.failures.get_mut(id) {
            Some(f) if !f.retried && f.claim.is_some_and(|c| c.token == *token) => {
                f.claim = Some(RetryClaim {
                    token: *token,
                    expires_at,
                });
                true
            }
            _ => false,
        }))
    }

    async fn release_claim(&self, id: &Uuid, token: &Uuid) -> Result<(), RepositoryError> {
        self.with(|s| {
            if let Some(f) = s.failures.get_mut(id) {
                if f.claim.map(|c| c.token == *token).unwrap_or(false) {
                    f.claim = None;
                }
            }
        });
        Ok(())
    }

    async fn count_unretried(&self) -> Result<u64, RepositoryError> {
        Ok(self.with(|s| s.failures.values().filter(|f| !f.retried).count() as u64))
    }
}

impl SettingsRepository for MemoryStore {
    async fn create_settings(&self, settings: &ServiceSettings) -> Result<(), RepositoryError> {
        self.with(|s| s.settings.push(settings.clone()));
        Ok(())
    }

    async fn get_settings(&self, id: &Uuid) -> Result<Option<ServiceSettings>, RepositoryError> {
        Ok(self.with(|s| s.settings.iter().find(|x| &x.id == id).cloned()))
    }

    async fn list_settings(&self) -> Result<Vec<ServiceSettings>, RepositoryError> {
        Ok(self.with(|s| s.settings.clone()))
    }

    async fn active_settings(&self) -> Result<Option<ServiceSettings>, RepositoryError> {
        Ok(self.with(|s| s.settings.iter().find(|x| x.is_active).cloned()))
    }

    async fn activate_settings(&self, id: &Uuid) -> Result<(), RepositoryError> {
        self.with(|s| {
            if !s.settings.iter().any(|x| &x.id == id) {
                return Err(RepositoryError::NotFound);
            }
            for x in s.settings.iter_mut() {
                x.is_active = &x.id == id;
            }
            Ok(())
        })
    }
}

/// Build active settings with the given batch threshold.
pub fn active_settings(threshold: u32) -> ServiceSettings {
    let mut settings = ServiceSettings::new(
        "test",
        "http://remote.invalid",
        SecretString::from("sk-test-not-real"),
        "tester",
        Utc::now(),
    );
    settings.batch_threshold = threshold;
    settings.request_timeout_secs = 5;
    settings.is_active = true;
    settings
}

/// Scripted remote backend.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<Result<RemoteChatReply, RemoteError>>>,
    pub requests: Mutex<Vec<RemoteChatRequest>>,
    pub delay: Option<Duration>,
}

impl MockBackend {
    pub fn push_reply(&self, reply: Result<RemoteChatReply, RemoteError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn answer(text: &str) -> Result<RemoteChatReply, RemoteError> {
        Ok(RemoteChatReply {
            answer: text.to_string(),
            conversation_id: Some("remote-conv-1".to_string()),
            message_id: Some("remote-msg-1".to_string()),
        })
    }

    pub fn server_error() -> Result<RemoteChatReply, RemoteError> {
        Err(RemoteError::Server {
            status: 500,
            body: "internal error".to_string(),
        })
    }

    /// A backend that holds every call for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        _settings: &ServiceSettings,
        request: &RemoteChatRequest,
    ) -> Result<RemoteChatReply, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| MockBackend::answer("ok"))
    }
}

/// Queue that records work items instead of running them.
#[derive(Default)]
pub struct RecordingQueue {
    items: Mutex<Vec<WorkItem>>,
    pub reject: AtomicBool,
}

impl RecordingQueue {
    pub fn take(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

impl DispatchQueue for RecordingQueue {
    fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(DispatchError::QueueFull);
        }
        self.items.lock().unwrap().push(item);
        Ok(())
    }
}
