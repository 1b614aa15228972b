//! Batch membership helpers.
//!
//! A task's member list, count and aggregated content, and each member's
//! back-reference, are always changed together through these functions.
//! A message belongs to at most one non-terminal task at a time.

use parley_types::error::PipelineError;
use parley_types::message::Message;
use parley_types::task::Task;
use thiserror::Error;
use uuid::Uuid;

use super::content::{OrdinalLabel, aggregate_content};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("task {0} has been dispatched and cannot accept members")]
    TaskFrozen(Uuid),

    #[error("message {message} already belongs to task {task}")]
    AlreadyMember { message: Uuid, task: Uuid },

    #[error("message {message} is from conversation {actual}, task expects {expected}")]
    ConversationMismatch {
        message: Uuid,
        expected: Uuid,
        actual: Uuid,
    },

    #[error("task {task} is inconsistent: {reason}")]
    Inconsistent { task: Uuid, reason: String },
}

impl From<MembershipError> for PipelineError {
    fn from(err: MembershipError) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

/// Append an unassigned message to an open task.
pub fn attach(
    task: &mut Task,
    members: &mut Vec<Message>,
    message: &mut Message,
    label: &OrdinalLabel,
) -> Result<(), MembershipError> {
    if let Some(existing) = message.task_id {
        return Err(MembershipError::AlreadyMember {
            message: message.id,
            task: existing,
        });
    }
    adopt(task, members, message, label)
}

/// Append a message to an open task, moving its back-reference away from
/// whatever terminal task it previously belonged to.
///
/// Used when building retry batches. The previous task keeps its historical
/// member list.
pub fn adopt(
    task: &mut Task,
    members: &mut Vec<Message>,
    message: &mut Message,
    label: &OrdinalLabel,
) -> Result<(), MembershipError> {
    if !task.is_open() {
        return Err(MembershipError::TaskFrozen(task.id));
    }
    if message.conversation_id != task.conversation_id {
        return Err(MembershipError::ConversationMismatch {
            message: message.id,
            expected: task.conversation_id,
            actual: message.conversation_id,
        });
    }
    if members.iter().any(|m| m.id == message.id) {
        return Err(MembershipError::AlreadyMember {
            message: message.id,
            task: task.id,
        });
    }

    message.task_id = Some(task.id);
    members.push(message.clone());
    recompute(task, members, label);
    Ok(())
}

/// Rebuild the task's derived fields from its ordered members.
pub fn recompute(task: &mut Task, members: &[Message], label: &OrdinalLabel) {
    task.message_ids = members.iter().map(|m| m.id).collect();
    task.message_count = members.len() as u32;
    let contents: Vec<&str> = members.iter().map(|m| m.content.as_str()).collect();
    task.aggregated_content = aggregate_content(&contents, label);
}

/// Check that a task agrees with its members.
pub fn assert_consistent(
    task: &Task,
    members: &[Message],
    label: &OrdinalLabel,
) -> Result<(), MembershipError> {
    let inconsistent = |reason: String| MembershipError::Inconsistent {
        task: task.id,
        reason,
    };

    if task.message_count as usize != task.message_ids.len() {
        return Err(inconsistent(format!(
            "message_count {} but {} member ids",
            task.message_count,
            task.message_ids.len()
        )));
    }

    let ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
    if ids != task.message_ids {
        return Err(inconsistent("member ids differ from task order".to_string()));
    }

    let contents: Vec<&str> = members.iter().map(|m| m.content.as_str()).collect();
    if aggregate_content(&contents, label) != task.aggregated_content {
        return Err(inconsistent("aggregated content is stale".to_string()));
    }

    if !task.is_terminal() {
        if let Some(stray) = members.iter().find(|m| m.task_id != Some(task.id)) {
            return Err(inconsistent(format!(
                "member {} does not point back at the task",
                stray.id
            )));
        }
    }

    Ok(())
}
