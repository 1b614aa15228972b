//! Message intake from the command line, and startup recovery.

use anyhow::Result;
use console::style;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_core::repository::BatchStore;
use parley_types::task::{Task, TaskStatus};
use parley_types::work::WorkItem;

use crate::state::AppState;

/// Buffer `messages` into one conversation, flush what is left open, and
/// report every batch once the workers have drained.
pub async fn send(
    state: &AppState,
    receiver: mpsc::Receiver<WorkItem>,
    messages: Vec<String>,
    conversation: Option<Uuid>,
    json: bool,
) -> Result<()> {
    let workers = state.start_workers(receiver, false);
    let buffered = buffer(state, &messages, conversation).await;
    workers.shutdown().await;
    let (conversation_id, task_ids) = buffered?;

    let mut tasks = Vec::with_capacity(task_ids.len());
    for id in &task_ids {
        if let Some(task) = state.batches.get_task(id).await? {
            tasks.push(task);
        }
    }

    if json {
        let out = serde_json::json!({
            "conversation_id": conversation_id,
            "tasks": tasks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Conversation {}",
        style(conversation_id).cyan()
    );
    println!();
    for task in &tasks {
        print_task(task);
    }
    Ok(())
}

/// Returns the conversation used and the distinct batches touched, in order.
async fn buffer(
    state: &AppState,
    messages: &[String],
    conversation: Option<Uuid>,
) -> Result<(Uuid, Vec<Uuid>)> {
    let mut conversation = conversation;
    let mut task_ids: Vec<Uuid> = Vec::new();
    let mut remember = |id: Option<Uuid>| {
        if let Some(id) = id {
            if !task_ids.contains(&id) {
                task_ids.push(id);
            }
        }
    };

    for content in messages {
        let message = state.aggregator.add_message(content, conversation).await?;
        conversation = Some(message.conversation_id);
        remember(message.task_id);
    }

    let flushed = state.aggregator.force_process(conversation).await?;
    remember(flushed.map(|t| t.id));

    let conversation_id =
        conversation.ok_or_else(|| anyhow::anyhow!("no messages were buffered"))?;
    Ok((conversation_id, task_ids))
}

fn print_task(task: &Task) {
    let marker = match task.status {
        TaskStatus::Completed => style("✓").green(),
        TaskStatus::Pending | TaskStatus::Processing => style("…").yellow(),
        TaskStatus::Failed | TaskStatus::Timeout => style("✗").red(),
    };
    println!(
        "  {} {}  {}  {}",
        marker,
        style(&task.batch_id).bold(),
        task.status,
        style(format!("({} messages)", task.message_count)).dim()
    );
    if let Some(response) = &task.response {
        for line in response.lines() {
            println!("    {line}");
        }
    }
    if let Some(error) = &task.error {
        println!("    {}", style(error).red());
    }
    println!();
}

/// Run crash recovery and wait for the re-enqueued batches.
pub async fn recover(
    state: &AppState,
    receiver: mpsc::Receiver<WorkItem>,
    json: bool,
) -> Result<()> {
    let workers = state.start_workers(receiver, false);
    let report = state.recover().await;
    workers.shutdown().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("── Recovery ──").dim());
    println!("  Re-enqueued: {}", style(report.requeued).bold());
    println!("  Orphaned:    {}", style(report.orphaned).bold());
    println!("  Timed out:   {}", style(report.timed_out).yellow());
    println!();
    Ok(())
}
