//! Failure listing and retry commands.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_core::repository::{FailureFilter, FailureStore};
use parley_types::failure::{FailedMessage, RetryOutcome};
use parley_types::work::WorkItem;

use super::preview;
use crate::state::AppState;

fn cli_context() -> serde_json::Value {
    serde_json::json!({ "source": "cli" })
}

/// Retry failure records by id and wait for the outcome.
pub async fn retry(
    state: &AppState,
    receiver: mpsc::Receiver<WorkItem>,
    ids: Vec<Uuid>,
    task: Option<Uuid>,
    whole_batch: bool,
    json: bool,
) -> Result<()> {
    let workers = state.start_workers(receiver, false);

    let queued = if let [id] = ids.as_slice() {
        state
            .retries
            .retry(*id, task, cli_context(), whole_batch)
            .await
            .map(|receipt| serde_json::to_value(receipt).unwrap_or_default())
    } else {
        let report = state.retries.retry_many(&ids, cli_context()).await;
        Ok(serde_json::to_value(report).unwrap_or_default())
    };

    workers.shutdown().await;
    let queued = queued?;
    let records = reload(state, &ids).await?;

    if json {
        let out = serde_json::json!({ "queued": queued, "records": records });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for record in &records {
        print_outcome(record);
    }
    println!();
    Ok(())
}

/// Retry every unretried failure of a task given by id or batch id.
pub async fn retry_task(
    state: &AppState,
    receiver: mpsc::Receiver<WorkItem>,
    target: &str,
    json: bool,
) -> Result<()> {
    let workers = state.start_workers(receiver, false);
    let report = match target.parse::<Uuid>() {
        Ok(task_id) => state.retries.retry_by_task_id(task_id, cli_context()).await,
        Err(_) => {
            state
                .retries
                .retry_by_request_task_id(target, cli_context())
                .await
        }
    };
    workers.shutdown().await;
    let report = report?;
    let records = reload(state, &report.failed_message_ids).await?;

    if json {
        let out = serde_json::json!({ "report": report, "records": records });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if report.success {
        println!("  {} {}", style("↻").cyan(), report.message);
    } else {
        println!("  {} {}", style("!").yellow(), report.message);
    }
    for record in &records {
        print_outcome(record);
    }
    println!();
    Ok(())
}

async fn reload(state: &AppState, ids: &[Uuid]) -> Result<Vec<FailedMessage>> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = state.failures.get_failed(id).await? {
            records.push(record);
        }
    }
    Ok(records)
}

fn print_outcome(record: &FailedMessage) {
    match record.retry_history.last() {
        Some(entry) if record.retried && entry.outcome == RetryOutcome::Succeeded => println!(
            "  {} {} delivered by task {}",
            style("✓").green(),
            record.id,
            entry.retry_task_id
        ),
        Some(entry) if record.retried => println!(
            "  {} {} retried by task {}, failed again: {}",
            style("✗").red(),
            record.id,
            entry.retry_task_id,
            entry.error.as_deref().unwrap_or("unknown error")
        ),
        _ if record.retried => println!("  {} {} closed", style("✓").green(), record.id),
        _ => println!(
            "  {} {} still open: {}",
            style("!").yellow(),
            record.id,
            record.error
        ),
    }
}

/// List failure records in a table.
pub async fn list_failed(
    state: &AppState,
    all: bool,
    task: Option<Uuid>,
    limit: i64,
    json: bool,
) -> Result<()> {
    if limit <= 0 {
        anyhow::bail!("--limit must be positive");
    }
    let records = state
        .failures
        .list_failed(&FailureFilter {
            retried: if all { None } else { Some(false) },
            task_id: task,
            limit: Some(limit),
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  {}", style("No failed messages.").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::White),
            Cell::new("Task").fg(Color::White),
            Cell::new("Error").fg(Color::White),
            Cell::new("Attempts").fg(Color::White),
            Cell::new("Failed").fg(Color::White),
            Cell::new("Retried").fg(Color::White),
            Cell::new("Content").fg(Color::White),
        ]);

    for record in &records {
        let retried = if record.retried {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(record.task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into())),
            Cell::new(preview(&record.error, 40)).fg(Color::Red),
            Cell::new(record.attempts),
            Cell::new(record.failed_at.format("%Y-%m-%d %H:%M:%S")),
            retried,
            Cell::new(preview(&record.context.content, 30)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
