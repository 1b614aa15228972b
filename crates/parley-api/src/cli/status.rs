//! Pipeline status dashboard command.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Display task counts, unretried failures and the active settings.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let snapshot = state.status_snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!("  {} Parley v{}", style("⚡").bold(), snapshot.version);
    println!();

    println!("  {}", style("── Tasks ──").dim());
    for (status, count) in &snapshot.tasks {
        let count = match status.as_str() {
            "completed" => style(count.to_string()).green(),
            "failed" | "timeout" if *count > 0 => style(count.to_string()).red(),
            "pending" | "processing" if *count > 0 => style(count.to_string()).yellow(),
            _ => style(count.to_string()).dim(),
        };
        println!("  {:<11} {}", format!("{status}:"), count);
    }
    println!();

    println!("  {}", style("── Failures ──").dim());
    let unretried = if snapshot.unretried_failures > 0 {
        style(snapshot.unretried_failures.to_string()).yellow()
    } else {
        style(snapshot.unretried_failures.to_string()).dim()
    };
    println!("  Awaiting retry: {unretried}");
    println!();

    println!("  {}", style("── Remote service ──").dim());
    match &snapshot.active_settings {
        Some(settings) => {
            println!(
                "  Active:    {} {}",
                style(&settings.name).cyan(),
                style(format!("({})", settings.base_url)).dim()
            );
            println!("  Threshold: {} messages", settings.batch_threshold);
        }
        None => println!("  Active:    {}", style("none").yellow()),
    }
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(&snapshot.data_dir).dim());
    println!("  Database: {}", style("SQLite (WAL mode)").dim());
    println!(
        "  Window:   {}s, label {}",
        state.config.aggregation_timeout_secs,
        style(&state.config.ordinal_label).dim()
    );
    println!();

    Ok(())
}
