//! Remote service settings commands.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use parley_core::repository::SettingsRepository;
use parley_types::settings::ServiceSettingsSummary;

use super::SettingsCommand;
use crate::state::{AppState, NewSettings};

pub async fn run(state: &AppState, action: SettingsCommand, json: bool) -> Result<()> {
    match action {
        SettingsCommand::Add {
            name,
            base_url,
            api_key,
            user,
            threshold,
            timeout,
            activate,
        } => {
            let summary = state
                .create_settings(NewSettings {
                    name,
                    base_url,
                    api_key,
                    user_id: user,
                    batch_threshold: threshold,
                    request_timeout_secs: timeout,
                    activate,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!();
                println!(
                    "  {} Settings '{}' saved ({})",
                    style("✓").green().bold(),
                    style(&summary.name).cyan(),
                    summary.id
                );
                if !summary.is_active {
                    println!(
                        "  {}",
                        style(format!("Activate with: parley settings activate {}", summary.id))
                            .dim()
                    );
                }
                println!();
            }
        }

        SettingsCommand::Activate { id } => {
            let summary = state.activate_settings(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!();
                println!(
                    "  {} '{}' is now active",
                    style("✓").green().bold(),
                    style(&summary.name).cyan()
                );
                println!();
            }
        }

        SettingsCommand::List => {
            let all: Vec<ServiceSettingsSummary> = state
                .settings
                .list_settings()
                .await?
                .iter()
                .map(|s| s.summary())
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&all)?);
            } else if all.is_empty() {
                println!();
                println!(
                    "  {}",
                    style("No settings yet. Add one with: parley settings add").dim()
                );
                println!();
            } else {
                print_table(&all);
            }
        }

        SettingsCommand::Show => {
            let active = state.active_settings().await?.map(|s| s.summary());
            if json {
                println!("{}", serde_json::to_string_pretty(&active)?);
                return Ok(());
            }
            println!();
            match active {
                Some(summary) => print_summary(&summary),
                None => println!(
                    "  {} No active settings; batches only close when flushed",
                    style("!").yellow()
                ),
            }
            println!();
        }
    }
    Ok(())
}

fn print_table(all: &[ServiceSettingsSummary]) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("").fg(Color::White),
            Cell::new("ID").fg(Color::White),
            Cell::new("Name").fg(Color::White),
            Cell::new("Base URL").fg(Color::White),
            Cell::new("Key").fg(Color::White),
            Cell::new("Threshold").fg(Color::White),
            Cell::new("Timeout").fg(Color::White),
        ]);

    for s in all {
        let marker = if s.is_active {
            Cell::new("●").fg(Color::Green)
        } else {
            Cell::new("")
        };
        table.add_row(vec![
            marker,
            Cell::new(s.id),
            Cell::new(&s.name),
            Cell::new(&s.base_url),
            Cell::new(&s.key_hint),
            Cell::new(s.batch_threshold),
            Cell::new(format!("{}s", s.request_timeout_secs)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

fn print_summary(summary: &ServiceSettingsSummary) {
    println!("  {}", style("── Active settings ──").dim());
    println!("  Name:      {}", style(&summary.name).cyan());
    println!("  ID:        {}", summary.id);
    println!("  Base URL:  {}", summary.base_url);
    println!("  API key:   {}", style(&summary.key_hint).dim());
    println!("  User:      {}", summary.user_id);
    println!("  Threshold: {} messages", summary.batch_threshold);
    println!("  Timeout:   {}s", summary.request_timeout_secs);
}
