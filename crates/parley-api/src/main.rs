//! Parley CLI and REST API entry point.
//!
//! Binary name: `parley`
//!
//! Parses CLI arguments, initializes the database and pipeline, then
//! dispatches to the appropriate command handler or starts the REST API
//! server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use parley_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "parley", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.log_json, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (state, receiver) = AppState::init().await?;

    match cli.command {
        Commands::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| state.config.bind_address.clone());
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            let workers = state.start_workers(receiver, true);
            let report = state.recover().await?;
            if report.requeued + report.orphaned + report.timed_out > 0 {
                println!(
                    "  {} Recovered {} batch(es), timed out {}",
                    console::style("↻").bold(),
                    report.requeued + report.orphaned,
                    report.timed_out
                );
            }

            println!(
                "  {} Parley API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await;

            // Let queued batches finish before exiting.
            workers.shutdown().await;
            served?;

            println!("\n  Server stopped.");
        }

        Commands::Send {
            messages,
            conversation,
        } => {
            cli::send::send(&state, receiver, messages, conversation, cli.json).await?;
        }

        Commands::Recover => {
            cli::send::recover(&state, receiver, cli.json).await?;
        }

        Commands::Retry {
            ids,
            task,
            whole_batch,
        } => {
            cli::retry::retry(&state, receiver, ids, task, whole_batch, cli.json).await?;
        }

        Commands::RetryTask { target } => {
            cli::retry::retry_task(&state, receiver, &target, cli.json).await?;
        }

        Commands::Failed { all, task, limit } => {
            cli::retry::list_failed(&state, all, task, limit, cli.json).await?;
        }

        Commands::Settings { action } => {
            cli::settings::run(&state, action, cli.json).await?;
        }

        Commands::Ask {
            query,
            remote_conversation,
        } => {
            cli::ask::ask(&state, query, remote_conversation, cli.json).await?;
        }

        Commands::Status => {
            cli::status::status(&state, cli.json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled in main"),
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
