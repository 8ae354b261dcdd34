#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # carwatch-live
//!
//! Command-line front end for the live progress client. Every command prints
//! JSON lines on stdout; logs go to stderr.
//!
//! ## Subcommands
//!
//! - `carwatch-live queue` — stream queue snapshots, polling over HTTP while
//!   the socket is down
//! - `carwatch-live watch <task-id>...` — stream progress events for the given
//!   tasks until each one finishes or fails
//! - `carwatch-live monitor [--user <id>]` — track a user's request list with
//!   live progress merged in
//!
//! All commands stop cleanly on `Ctrl-C` or SIGTERM.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use carwatch_live::{
    ApiClient, Backend, Config, Coordinator, QueueStatusChannel, TaskProgress,
    TaskProgressChannel,
};

/// Live task-progress and queue-status client.
#[derive(Parser)]
#[command(name = "carwatch-live", version)]
struct Cli {
    /// Path to TOML config file (default `carwatch.toml` in CWD, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every queue snapshot as a JSON line.
    Queue,
    /// Print progress events for the given tasks until all are terminal.
    Watch {
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
    /// Track a user's requests and print the list on every change.
    Monitor {
        /// User id (overrides `api.user_id` / `CARWATCH_USER_ID`).
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("carwatch-live: configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("carwatch-live v{} starting", env!("CARGO_PKG_VERSION"));
    info!("API base URL: {}", config.api.base_url);

    let result = match cli.command {
        Commands::Queue => run_queue(&config).await,
        Commands::Watch { task_ids } => run_watch(&config, task_ids).await,
        Commands::Monitor { user } => run_monitor(config, user).await,
    };
    if let Err(e) = result {
        eprintln!("carwatch-live: {e}");
        std::process::exit(1);
    }
}

fn backend(config: &Config) -> Result<Arc<dyn Backend>, String> {
    let client = ApiClient::new(&config.api.base_url, config.api.token.clone())
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(client))
}

fn print_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("failed to encode output: {e}"),
    }
}

async fn run_queue(config: &Config) -> Result<(), String> {
    let mut settings = config.coordinator_settings();
    settings.user_id = None;
    let coordinator = Coordinator::new(
        settings,
        backend(config)?,
        QueueStatusChannel::new(config.queue_options()),
        TaskProgressChannel::new(config.progress_limits(), config.progress_options()),
    );
    coordinator.subscribe_queue(|snapshot| print_line(snapshot));

    coordinator.start().await;
    shutdown_signal().await;
    coordinator.shutdown();
    Ok(())
}

async fn run_watch(config: &Config, task_ids: Vec<String>) -> Result<(), String> {
    let channel = TaskProgressChannel::new(config.progress_limits(), config.progress_options());
    let (tx, mut rx) = mpsc::unbounded_channel::<TaskProgress>();
    channel.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    channel.subscribe_status(|key, status| {
        if let Some(error) = &status.error {
            warn!("task {}: {error}", key.task_id);
        }
    });

    let mut remaining: HashSet<String> = HashSet::new();
    for task_id in task_ids {
        if channel.connect(&config.api.base_url, &task_id).await {
            remaining.insert(task_id);
        } else {
            warn!("task {task_id}: not subscribed (limit reached or backend unreachable)");
            if channel.is_active(&task_id) {
                remaining.insert(task_id);
            }
        }
    }
    if remaining.is_empty() {
        return Err("no task could be subscribed".into());
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                print_line(&event);
                if event.is_terminal() {
                    channel.disconnect_task(&event.task_id);
                    remaining.remove(&event.task_id);
                    if remaining.is_empty() {
                        info!("all watched tasks finished");
                        break;
                    }
                }
            }
            () = &mut shutdown => break,
        }
    }
    channel.disconnect_all();
    Ok(())
}

async fn run_monitor(mut config: Config, user: Option<String>) -> Result<(), String> {
    if user.is_some() {
        config.api.user_id = user;
    }
    if config.api.user_id.is_none() {
        return Err("monitor needs a user id (--user, api.user_id or CARWATCH_USER_ID)".into());
    }

    let coordinator = Coordinator::from_config(&config, backend(&config)?);
    coordinator.subscribe_requests(|records| print_line(&json!({ "requests": records })));
    coordinator.subscribe_queue(|snapshot| print_line(&json!({ "queue": snapshot })));

    coordinator.start().await;
    shutdown_signal().await;
    coordinator.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
