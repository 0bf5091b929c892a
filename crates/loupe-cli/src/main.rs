use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use loupe_core::config::LoupeConfig;
use loupe_core::prompt::{PromptContext, build_prompt, truncate};
use loupe_core::task::{
    Category, ElementInfo, NewTask, PageInfo, Priority, Task, TaskId, TaskKind, TaskStatus,
    TaskUpdate,
};
use loupe_core::telemetry::{TelemetryConfig, init_telemetry};
use loupe_runner::claude::ClaudeCli;
use loupe_runner::http::{HttpEvents, HttpQueue};
use loupe_runner::{Dispatcher, EventSource, LocalQueue, QueueClient};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Environment variable telling `loupe task update` which server to report to.
const SERVER_ENV: &str = "LOUPE_SERVER";

#[derive(Parser)]
#[command(
    name = "loupe",
    about = "Queue UI annotations and hand them to a coding agent one at a time"
)]
struct Cli {
    /// Path to loupe.toml.
    #[arg(long, default_value = "loupe.toml")]
    config: PathBuf,

    /// Data directory (overrides `storage.data_dir`).
    #[arg(long, env = "LOUPE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    /// Also write JSONL logs to this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server, with the dispatcher unless disabled.
    Serve {
        /// Bind address (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
        /// Serve the API only; run `loupe watch` elsewhere to dispatch.
        #[arg(long)]
        no_dispatch: bool,
    },
    /// Run the dispatcher against a remote `loupe serve`.
    Watch {
        /// Base URL of the server, e.g. http://127.0.0.1:3847.
        #[arg(long, env = SERVER_ENV)]
        server: String,
    },
    /// Manage tasks in the queue.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Show task counts per status.
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a task from a screenshot file.
    Add {
        #[arg(long)]
        note: String,
        /// PNG screenshot of the annotated state.
        #[arg(long)]
        screenshot: PathBuf,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "page")]
        kind: TaskKind,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long, default_value = "tweak")]
        category: Category,
        /// Selector of the annotated element (element tasks).
        #[arg(long)]
        selector: Option<String>,
        #[arg(long)]
        source_file: Option<String>,
        #[arg(long)]
        source_line: Option<u32>,
        /// Create through this server so its dispatcher sees the task.
        #[arg(long, env = SERVER_ENV)]
        server: Option<String>,
    },
    /// List tasks in queue order.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Print a task as JSON.
    Show { id: TaskId },
    /// Print the prompt the agent would receive for a task.
    Prompt { id: TaskId },
    /// Report on a task. This is what the agent runs when it finishes.
    Update {
        id: TaskId,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        notes: Option<String>,
        /// Comma-separated list of modified files.
        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,
        /// Send the update through this server instead of writing the file.
        #[arg(long, env = SERVER_ENV)]
        server: Option<String>,
    },
    /// Send a task in review back to the queue with a rejection reason.
    Retry {
        id: TaskId,
        #[arg(long)]
        reason: String,
        /// Requeue through this server instead of writing the file.
        #[arg(long, env = SERVER_ENV)]
        server: Option<String>,
    },
    /// Delete a task and its screenshots. A running agent is stopped when
    /// the delete goes through the server.
    Delete {
        id: TaskId,
        #[arg(long, env = SERVER_ENV)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_logs: cli.json_logs,
        log_dir: cli.log_dir.clone(),
        ..TelemetryConfig::default()
    })?;

    let mut config = LoupeConfig::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve { bind, no_dispatch } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if no_dispatch {
                config.dispatch.enabled = false;
            }
            cmd_serve(config).await
        }
        Commands::Watch { server } => cmd_watch(config, server).await,
        Commands::Task { action } => cmd_task(&config, action).await,
        Commands::Status => cmd_status(&config),
    }
}

/// Cancel `shutdown` on Ctrl+C.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
            shutdown.cancel();
        }
    });
}

/// The agent runs in the project directory, so every path it is given must
/// be absolute.
fn prompt_context(data_dir: &Path) -> Result<PromptContext> {
    let data_dir = std::path::absolute(data_dir)
        .context(format!("failed to resolve {}", data_dir.display()))?;
    Ok(PromptContext::new(data_dir))
}

/// URL a local client uses to reach a listener bound to `addr`.
fn local_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        std::net::Ipv4Addr::LOCALHOST.into()
    } else {
        addr.ip()
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

fn launcher(config: &LoupeConfig, server: &str) -> Arc<ClaudeCli> {
    Arc::new(ClaudeCli::new(config.agent.clone()).with_env(SERVER_ENV, server))
}

// ─── Server & Dispatcher ─────────────────────────────────────────────────

async fn cmd_serve(config: LoupeConfig) -> Result<()> {
    let queue = LocalQueue::open(&config.storage.data_dir).context(format!(
        "failed to open queue in {}",
        config.storage.data_dir.display()
    ))?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .context(format!("failed to bind {}", config.server.bind))?;
    let url = local_url(listener.local_addr()?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let dispatcher = if config.dispatch.enabled {
        let mut dispatcher = Dispatcher::new(
            Arc::new(queue.clone()),
            Arc::new(queue.events()),
            launcher(&config, &url),
            prompt_context(&config.storage.data_dir)?,
            config.dispatch.clone(),
        );
        let token = shutdown.clone();
        tracing::info!(agent = %config.agent.command, "starting dispatcher");
        Some(tokio::spawn(async move { dispatcher.run(token).await }))
    } else {
        tracing::info!("dispatcher disabled, serving API only");
        None
    };

    let state = Arc::new(loupe_api::ApiState::new(queue));
    let served = loupe_api::serve_listener(state, listener, shutdown.clone()).await;
    // Take the dispatcher down with the server, whichever way it stopped.
    shutdown.cancel();

    if let Some(handle) = dispatcher {
        handle.await.context("dispatcher task panicked")??;
    }
    served
}

async fn cmd_watch(config: LoupeConfig, server: String) -> Result<()> {
    let client: Arc<dyn QueueClient> = Arc::new(HttpQueue::new(server.clone())?);
    let events: Arc<dyn EventSource> = Arc::new(HttpEvents::new(server.clone())?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut dispatcher = Dispatcher::new(
        client,
        events,
        launcher(&config, &server),
        prompt_context(&config.storage.data_dir)?,
        config.dispatch.clone(),
    );
    tracing::info!(%server, agent = %config.agent.command, "watching remote queue");
    dispatcher.run(shutdown).await
}

// ─── Task Management ─────────────────────────────────────────────────────

fn open_queue(config: &LoupeConfig) -> Result<LocalQueue> {
    LocalQueue::open(&config.storage.data_dir).context(format!(
        "failed to open queue in {}",
        config.storage.data_dir.display()
    ))
}

async fn cmd_task(config: &LoupeConfig, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::Add {
            note,
            screenshot,
            url,
            title,
            kind,
            priority,
            category,
            selector,
            source_file,
            source_line,
            server,
        } => {
            let bytes = std::fs::read(&screenshot)
                .context(format!("failed to read screenshot: {}", screenshot.display()))?;
            let page = PageInfo {
                url,
                title,
                viewport: None,
            };
            let mut input = NewTask::new(kind, note, STANDARD.encode(bytes), page)
                .with_priority(priority)
                .with_category(category);
            if let Some(selector) = selector {
                input.element = Some(ElementInfo {
                    selector,
                    source_file,
                    source_line,
                    ..ElementInfo::default()
                });
            }
            let task = match server {
                Some(server) => HttpQueue::new(server)?.create_task(&input).await?,
                None => open_queue(config)?.create(input)?,
            };
            println!("Created {}: {}", task.id, truncate(&task.note, 60));
        }
        TaskAction::List { status } => {
            let tasks: Vec<Task> = open_queue(config)?
                .list()
                .into_iter()
                .filter(|t| status.is_none_or(|s| t.status == s))
                .collect();
            print_tasks(&tasks);
        }
        TaskAction::Show { id } => {
            let task = open_queue(config)?
                .get(&id)
                .context(format!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskAction::Prompt { id } => {
            let task = open_queue(config)?
                .get(&id)
                .context(format!("task {id} not found"))?;
            println!("{}", build_prompt(&task, &prompt_context(&config.storage.data_dir)?));
        }
        TaskAction::Update {
            id,
            status,
            notes,
            files,
            server,
        } => {
            let update = TaskUpdate {
                status,
                agent_notes: notes,
                files_modified: files,
                ..TaskUpdate::default()
            };
            if update.is_empty() {
                anyhow::bail!("nothing to update: pass --status, --notes or --files");
            }
            let updated = match server {
                Some(server) => HttpQueue::new(server)?.update_task(&id, update).await?,
                None => open_queue(config)?.update(&id, update)?,
            };
            let task = updated.context(format!("task {id} not found"))?;
            println!("Updated {} to '{}'", task.id, task.status);
        }
        TaskAction::Retry { id, reason, server } => {
            let retried = match server {
                Some(server) => HttpQueue::new(server)?.retry_task(&id, &reason).await?,
                None => open_queue(config)?.retry(&id, &reason)?,
            };
            let task = retried.context(format!("task {id} not found"))?;
            println!(
                "Requeued {} (attempt {} rejected)",
                task.id,
                task.attempts.len()
            );
        }
        TaskAction::Delete {
            id,
            server: Some(server),
        } => {
            if !HttpQueue::new(server)?.delete_task(&id).await? {
                anyhow::bail!("task {id} not found");
            }
            println!("Deleted {id}");
        }
        TaskAction::Delete { id, server: None } => {
            let queue = open_queue(config)?;
            if !queue.delete(&id)? {
                anyhow::bail!("task {id} not found");
            }
            // The store's own cleanup thread dies with the process; remove
            // the screenshots again and wait for it.
            if let Some(handle) = queue.store().artifacts().remove_detached(&id) {
                let _ = handle.join();
            }
            println!("Deleted {id}");
        }
    }

    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    println!(
        "{:<36} {:<12} {:<7} {:<8} {:<4} NOTE",
        "ID", "STATUS", "KIND", "PRIORITY", "TRY"
    );
    println!("{}", "-".repeat(96));
    for t in tasks {
        println!(
            "{:<36} {:<12} {:<7} {:<8} {:<4} {}",
            t.id,
            t.status.label(),
            t.kind.label(),
            t.priority.label(),
            t.attempts.len(),
            truncate(&t.note, 40)
        );
    }
}

fn cmd_status(config: &LoupeConfig) -> Result<()> {
    let counts = open_queue(config)?.status_counts();

    println!("=== Loupe Status ===\n");
    println!("Data directory: {}\n", config.storage.data_dir.display());
    println!("Task counts:");
    for (status, count) in [
        (TaskStatus::Pending, counts.pending),
        (TaskStatus::InProgress, counts.in_progress),
        (TaskStatus::Review, counts.review),
        (TaskStatus::Done, counts.done),
    ] {
        println!("  {:<20} {count}", status.label());
    }
    println!("  {:<20} {}", "total", counts.total);

    if counts.review > 0 {
        println!("\n{} task(s) awaiting review", counts.review);
    }
    Ok(())
}
