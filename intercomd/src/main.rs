mod channels;
mod container;
mod ipc;
mod message_loop;
mod process_group;
mod queue;
mod router;
mod scheduler;
mod scheduler_wiring;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use intercom_core::{RegisteredGroup, Store, load_config};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::channels::{MailPollChannel, TelegramChannel};
use crate::container::runner::RunConfig;
use crate::container::security::{default_allowlist_path, load_allowlist};
use crate::ipc::{IpcWatcher, IpcWatcherConfig};
use crate::message_loop::MessageLoopConfig;
use crate::queue::GroupQueue;
use crate::scheduler::SchedulerConfig;

#[derive(Parser)]
#[command(name = "intercomd", version, about = "Agent orchestration daemon")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "intercom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator (default).
    Serve,
    /// Print the resolved configuration and exit.
    PrintConfig,
    /// Inspect a legacy sqlite database or project layout.
    InspectLegacy {
        /// Path to a legacy sqlite file. When omitted, inspects the project layout instead.
        #[arg(long)]
        sqlite_path: Option<PathBuf>,
        /// Project root to inspect for legacy layout (`.env`, `groups/`).
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            match toml::to_string_pretty(&config) {
                Ok(s) => println!("{s}"),
                Err(e) => {
                    error!(err = %e, "failed to serialize configuration");
                    return ExitCode::from(1);
                }
            }
            ExitCode::SUCCESS
        }
        Command::InspectLegacy {
            sqlite_path,
            project_root,
        } => {
            if let Some(path) = sqlite_path {
                match intercom_compat::inspect_legacy_sqlite(&path) {
                    Ok(snapshot) => {
                        println!("{}", serde_json::to_string_pretty(&snapshot).unwrap());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        error!(err = %e, "failed to inspect legacy sqlite database");
                        ExitCode::from(1)
                    }
                }
            } else {
                let layout = intercom_compat::inspect_legacy_layout(&project_root);
                println!("{}", serde_json::to_string_pretty(&layout).unwrap());
                ExitCode::SUCCESS
            }
        }
        Command::Serve => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(err = %e, "failed to start tokio runtime");
                    return ExitCode::from(1);
                }
            };
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: intercom_core::IntercomConfig) -> ExitCode {
    let data_dir = PathBuf::from(&config.storage.data_dir);
    let groups_dir = PathBuf::from(&config.storage.groups_dir);

    let store = match Store::open(&data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to open store");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = ensure_container_runtime().await {
        error!(err = %e, "container runtime unreachable");
        return ExitCode::from(2);
    }

    container::runner::cleanup_orphans().await;

    let telegram = Arc::new(TelegramChannel::new(&data_dir));
    let mail = Arc::new(MailPollChannel::new(&data_dir));

    if let Err(e) = mail.connect().await {
        error!(err = %e, "failed to initialize mail channel directories");
        return ExitCode::from(3);
    }
    let telegram_connected = match telegram.connect().await {
        Ok(()) => true,
        Err(e) => {
            warn!(err = %e, "Telegram channel failed to authenticate at startup");
            false
        }
    };
    if !telegram_connected {
        error!("no channel authenticated at startup");
        return ExitCode::from(3);
    }

    let registered_groups = match store.get_all_registered_groups().await {
        Ok(g) => g,
        Err(e) => {
            error!(err = %e, "failed to load registered groups");
            return ExitCode::from(1);
        }
    };
    let groups: Arc<RwLock<HashMap<String, RegisteredGroup>>> =
        Arc::new(RwLock::new(registered_groups));

    let sessions: Arc<RwLock<HashMap<String, String>>> = match store.get_all_sessions().await {
        Ok(s) => Arc::new(RwLock::new(s)),
        Err(e) => {
            warn!(err = %e, "failed to load sessions, starting empty");
            Arc::new(RwLock::new(HashMap::new()))
        }
    };

    let queue = Arc::new(GroupQueue::new(
        config.orchestrator.max_concurrent_containers,
        data_dir.clone(),
    ));

    let allowlist = load_allowlist(&default_allowlist_path());

    let run_config = RunConfig {
        project_root: std::env::current_dir().unwrap_or_default(),
        groups_dir: groups_dir.clone(),
        data_dir: data_dir.clone(),
        timezone: config.scheduler.timezone.clone(),
        idle_timeout_ms: config.orchestrator.idle_timeout_ms,
        allowlist,
    };

    let process_messages_fn = process_group::build_process_messages_fn(
        store.clone(),
        queue.clone(),
        groups.clone(),
        sessions.clone(),
        telegram.clone(),
        mail.clone(),
        config.orchestrator.assistant_name.clone(),
        config.orchestrator.main_group_folder.clone(),
        run_config.clone(),
    );
    queue.set_process_messages_fn(process_messages_fn).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let ipc_watcher = IpcWatcher::new(
        IpcWatcherConfig {
            ipc_base_dir: data_dir.join("ipc"),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
            ..Default::default()
        },
        store.clone(),
        groups.clone(),
    );
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_handle = tokio::spawn(async move { ipc_watcher.run(ipc_shutdown).await });

    let message_loop_config = MessageLoopConfig {
        poll_interval_ms: config.orchestrator.poll_interval_ms,
        assistant_name: config.orchestrator.assistant_name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
    };
    let message_loop_store = store.clone();
    let message_loop_queue = queue.clone();
    let message_loop_groups = groups.clone();
    let message_loop_shutdown = shutdown_rx.clone();
    let message_loop_handle = tokio::spawn(async move {
        message_loop::run_message_loop(
            message_loop_config,
            message_loop_store,
            message_loop_queue,
            message_loop_groups,
            message_loop_shutdown,
        )
        .await
    });

    let task_callback = scheduler_wiring::build_task_callback(
        store.clone(),
        queue.clone(),
        groups.clone(),
        sessions.clone(),
        telegram.clone(),
        mail.clone(),
        run_config.clone(),
        config.scheduler.timezone.clone(),
        config.orchestrator.assistant_name.clone(),
    );
    let scheduler_config = SchedulerConfig {
        poll_interval: std::time::Duration::from_millis(config.scheduler.poll_interval_ms),
        timezone: config.scheduler.timezone.clone(),
        enabled: true,
    };
    let scheduler_store = store.clone();
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler_config, scheduler_store, task_callback, scheduler_shutdown)
            .await
    });

    info!("intercomd started");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining active containers");

    let _ = shutdown_tx.send(true);
    queue.shutdown(30_000).await;

    let _ = tokio::join!(ipc_handle, message_loop_handle, scheduler_handle);

    info!("intercomd stopped");
    ExitCode::SUCCESS
}

async fn ensure_container_runtime() -> anyhow::Result<()> {
    container::runner::ensure_runtime_available().await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
