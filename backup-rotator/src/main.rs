//! Backup Rotator - Main entry point
//!
//! Creates verified archives, rotates them and restores them, one run at a
//! time per host.

use anyhow::{Context, Result};
use backup_rotator::{
    commands::{self, Command},
    config::Config,
    daemon::{CleanupRegistry, ExecutionGuard, ShutdownCoordinator},
    notify::{self, Notifier},
    utils,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exit status after SIGINT/SIGTERM (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = utils::logger::init_from_config(&config.log, args.log_level.as_deref()) {
        eprintln!("Error: failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    tracing::info!(
        "Starting backup-rotator v{} ({})",
        env!("CARGO_PKG_VERSION"),
        args.command.name()
    );

    let code = run(args.command, config).await;
    std::process::exit(code);
}

async fn run(command: Command, config: Config) -> i32 {
    let notifier: Arc<dyn Notifier> = Arc::from(notify::from_config(&config));
    let cleanup = CleanupRegistry::new();
    let shutdown_coordinator = ShutdownCoordinator::new(cleanup.clone());

    let guard = if command.needs_guard() {
        match ExecutionGuard::acquire(&config.guard) {
            Ok(guard) => {
                let guard = Arc::new(guard);
                shutdown_coordinator.register_guard(Arc::clone(&guard));
                Some(guard)
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot start {} run", command.name());
                notifier.notify(
                    &format!("{} skipped", command.name()),
                    &format!("Reason: {}", e),
                );
                return e.exit_code();
            }
        }
    } else {
        None
    };

    // The core is synchronous; run it off the async workers so the signal
    // watcher below stays responsive.
    let worker = {
        let notifier = Arc::clone(&notifier);
        let command = command.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            commands::execute(&command, &config, notifier.as_ref(), cleanup)
        })
    };

    let signal = async {
        match shutdown_coordinator.wait_for_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Signal handling unavailable");
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        joined = worker => {
            let code = match joined {
                Ok(Ok(())) => {
                    tracing::info!("{} finished", command.name());
                    0
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "{} failed", command.name());
                    e.exit_code()
                }
                Err(e) => {
                    tracing::error!(error = %e, "{} task panicked", command.name());
                    shutdown_coordinator.shutdown();
                    1
                }
            };

            if let Some(guard) = &guard {
                guard.release();
            }
            code
        }
        received = signal => {
            tracing::warn!(signal = ?received, "{} interrupted", command.name());
            shutdown_coordinator.shutdown();
            notifier.notify(
                &format!("{} interrupted", command.name()),
                &format!("Run aborted by {:?}; partial artifacts removed", received),
            );
            EXIT_INTERRUPTED
        }
    }
}
