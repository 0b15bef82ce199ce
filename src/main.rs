use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::throttle::{PermissionGate, RateThrottler, ThrottleLimit};

/// Drive a simulated workload through a multi-window rate throttler.
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inline limit as <WINDOW_MS>:<MAX_COUNT>; overrides configured limits
    #[arg(short, long = "limit", value_parser = parse_limit)]
    limits: Vec<ThrottleLimit>,

    /// Total number of executions to admit
    #[arg(long, default_value_t = 10)]
    calls: usize,

    /// Number of concurrent workers competing for admission
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn parse_limit(s: &str) -> Result<ThrottleLimit, String> {
    let (window, count) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <WINDOW_MS>:<MAX_COUNT>, got '{}'", s))?;
    let window_ms: u64 = window
        .trim()
        .parse()
        .map_err(|e| format!("invalid window '{}': {}", window, e))?;
    let max_count: i64 = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid max count '{}': {}", count, e))?;

    ThrottleLimit::new(Duration::from_millis(window_ms), max_count).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SluiceConfig::from_file(path)?,
        None => SluiceConfig::default(),
    };

    // Initialize tracing
    let level = args.log_level.as_deref().unwrap_or(config.log_level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Sluice throttle workload");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limits = if args.limits.is_empty() {
        config.throttle_limits()?
    } else {
        args.limits.clone()
    };
    for limit in &limits {
        info!(limit = %limit, "Limit configured");
    }

    let throttler = RateThrottler::new(limits)?;
    info!(capacity = throttler.capacity(), "Throttler initialized");
    let gate: Arc<dyn PermissionGate> = Arc::new(throttler);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        canceller.cancel();
    });

    let admitted = run_workload(gate, cancel, args.calls, args.workers.max(1)).await;

    info!(
        admitted = admitted,
        requested = args.calls,
        "Sluice throttle workload finished"
    );
    Ok(())
}

/// Spawn workers that share `calls` admissions; returns how many were admitted.
async fn run_workload(
    gate: Arc<dyn PermissionGate>,
    cancel: CancellationToken,
    calls: usize,
    workers: usize,
) -> usize {
    let start = Instant::now();
    let next_call = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let next_call = Arc::clone(&next_call);

            tokio::spawn(async move {
                let mut admitted = 0;
                loop {
                    let call = next_call.fetch_add(1, Ordering::SeqCst);
                    if call >= calls {
                        break;
                    }

                    if let Err(e) = gate.acquire(&cancel).await {
                        warn!(worker = worker, error = %e, "Worker stopped");
                        break;
                    }

                    admitted += 1;
                    info!(
                        worker = worker,
                        call = call + 1,
                        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "Execution admitted"
                    );
                }
                admitted
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .sum()
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling pending waits");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling pending waits");
        }
    }
}
