use chrono::DateTime;
use mediafetch::config::Config;
use mediafetch::ledger::{FjallLedger, Ledger};
use mediafetch::queue::{DownloadJob, JobStatus, QueueSnapshot};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::RunArgs;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(config: &Config, args: RunArgs) -> Result<(), AnyError> {
    let engine = mediafetch::start(config)?;

    for item in &args.items {
        let id = Uuid::new_v4().to_string();
        let title = args.title.clone().unwrap_or_else(|| item.clone());
        let mut job = DownloadJob::new(id, item, &args.format, &args.quality, title);
        if let Some(kind) = args.transport {
            job = job.with_transport(kind);
        }
        engine.enqueue(job)?;
    }

    let progress = tokio::spawn(report_progress(engine.subscribe()));

    tokio::select! {
        idle = engine.wait_idle() => print_summary(&idle?),
        _ = shutdown_signal() => info!("Interrupted, queue will resume on next run"),
    }

    progress.abort();
    engine.shutdown().await?;
    Ok(())
}

async fn report_progress(mut rx: watch::Receiver<QueueSnapshot>) {
    let mut last = None;
    while rx.changed().await.is_ok() {
        let current = {
            let snapshot = rx.borrow_and_update();
            snapshot
                .active
                .as_ref()
                .map(|job| (job.id.clone(), job.title.clone(), job.progress, snapshot.session))
        };
        if current == last {
            continue;
        }
        if let Some((_, title, progress, session)) = &current {
            match session {
                Some(state) => println!("{:>3}% {} ({:?})", progress, title, state),
                None => println!("{:>3}% {}", progress, title),
            }
        }
        last = current;
    }
}

fn print_summary(snapshot: &QueueSnapshot) {
    // restored history entries were never started in this process
    for job in snapshot.history.iter().filter(|job| job.started_at.is_some()) {
        match job.status {
            JobStatus::Completed => println!(
                "done    {} -> {}",
                job.title,
                job.output_path.as_deref().unwrap_or("?")
            ),
            _ => println!(
                "failed  {}: {}",
                job.title,
                job.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

pub fn show_queue(config: &Config) -> Result<(), AnyError> {
    let ledger = FjallLedger::open(&config.storage.ledger_path)?;
    let Some(record) = ledger.load_queue()? else {
        println!("queue is empty");
        return Ok(());
    };

    if let Some(active) = &record.active_job {
        println!("active  {} [{} {}] {}%", active.title, active.format, active.quality, active.progress);
    }
    for (position, job) in record.wait_list.iter().enumerate() {
        println!("{:>6}  {} [{} {}]", position + 1, job.title, job.format, job.quality);
    }
    if record.active_job.is_none() && record.wait_list.is_empty() {
        println!("queue is empty");
    }
    Ok(())
}

pub fn show_history(config: &Config) -> Result<(), AnyError> {
    let ledger = FjallLedger::open(&config.storage.ledger_path)?;
    let records = ledger.list_completed()?;
    if records.is_empty() {
        println!("no completed downloads");
    }
    for record in records {
        let at = DateTime::from_timestamp_millis(record.completed_at_epoch_ms)
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{}  {} [{}] -> {}", at, record.title, record.format, record.final_path);
    }
    Ok(())
}

pub fn clear_history(config: &Config) -> Result<(), AnyError> {
    let ledger = FjallLedger::open(&config.storage.ledger_path)?;
    let removed = ledger.clear_completed()?;
    ledger.persist()?;
    println!("removed {} completed records", removed);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
