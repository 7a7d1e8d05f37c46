//! Job inspection CLI commands
//!
//! `autohost jobs`            - list jobs with their last outcome
//! `autohost history <job>`   - show recent runs of one job
//!
//! Both read the database directly, so they work whether or not a host is running.

use anyhow::{Context, Result};
use autohost_core::{JobRun, JobStore};

use crate::server::AppConfig;

// ── Helpers ──────────────────────────────────────────────────────────

async fn open_store(config: &AppConfig) -> Result<Option<JobStore>> {
    let path = config.database.resolve_path()?;
    if !path.exists() {
        println!("No database at {}", path.display());
        return Ok(None);
    }
    let store = JobStore::from_path(&path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Some(store))
}

fn format_duration(run: &JobRun) -> String {
    match run.duration() {
        Some(d) if d.num_milliseconds() >= 1000 => {
            format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0)
        }
        Some(d) => format!("{}ms", d.num_milliseconds()),
        None => "-".to_string(),
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────

/// List persisted jobs.
pub async fn list(config: &AppConfig) -> Result<()> {
    let Some(store) = open_store(config).await? else {
        return Ok(());
    };

    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs registered.");
        store.close().await;
        return Ok(());
    }

    println!(
        "{:<40} {:<16} {:<9} {:<8} {}",
        "JOB", "PLUGIN", "TRIGGER", "ENABLED", "LAST RUN"
    );
    for job in &jobs {
        let last = match store.latest_finished_run(&job.id).await? {
            Some(run) => format!(
                "{} at {}",
                run.outcome,
                run.started_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => "never".to_string(),
        };
        println!(
            "{:<40} {:<16} {:<9} {:<8} {}",
            job.id,
            job.plugin,
            job.trigger.kind(),
            if job.enabled { "yes" } else { "no" },
            last
        );
    }

    store.close().await;
    Ok(())
}

// ── History ──────────────────────────────────────────────────────────

/// Show the most recent runs of `job_id`, oldest first.
pub async fn history(config: &AppConfig, job_id: &str, limit: u32) -> Result<()> {
    let Some(store) = open_store(config).await? else {
        return Ok(());
    };

    let runs = store.recent_runs(job_id, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded for '{job_id}'.");
        store.close().await;
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<32} {:<9} {}",
        "STARTED", "ATTEMPT", "OUTCOME", "DURATION", "DETAIL"
    );
    for run in &runs {
        let detail = run
            .error
            .clone()
            .or_else(|| run.result.as_ref().map(|v| v.to_string()))
            .unwrap_or_default();
        println!(
            "{:<20} {:<8} {:<32} {:<9} {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.attempt,
            run.outcome.to_string(),
            format_duration(run),
            detail
        );
    }

    store.close().await;
    Ok(())
}
