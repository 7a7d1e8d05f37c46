use super::{JobStore, StoreResult};
use crate::error::StoreError;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "plugins",
        r#"
        CREATE TABLE IF NOT EXISTS plugins (
            name TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            descriptor_json TEXT NOT NULL,
            state TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )
        "#,
    ),
    (
        "jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            plugin TEXT NOT NULL,
            definition_json TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )
        "#,
    ),
    (
        "trigger_states",
        r#"
        CREATE TABLE IF NOT EXISTS trigger_states (
            job_id TEXT PRIMARY KEY,
            next_due TIMESTAMP,
            last_fired TIMESTAMP,
            fire_count INTEGER NOT NULL DEFAULT 0,
            subscription TEXT
        )
        "#,
    ),
    (
        "job_runs",
        r#"
        CREATE TABLE IF NOT EXISTS job_runs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            job_id TEXT NOT NULL,
            invocation_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            started_at TIMESTAMP NOT NULL,
            finished_at TIMESTAMP,
            outcome TEXT NOT NULL,
            detail TEXT,
            result_json TEXT
        )
        "#,
    ),
    (
        "idx_jobs_plugin",
        "CREATE INDEX IF NOT EXISTS idx_jobs_plugin ON jobs(plugin)",
    ),
    (
        "idx_runs_job",
        "CREATE INDEX IF NOT EXISTS idx_runs_job ON job_runs(job_id, seq)",
    ),
    (
        "idx_runs_started",
        "CREATE INDEX IF NOT EXISTS idx_runs_started ON job_runs(started_at)",
    ),
];

impl JobStore {
    /// Run database migrations
    pub(super) async fn migrate(&self) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        for &(name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Transaction(format!("Migration failed ({}): {}", name, e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(())
    }
}
