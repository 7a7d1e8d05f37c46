use chrono::{DateTime, Utc};

use super::{JobStore, PluginRecord, StoreResult};
use crate::error::StoreError;
use crate::plugin::{PluginDescriptor, PluginState};
use crate::scheduler::types::{
    JobDefinition, JobRow, JobRun, PluginRow, RunOutcome, RunRow, TriggerState, TriggerStateRow,
};

const RUN_COLUMNS: &str =
    "id, job_id, invocation_id, attempt, started_at, finished_at, outcome, detail, result_json";

fn run_detail(run: &JobRun) -> StoreResult<Option<String>> {
    match &run.outcome {
        RunOutcome::Skipped(reason) => Ok(Some(serde_json::to_string(reason)?)),
        _ => Ok(run.error.clone()),
    }
}

fn run_result(run: &JobRun) -> StoreResult<Option<String>> {
    Ok(run.result.as_ref().map(serde_json::to_string).transpose()?)
}

impl JobStore {
    // ---- plugins ----

    /// Record a plugin descriptor and its current state
    pub async fn save_plugin(&self, descriptor: &PluginDescriptor, state: PluginState) -> StoreResult<()> {
        let descriptor_json = serde_json::to_string(descriptor)?;

        sqlx::query(
            r#"
            INSERT INTO plugins (name, version, descriptor_json, state, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                descriptor_json = excluded.descriptor_json,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&descriptor.name)
        .bind(descriptor.version.to_string())
        .bind(descriptor_json)
        .bind(state.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All recorded plugins, by name
    pub async fn list_plugins(&self) -> StoreResult<Vec<PluginRecord>> {
        let rows: Vec<PluginRow> = sqlx::query_as(
            "SELECT descriptor_json, state, updated_at FROM plugins ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<PluginRecord> {
                Ok(PluginRecord {
                    descriptor: serde_json::from_str(&row.descriptor_json)?,
                    state: row.state.parse().map_err(StoreError::Corrupt)?,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    /// Forget a plugin record
    pub async fn delete_plugin(&self, name: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM plugins WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- jobs ----

    /// Insert or replace a job definition
    pub async fn save_job(&self, job: &JobDefinition) -> StoreResult<()> {
        let definition_json = serde_json::to_string(job)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, plugin, definition_json, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                plugin = excluded.plugin,
                definition_json = excluded.definition_json,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.plugin)
        .bind(definition_json)
        .bind(job.enabled)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a job by id
    pub async fn get_job(&self, id: &str) -> StoreResult<Option<JobDefinition>> {
        let row: Option<JobRow> =
            sqlx::query_as("SELECT definition_json, enabled FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(JobDefinition::try_from).transpose()
    }

    /// All jobs, by id
    pub async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT definition_json, enabled FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobDefinition::try_from).collect()
    }

    /// Remove a job definition and its trigger state. Run history is kept.
    pub async fn delete_job(&self, id: &str) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trigger_states WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    // ---- trigger state ----

    /// Insert or replace trigger state
    pub async fn save_trigger_state(&self, state: &TriggerState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trigger_states (job_id, next_due, last_fired, fire_count, subscription)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                next_due = excluded.next_due,
                last_fired = excluded.last_fired,
                fire_count = excluded.fire_count,
                subscription = excluded.subscription
            "#,
        )
        .bind(&state.job_id)
        .bind(state.next_due)
        .bind(state.last_fired)
        .bind(i64::try_from(state.fire_count).unwrap_or(i64::MAX))
        .bind(&state.subscription)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get trigger state for a job
    pub async fn get_trigger_state(&self, job_id: &str) -> StoreResult<Option<TriggerState>> {
        let row: Option<TriggerStateRow> =
            sqlx::query_as("SELECT * FROM trigger_states WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(TriggerState::from))
    }

    // ---- run history ----

    /// Append a run
    pub async fn insert_run(&self, run: &JobRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (
                id, job_id, invocation_id, attempt, started_at,
                finished_at, outcome, detail, result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.job_id)
        .bind(run.invocation_id.to_string())
        .bind(i64::from(run.attempt))
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.outcome.as_str())
        .bind(run_detail(run)?)
        .bind(run_result(run)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the end of a run previously appended with [`insert_run`](Self::insert_run)
    pub async fn finish_run(&self, run: &JobRun) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE job_runs SET finished_at = ?, outcome = ?, detail = ?, result_json = ? WHERE id = ?",
        )
        .bind(run.finished_at)
        .bind(run.outcome.as_str())
        .bind(run_detail(run)?)
        .bind(run_result(run)?)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("run {} not found", run.id)));
        }
        Ok(())
    }

    /// Full history of a job, oldest first
    pub async fn list_runs(&self, job_id: &str) -> StoreResult<Vec<JobRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_runs WHERE job_id = ? ORDER BY seq",
            RUN_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }

    /// The last `limit` runs of a job, oldest first
    pub async fn recent_runs(&self, job_id: &str, limit: u32) -> StoreResult<Vec<JobRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {cols} FROM (SELECT seq, {cols} FROM job_runs WHERE job_id = ? ORDER BY seq DESC LIMIT ?) ORDER BY seq",
            cols = RUN_COLUMNS
        ))
        .bind(job_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }

    /// Most recent run that actually executed to completion (skips and
    /// in-progress runs are ignored)
    pub async fn latest_finished_run(&self, job_id: &str) -> StoreResult<Option<JobRun>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_runs WHERE job_id = ? AND outcome NOT IN ('skipped', 'in_progress') ORDER BY seq DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRun::try_from).transpose()
    }

    /// Ids of every job with recorded history, including removed jobs
    pub async fn history_job_ids(&self) -> StoreResult<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT job_id FROM job_runs ORDER BY job_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Mark runs left in progress by a previous process as cancelled
    pub async fn mark_interrupted_runs(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE job_runs SET outcome = 'cancelled', finished_at = ?, detail = 'interrupted by restart' WHERE outcome = 'in_progress'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Apply history retention: keep at most `max_per_job` runs per job and
    /// drop finished runs that started before `older_than`
    pub async fn prune_history(
        &self,
        max_per_job: Option<u32>,
        older_than: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        let mut deleted = 0;

        if let Some(cutoff) = older_than {
            deleted += sqlx::query("DELETE FROM job_runs WHERE started_at < ? AND outcome != 'in_progress'")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        if let Some(max) = max_per_job {
            deleted += sqlx::query(
                r#"
                DELETE FROM job_runs WHERE seq IN (
                    SELECT seq FROM (
                        SELECT seq, ROW_NUMBER() OVER (PARTITION BY job_id ORDER BY seq DESC) AS rn
                        FROM job_runs
                    ) WHERE rn > ?
                )
                "#,
            )
            .bind(i64::from(max))
            .execute(&self.pool)
            .await?
            .rows_affected();
        }

        Ok(deleted)
    }
}
