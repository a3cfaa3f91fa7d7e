//! Durable build-job queue on the daemon database.
//!
//! Delivery is at-least-once: a claim moves the job to `running` in a single
//! guarded UPDATE (two workers can never double-claim the same row). A worker
//! that claims a job but cannot start it releases it back to `queued`; a
//! worker crash after claiming leaves the job `running` until an operator or
//! a reaper re-queues it. The build worker's guarded status transitions make
//! redelivery harmless.

use caravel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::BuildJobRow;

impl Database {
    /// Enqueue a build job payload (JSON-serialized `BuildJob`).
    pub async fn enqueue_job(&self, build_id: &str, payload: &str) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO build_jobs (build_id, payload, status, created_at) VALUES (?, ?, 'queued', ?)",
        )
        .bind(build_id)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claim the oldest queued job for `worker_id`, or `None` when the queue
    /// is empty. The `status = 'queued'` guard inside the UPDATE makes the
    /// claim atomic under concurrent workers.
    pub async fn claim_next_job(
        &self,
        worker_id: &str,
    ) -> Result<Option<BuildJobRow>, DatabaseError> {
        let row = sqlx::query_as::<_, BuildJobRow>(
            r"
            UPDATE build_jobs
            SET status = 'running', claimed_by = ?, claimed_at = ?
            WHERE id = (
                SELECT id FROM build_jobs WHERE status = 'queued' ORDER BY id LIMIT 1
            ) AND status = 'queued'
            RETURNING *
            ",
        )
        .bind(worker_id)
        .bind(unix_timestamp())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// Return a claimed job to the queue for redelivery. Used when a worker
    /// claims a job but cannot start it.
    pub async fn release_job(&self, job_id: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE build_jobs SET status = 'queued', claimed_by = NULL, claimed_at = NULL WHERE id = ? AND status = 'running'",
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Mark a claimed job done. Jobs are kept for audit, not deleted.
    pub async fn complete_job(&self, job_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE build_jobs SET status = 'done' WHERE id = ?")
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
