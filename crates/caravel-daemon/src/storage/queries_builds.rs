//! Build record queries.
//!
//! The build queue delivers at-least-once, so every mutation here is a
//! guarded UPDATE against the current status: re-applying a transition that
//! already happened affects zero rows instead of corrupting state.

use caravel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{BuildRow, BuildStatus};

impl Database {
    /// Create a build in `pending` state. Done before any external work so
    /// the attempt is observable even if the process crashes right after.
    pub async fn create_build(
        &self,
        id: &str,
        site_id: &str,
        config_id: Option<&str>,
    ) -> Result<BuildRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO builds (id, site_id, config_id, build_status, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ",
        )
        .bind(id)
        .bind(site_id)
        .bind(config_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_build(id).await
    }

    /// Get a build by id.
    pub async fn get_build(&self, id: &str) -> Result<BuildRow, DatabaseError> {
        sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Build {id}")))
    }

    /// Transition `pending` → `in_progress`, clearing prior logs.
    ///
    /// Returns `true` when this call performed the transition. Returns
    /// `false` when the build was already in progress (redelivered job) —
    /// the caller may proceed. A build in a terminal state stays untouched.
    pub async fn start_build(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE builds
            SET build_status = 'in_progress', logs = '', last_output = NULL,
                reason = NULL, updated_at = ?
            WHERE id = ? AND build_status = 'pending'
            ",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Append one line to the build log. Logs are append-only; nothing ever
    /// truncates them mid-build.
    pub async fn append_build_log(
        &self,
        id: &str,
        line: &str,
        last_output: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        chunk.push('\n');

        if let Some(last) = last_output {
            sqlx::query(
                r"
                UPDATE builds SET logs = logs || ?, last_output = ?, updated_at = ?
                WHERE id = ? AND build_status = 'in_progress'
                ",
            )
            .bind(&chunk)
            .bind(last)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query(
                r"
                UPDATE builds SET logs = logs || ?, updated_at = ?
                WHERE id = ? AND build_status = 'in_progress'
                ",
            )
            .bind(&chunk)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        }

        Ok(())
    }

    /// Finalize a build. Only `in_progress` builds can reach a terminal
    /// state, so `pending` can never jump straight to `success` and a
    /// redelivered job cannot finalize twice.
    ///
    /// Returns `true` when this call performed the transition.
    pub async fn finish_build(
        &self,
        id: &str,
        status: BuildStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "finish_build called with non-terminal status {status}"
            )));
        }

        let now = unix_timestamp();
        let result = sqlx::query(
            r"
            UPDATE builds
            SET build_status = ?, reason = ?, finished_at = ?, updated_at = ?
            WHERE id = ? AND build_status = 'in_progress'
            ",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
