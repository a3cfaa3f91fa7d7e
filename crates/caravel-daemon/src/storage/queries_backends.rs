//! Backend instance queries.

use caravel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::BackendRow;

impl Database {
    /// Persist a freshly provisioned backend instance.
    pub async fn insert_backend(&self, row: &BackendRow) -> Result<BackendRow, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO backends
                (id, name, description, external_id, url, provider_metadata,
                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.external_id)
        .bind(&row.url)
        .bind(&row.provider_metadata)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(self.pool())
        .await?;

        self.get_backend(&row.id).await
    }

    /// Get an active backend by local id. Fails closed with `NotFound` for
    /// missing or soft-deleted rows.
    pub async fn get_backend(&self, id: &str) -> Result<BackendRow, DatabaseError> {
        sqlx::query_as::<_, BackendRow>(
            "SELECT * FROM backends WHERE id = ? AND status = 'active'",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Backend {id}")))
    }

    /// Get an active backend by provider-assigned external id.
    pub async fn get_backend_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<BackendRow, DatabaseError> {
        sqlx::query_as::<_, BackendRow>(
            "SELECT * FROM backends WHERE external_id = ? AND status = 'active'",
        )
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Backend {external_id}")))
    }

    /// Replace the opaque provider metadata blob after a lifecycle call.
    pub async fn update_backend_metadata(
        &self,
        id: &str,
        metadata: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE backends SET provider_metadata = ?, updated_at = ? WHERE id = ?")
            .bind(metadata)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Soft-delete a backend. Called only after the provider confirmed the
    /// remote destroy; local state must never claim a deletion the provider
    /// hasn't performed.
    pub async fn mark_backend_deleted(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE backends SET status = 'deleted', updated_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_backend(id: &str, external_id: Option<&str>) -> BackendRow {
        let now = unix_timestamp();
        BackendRow {
            id: id.to_string(),
            name: "api-backend".to_string(),
            description: None,
            external_id: external_id.map(String::from),
            url: Some("https://console.caravel.sh/backends/app_1".to_string()),
            provider_metadata: None,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_backend() {
        let db = Database::open_in_memory().await.unwrap();
        let row = db
            .insert_backend(&sample_backend("b1", Some("ext-1")))
            .await
            .unwrap();
        assert_eq!(row.external_id.as_deref(), Some("ext-1"));

        let by_ext = db.get_backend_by_external_id("ext-1").await.unwrap();
        assert_eq!(by_ext.id, "b1");
    }

    #[tokio::test]
    async fn deleted_backend_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_backend(&sample_backend("b1", Some("ext-1")))
            .await
            .unwrap();
        db.mark_backend_deleted("b1").await.unwrap();

        let result = db.get_backend("b1").await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
        let result = db.get_backend_by_external_id("ext-1").await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn metadata_update_is_visible() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_backend(&sample_backend("b1", Some("ext-1")))
            .await
            .unwrap();
        db.update_backend_metadata("b1", r#"{"status":"running"}"#)
            .await
            .unwrap();

        let row = db.get_backend("b1").await.unwrap();
        assert_eq!(
            row.provider_metadata.as_deref(),
            Some(r#"{"status":"running"}"#)
        );
    }
}
