//! Aggregate counts across the whole store (§4.4 `Stats`).

use crate::error::{StorageError, StorageResult};

use super::model::Stats;
use super::Storage;

impl Storage {
    /// Diagram count, version-row count, and distinct non-empty project count.
    pub async fn stats(&self) -> StorageResult<Stats> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                let diagram_count: i64 = conn.query_row("SELECT COUNT(*) FROM diagrams", [], |r| r.get(0))?;
                let version_count: i64 = conn.query_row("SELECT COUNT(*) FROM diagram_versions", [], |r| r.get(0))?;
                let project_count: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT project) FROM diagrams WHERE project != ''",
                    [],
                    |r| r.get(0),
                )?;
                Ok(Stats { diagram_count, version_count, project_count })
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("stats task panicked")
    }
}
