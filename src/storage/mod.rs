//! Storage Engine (C4, §4.4): SQL-backed diagram records, version history,
//! full-text search, pagination, optimistic updates, fork/restore, and
//! access-scoped listing.

mod diagrams;
mod model;
mod pool;
mod schema;
mod sharing;
mod stats;
mod versions;

use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

pub use model::{
    Diagram, DiagramVersion, DiagramVersionMetadata, ListFilter, Page, Permission, Share, SortBy,
    SortOrder, Stats, UpdateOutcome,
};

use crate::error::StorageError;
use crate::quota::QuotaLimits;
use crate::thumbnails::ThumbnailStore;
use pool::Pool;

/// Pattern enforced on every `userId` before it touches a query (§3.2
/// invariant 5, §9 "User-id hygiene"). The charset deliberately excludes the
/// GLOB metacharacters `*`, `?`, `[`, which is what makes the `shares`
/// membership GLOB in [`diagrams::list_for_user`] injection-proof.
fn user_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_@.-]{1,255}$").expect("valid regex"))
}

/// Returns `true` iff `user_id` matches the hygiene pattern.
pub fn is_valid_user_id(user_id: &str) -> bool {
    user_id_pattern().is_match(user_id)
}

/// The SQL-backed storage engine. Cheap to clone (an `Arc` around the pool).
#[derive(Clone)]
pub struct Storage {
    pool: Arc<Pool>,
    thumbnails: Arc<ThumbnailStore>,
    quota: QuotaLimits,
}

impl Storage {
    /// Opens the database at `path` and binds it to `thumbnails` for the
    /// best-effort post-delete cleanup in [`Storage::delete`].
    pub async fn open(
        path: &Path,
        thumbnails: Arc<ThumbnailStore>,
        quota: QuotaLimits,
    ) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let pool = tokio::task::spawn_blocking(move || Pool::open(&path))
            .await
            .expect("open task panicked")?;
        Ok(Self { pool: Arc::new(pool), thumbnails, quota })
    }

    /// An in-memory storage engine with no thumbnail-cleanup side effects, for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn open_in_memory_for_tests(thumbnails: Arc<ThumbnailStore>) -> Self {
        let pool = Pool::open_in_memory().expect("in-memory sqlite always opens");
        Self { pool: Arc::new(pool), thumbnails, quota: QuotaLimits::default() }
    }

    fn quota(&self) -> &QuotaLimits {
        &self.quota
    }

    /// The quota limits this engine enforces on every write.
    pub fn quota_limits(&self) -> &QuotaLimits {
        &self.quota
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .expect("formatting now() as RFC3339 cannot fail")
}
