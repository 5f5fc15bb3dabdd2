//! Protected Storage (C5): wraps [`crate::storage::Storage`] in a circuit
//! breaker plus per-operation timing, so a struggling SQLite file degrades to
//! fast failures instead of piling up blocked callers (§4.5).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::quota::QuotaLimits;
use crate::spec::DiagramSpec;
use crate::storage::{
    Diagram, DiagramVersion, DiagramVersionMetadata, ListFilter, Page, Permission, Share, Storage,
    UpdateOutcome,
};

/// Circuit breaker tuning (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    /// Consecutive failures in `CLOSED` before tripping to `OPEN`.
    pub failure_threshold: u32,
    /// How long the circuit stays `OPEN` before allowing one trial call.
    pub open_duration: Duration,
    /// Consecutive trial successes in `HALF_OPEN` needed to return to `CLOSED`.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    config: CircuitConfig,
    state: Mutex<State>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    opened_at_ms: AtomicU64,
    half_open_in_flight: Mutex<bool>,
}

impl Breaker {
    fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_in_flight: Mutex::new(false),
        }
    }

    /// Returns `Some(retry_after)` if the call should be rejected outright.
    /// Otherwise admits the call, marking it as the `HALF_OPEN` trial if the
    /// breaker has just become eligible to probe again.
    fn admit(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        match *state {
            State::Closed => Ok(()),
            State::Open => {
                let elapsed = now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Acquire));
                let open_for = Duration::from_millis(elapsed);
                if open_for >= self.config.open_duration {
                    let mut in_flight = self.half_open_in_flight.lock();
                    if *in_flight {
                        // another caller is already probing; keep rejecting fast.
                        return Err(self.config.open_duration.saturating_sub(open_for));
                    }
                    *in_flight = true;
                    *state = State::HalfOpen;
                    self.consecutive_successes.store(0, Ordering::Release);
                    Ok(())
                } else {
                    Err(self.config.open_duration - open_for)
                }
            }
            State::HalfOpen => {
                // a trial call is already in flight; fail fast rather than
                // letting concurrent callers pile onto the probe.
                Err(Duration::from_millis(50))
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            State::HalfOpen => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    *state = State::Closed;
                    self.consecutive_failures.store(0, Ordering::Release);
                    *self.half_open_in_flight.lock() = false;
                    tracing::info!("storage circuit breaker closed");
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip(&mut state);
                }
            }
            State::HalfOpen => {
                // a failed trial reopens immediately.
                self.trip(&mut state);
            }
            State::Open => {}
        }
    }

    fn trip(&self, state: &mut State) {
        *state = State::Open;
        self.opened_at_ms.store(now_ms(), Ordering::Release);
        *self.half_open_in_flight.lock() = false;
        tracing::warn!(
            failure_threshold = self.config.failure_threshold,
            open_for_ms = self.config.open_duration.as_millis() as u64,
            "storage circuit breaker open"
        );
    }
}

fn now_ms() -> u64 {
    // Monotonic enough for breaker timing; never serialized or persisted.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Whether an operation's failure should count against the breaker.
///
/// Caller errors — validation, quota, version conflicts, bad user ids — are
/// not storage-health signals and must not trip the breaker (§4.5).
fn counts_as_failure<T>(result: &Result<T, StorageError>) -> bool {
    matches!(result, Err(StorageError::Sqlite(_)) | Err(StorageError::Io(_)))
}

/// Storage behind a circuit breaker. Exposes the same operations as
/// [`Storage`]; every call records success/failure against the breaker and a
/// `tracing` span for its duration (§4.5).
pub struct ProtectedStorage {
    inner: Storage,
    breaker: Breaker,
}

impl ProtectedStorage {
    pub fn new(inner: Storage) -> Self {
        Self::with_config(inner, CircuitConfig::default())
    }

    pub fn with_config(inner: Storage, config: CircuitConfig) -> Self {
        Self { inner, breaker: Breaker::new(config) }
    }

    async fn guard<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        if let Err(retry_after) = self.breaker.admit() {
            return Err(StorageError::CircuitOpen { retry_after_ms: retry_after.as_millis() as u64 });
        }

        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(200) {
            tracing::warn!(op, elapsed_ms = elapsed.as_millis() as u64, "slow storage operation");
        } else {
            tracing::debug!(op, elapsed_ms = elapsed.as_millis() as u64, "storage operation");
        }

        if counts_as_failure(&result) {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }
        result
    }

    pub async fn create(
        &self,
        name: String,
        project: String,
        spec: DiagramSpec,
        owner_id: Option<String>,
        is_public: bool,
    ) -> Result<Diagram, StorageError> {
        self.guard("create", self.inner.create(name, project, spec, owner_id, is_public)).await
    }

    pub async fn get(&self, id: String) -> Result<Option<Diagram>, StorageError> {
        self.guard("get", self.inner.get(id)).await
    }

    pub async fn update(
        &self,
        id: String,
        spec: DiagramSpec,
        message: Option<String>,
        base_version: Option<i64>,
    ) -> Result<UpdateOutcome, StorageError> {
        self.guard("update", self.inner.update(id, spec, message, base_version)).await
    }

    pub async fn force_update(
        &self,
        id: String,
        spec: DiagramSpec,
        message: Option<String>,
    ) -> Result<UpdateOutcome, StorageError> {
        self.guard("force_update", self.inner.force_update(id, spec, message)).await
    }

    pub async fn transform(
        &self,
        id: String,
        f: impl FnMut(DiagramSpec) -> DiagramSpec + Send + 'static,
        message: Option<String>,
        max_retries: u32,
    ) -> Result<Option<Diagram>, StorageError> {
        self.guard("transform", self.inner.transform(id, f, message, max_retries)).await
    }

    pub async fn delete(&self, id: String) -> Result<bool, StorageError> {
        self.guard("delete", self.inner.delete(id)).await
    }

    pub async fn list(&self, project: Option<String>) -> Result<Vec<Diagram>, StorageError> {
        self.guard("list", self.inner.list(project)).await
    }

    pub async fn list_paginated(&self, filter: ListFilter) -> Result<Page<Diagram>, StorageError> {
        self.guard("list_paginated", self.inner.list_paginated(filter)).await
    }

    pub async fn list_for_user(&self, user_id: Option<String>, filter: ListFilter) -> Result<Page<Diagram>, StorageError> {
        self.guard("list_for_user", self.inner.list_for_user(user_id, filter)).await
    }

    pub async fn update_owner(&self, diagram_id: String, owner_id: Option<String>) -> Result<bool, StorageError> {
        self.guard("update_owner", self.inner.update_owner(diagram_id, owner_id)).await
    }

    pub async fn set_public(&self, diagram_id: String, is_public: bool) -> Result<bool, StorageError> {
        self.guard("set_public", self.inner.set_public(diagram_id, is_public)).await
    }

    pub async fn update_shares(&self, diagram_id: String, shares: Vec<Share>) -> Result<bool, StorageError> {
        self.guard("update_shares", self.inner.update_shares(diagram_id, shares)).await
    }

    pub async fn add_share(&self, diagram_id: String, user_id: String, permission: Permission) -> Result<bool, StorageError> {
        self.guard("add_share", self.inner.add_share(diagram_id, user_id, permission)).await
    }

    pub async fn remove_share(&self, diagram_id: String, user_id: String) -> Result<bool, StorageError> {
        self.guard("remove_share", self.inner.remove_share(diagram_id, user_id)).await
    }

    pub async fn stats(&self) -> Result<crate::storage::Stats, StorageError> {
        self.guard("stats", self.inner.stats()).await
    }

    pub async fn get_versions(&self, diagram_id: String) -> Result<Vec<DiagramVersion>, StorageError> {
        self.guard("get_versions", self.inner.get_versions(diagram_id)).await
    }

    pub async fn get_versions_paginated(
        &self,
        diagram_id: String,
        limit: i64,
        offset: i64,
    ) -> Result<Page<DiagramVersion>, StorageError> {
        self.guard("get_versions_paginated", self.inner.get_versions_paginated(diagram_id, limit, offset))
            .await
    }

    pub async fn get_versions_metadata(
        &self,
        diagram_id: String,
    ) -> Result<Vec<DiagramVersionMetadata>, StorageError> {
        self.guard("get_versions_metadata", self.inner.get_versions_metadata(diagram_id)).await
    }

    pub async fn get_version(&self, diagram_id: String, version: i64) -> Result<Option<DiagramVersion>, StorageError> {
        self.guard("get_version", self.inner.get_version(diagram_id, version)).await
    }

    pub async fn get_latest_version(&self, diagram_id: String) -> Result<Option<DiagramVersion>, StorageError> {
        self.guard("get_latest_version", self.inner.get_latest_version(diagram_id)).await
    }

    pub async fn restore_version(&self, diagram_id: String, version: i64) -> Result<UpdateOutcome, StorageError> {
        self.guard("restore_version", self.inner.restore_version(diagram_id, version)).await
    }

    pub async fn fork(
        &self,
        diagram_id: String,
        new_name: String,
        project: Option<String>,
    ) -> Result<Option<Diagram>, StorageError> {
        self.guard("fork", self.inner.fork(diagram_id, new_name, project)).await
    }

    /// Escape hatch for call sites (thumbnail fallback, version history) that
    /// need the unwrapped engine directly.
    pub fn inner(&self) -> &Storage {
        &self.inner
    }

    pub fn quota(&self) -> &QuotaLimits {
        self.inner.quota_limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DiagramType;
    use crate::thumbnails::ThumbnailStore;
    use std::sync::Arc;

    fn protected() -> ProtectedStorage {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = Arc::new(ThumbnailStore::open(dir.path()).unwrap());
        let storage = Storage::open_in_memory_for_tests(thumbs);
        ProtectedStorage::with_config(
            storage,
            CircuitConfig { failure_threshold: 2, open_duration: Duration::from_millis(50), success_threshold: 1 },
        )
    }

    #[tokio::test]
    async fn passes_through_on_a_healthy_backend() {
        let protected = protected();
        let spec = DiagramSpec::empty(DiagramType::Flowchart);
        let created = protected.create("d".into(), "p".into(), spec, None, false).await.unwrap();
        assert_eq!(created.version, 1);
    }

    #[tokio::test]
    async fn caller_errors_do_not_trip_the_breaker() {
        let protected = protected();
        for _ in 0..10 {
            let err = protected.list_for_user(Some("bad id!".into()), ListFilter::defaults()).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidUserId));
        }
        // still closed: a subsequent healthy call succeeds immediately.
        let spec = DiagramSpec::empty(DiagramType::Flowchart);
        assert!(protected.create("d".into(), "p".into(), spec, None, false).await.is_ok());
    }
}
