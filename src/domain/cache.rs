//! Snapshot cache and refresh coalescer.
//!
//! One `CacheSlot` behind a mutex is the single critical section: installing
//! an in-flight refresh, committing a finished snapshot, and releasing the
//! slot all happen under it. Concurrent readers during a refresh window
//! attach to one shared `watch` channel, so N callers produce exactly one
//! underlying collection. The refresh itself runs on a detached driver task
//! that owns the channel sender; a caller cancelled mid-wait never orphans
//! the other waiters.
//!
//! Slot lifecycle: EMPTY → REFRESHING on first request; FRESH is served
//! with zero I/O until TTL expiry; STALE (expired or invalidated) starts or
//! joins a refresh; a failed refresh re-serves the previous snapshot marked
//! stale, or surfaces a cold-start error when there is none.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::CacheConfig;
use crate::error::{Result, StatusError};

use super::model::{CacheState, Snapshot};
use super::store::{SnapshotStore, StoredSnapshot};

/// Produces one freshly collected snapshot per call. Implementations only
/// collect; retry, timeout, and staleness policy live in the cache.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self, generation: u64) -> Result<Snapshot>;
}

/// Timing and retry policy, all configuration-driven.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// How long a committed snapshot counts as fresh.
    pub ttl: Duration,
    /// Watchdog bound on a whole refresh cycle (attempt + backoff +
    /// retry). Guarantees the REFRESHING state is always released.
    pub refresh_timeout: Duration,
    /// Base backoff before the single retry; jitter is added on top.
    pub retry_backoff: Duration,
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            refresh_timeout: Duration::from_secs(config.refresh_timeout_secs),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Shared outcome of one refresh flight. Failures are only published when
/// there was no previous snapshot to fall back to.
type RefreshOutcome = std::result::Result<Arc<Snapshot>, Arc<StatusError>>;
type FlightReceiver = watch::Receiver<Option<RefreshOutcome>>;

struct CacheSlot {
    snapshot: Option<Arc<Snapshot>>,
    expires_at: Option<Instant>,
    /// Generation handed to the next refresh; advances only on commit.
    next_generation: u64,
    in_flight: Option<FlightReceiver>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            snapshot: None,
            expires_at: None,
            next_generation: 1,
            in_flight: None,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.snapshot.is_some() && self.expires_at.is_some_and(|expires| now < expires)
    }

    fn state(&self) -> CacheState {
        if self.in_flight.is_some() {
            CacheState::Refreshing
        } else if self.is_fresh(Instant::now()) {
            CacheState::Fresh
        } else if self.snapshot.is_some() {
            CacheState::Stale
        } else {
            CacheState::Empty
        }
    }
}

/// Cheap-to-clone handle; all clones share one slot.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    source: Arc<dyn SnapshotSource>,
    store: Option<Arc<SnapshotStore>>,
    policy: CachePolicy,
    slot: Mutex<CacheSlot>,
}

impl SnapshotCache {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Option<Arc<SnapshotStore>>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                store,
                policy,
                slot: Mutex::new(CacheSlot::new()),
            }),
        }
    }

    /// The read path. Serves a fresh snapshot with zero I/O; otherwise
    /// starts (or joins) exactly one refresh and waits for its outcome.
    pub async fn get(&self) -> Result<Arc<Snapshot>> {
        let rx = {
            let mut slot = self.inner.slot.lock().await;
            if slot.is_fresh(Instant::now()) {
                if let Some(snapshot) = &slot.snapshot {
                    return Ok(snapshot.clone());
                }
            }
            match &slot.in_flight {
                Some(rx) => rx.clone(),
                None => self.install_refresh(&mut slot),
            }
        };
        await_outcome(rx).await
    }

    /// Refresh regardless of freshness, joining any refresh already in
    /// flight. Used by the background refresher and the mutation surface.
    pub async fn force_refresh(&self) -> Result<Arc<Snapshot>> {
        let rx = {
            let mut slot = self.inner.slot.lock().await;
            match &slot.in_flight {
                Some(rx) => rx.clone(),
                None => self.install_refresh(&mut slot),
            }
        };
        await_outcome(rx).await
    }

    /// Drop freshness after a mutation. The previous snapshot stays for
    /// stale fallback; the next read starts a refresh.
    pub async fn invalidate(&self) {
        let mut slot = self.inner.slot.lock().await;
        slot.expires_at = None;
    }

    /// Adopt a restored snapshot as stale and continue its generation
    /// sequence. No-op once live data or a refresh exists.
    pub async fn seed(&self, snapshot: Snapshot, reason: impl Into<String>) {
        let mut slot = self.inner.slot.lock().await;
        if slot.snapshot.is_some() || slot.in_flight.is_some() {
            return;
        }
        slot.next_generation = snapshot.generation + 1;
        slot.snapshot = Some(Arc::new(snapshot.with_stale(reason)));
        slot.expires_at = None;
    }

    /// The current snapshot, if any, without triggering a refresh.
    pub async fn cached(&self) -> Option<Arc<Snapshot>> {
        self.inner.slot.lock().await.snapshot.clone()
    }

    pub async fn state(&self) -> CacheState {
        self.inner.slot.lock().await.state()
    }

    /// Install a new in-flight refresh. Caller holds the slot lock, which
    /// is what makes the winner unique.
    fn install_refresh(&self, slot: &mut CacheSlot) -> FlightReceiver {
        let (tx, rx) = watch::channel(None);
        slot.in_flight = Some(rx.clone());
        let generation = slot.next_generation;
        let inner = self.inner.clone();
        tokio::spawn(run_refresh(inner, generation, tx));
        rx
    }
}

async fn await_outcome(mut rx: FlightReceiver) -> Result<Arc<Snapshot>> {
    let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(value) => value.clone(),
        // Sender dropped without publishing: the driver task died.
        Err(_) => None,
    };
    match outcome {
        Some(Ok(snapshot)) => Ok(snapshot),
        Some(Err(err)) => Err(StatusError::ColdStart {
            reason: err.to_string(),
        }),
        None => Err(StatusError::Internal(
            "refresh task exited without publishing an outcome".to_string(),
        )),
    }
}

/// The detached refresh driver: collect under the watchdog, then commit
/// (or fall back) inside the critical section, release the slot, and wake
/// every waiter with the shared outcome.
async fn run_refresh(
    inner: Arc<CacheInner>,
    generation: u64,
    tx: watch::Sender<Option<RefreshOutcome>>,
) {
    let started = Instant::now();
    let result = match tokio::time::timeout(
        inner.policy.refresh_timeout,
        fetch_with_retry(&inner, generation),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(StatusError::RefreshTimeout {
            timeout_secs: inner.policy.refresh_timeout.as_secs(),
        }),
    };

    let mut slot = inner.slot.lock().await;
    let outcome: RefreshOutcome = match result {
        Ok(snapshot) => {
            let snapshot = Arc::new(snapshot);
            slot.snapshot = Some(snapshot.clone());
            slot.expires_at = Some(Instant::now() + inner.policy.ttl);
            slot.next_generation = generation + 1;
            debug!(
                generation,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "snapshot committed"
            );
            persist(&inner, &snapshot);
            Ok(snapshot)
        }
        Err(err) => {
            if err.is_parse() {
                error!(error = %err, "refresh failed: agent output does not match the expected schema");
            } else {
                warn!(error = %err, "refresh failed");
            }
            match slot.snapshot.take() {
                Some(previous) => {
                    let stale = Arc::new(previous.as_ref().clone().with_stale(err.to_string()));
                    slot.snapshot = Some(stale.clone());
                    slot.expires_at = None;
                    Ok(stale)
                }
                None => Err(Arc::new(err)),
            }
        }
    };
    slot.in_flight = None;
    drop(slot);

    // Waiters may already be gone; send failure is fine.
    let _ = tx.send(Some(outcome));
}

/// One attempt plus at most one retry. Only execution-class failures are
/// retried; a parse failure is a schema mismatch a retry cannot fix.
async fn fetch_with_retry(inner: &CacheInner, generation: u64) -> Result<Snapshot> {
    match inner.source.fetch(generation).await {
        Ok(snapshot) => Ok(snapshot),
        Err(err) if err.is_retryable() => {
            let backoff = jittered(inner.policy.retry_backoff);
            warn!(
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "refresh attempt failed, retrying once"
            );
            tokio::time::sleep(backoff).await;
            inner.source.fetch(generation).await
        }
        Err(err) => Err(err),
    }
}

fn jittered(base: Duration) -> Duration {
    let max_jitter = base.as_millis() as u64 / 2;
    let jitter = rand::rng().random_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}

/// Persist off the critical path; a failed write only logs.
fn persist(inner: &CacheInner, snapshot: &Arc<Snapshot>) {
    if let Some(store) = &inner.store {
        let store = store.clone();
        let to_persist = snapshot.as_ref().clone();
        tokio::spawn(async move {
            if let Err(e) = store.write(&StoredSnapshot::new(to_persist)).await {
                warn!(error = %e, "failed to persist snapshot");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Device, ExitNodeStatus, SourceMode};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Copy)]
    enum Outcome {
        Success,
        ExecFail,
        ParseFail,
        Hang,
    }

    /// Source that walks a scripted outcome list (last entry repeats) and
    /// counts every call, so tests can assert single-flight and retry
    /// behavior precisely.
    struct ScriptedSource {
        calls: AtomicUsize,
        delay: Duration,
        outcomes: StdMutex<Vec<Outcome>>,
    }

    impl ScriptedSource {
        fn new(outcomes: Vec<Outcome>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                outcomes: StdMutex::new(outcomes),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, generation: u64) -> Result<Snapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let outcomes = self.outcomes.lock().unwrap();
                outcomes[n.min(outcomes.len() - 1)]
            };
            tokio::time::sleep(self.delay).await;
            match outcome {
                Outcome::Success => Ok(test_snapshot(generation)),
                Outcome::ExecFail => Err(StatusError::ExecFailure {
                    command: "tailscale status --json".to_string(),
                    exit_code: Some(1),
                    stderr: "backend stopped".to_string(),
                }),
                Outcome::ParseFail => Err(StatusError::Parse {
                    context: "agent status output",
                    source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
                }),
                Outcome::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(test_snapshot(generation))
                }
            }
        }
    }

    fn test_device(id: &str, hostname: &str) -> Device {
        Device {
            id: id.to_string(),
            hostname: hostname.to_string(),
            dns_name: format!("{hostname}.tail1234.ts.net"),
            os: "linux".to_string(),
            addresses: vec!["100.64.0.1".to_string()],
            online: true,
            last_seen: None,
            exit_node_capable: false,
            exit_node_status: ExitNodeStatus::Disabled,
            advertised_routes: Default::default(),
            allowed_routes: Default::default(),
            tags: Default::default(),
            owner: None,
            authorized: None,
            update_available: None,
            client_version: None,
        }
    }

    fn test_snapshot(generation: u64) -> Snapshot {
        Snapshot {
            self_device: test_device("nSELF", "workstation"),
            peers: BTreeMap::from([("nPEER".to_string(), test_device("nPEER", "gateway"))]),
            captured_at: Utc::now(),
            source_mode: SourceMode::LocalOnly,
            generation,
            stale: false,
            stale_reason: None,
            agent_version: "1.86.2".to_string(),
            backend_state: "Running".to_string(),
            tailnet: None,
            magic_dns_suffix: None,
            health: Vec::new(),
        }
    }

    fn policy(ttl_secs: u64) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(ttl_secs),
            refresh_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn cache_with(source: Arc<ScriptedSource>, ttl_secs: u64) -> SnapshotCache {
        SnapshotCache::new(source, None, policy(ttl_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_reads_coalesce_into_one_fetch() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::from_millis(50));
        let cache = cache_with(source.clone(), 5);

        let (a, b, c) = tokio::join!(cache.get(), cache.get(), cache.get());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(source.calls(), 1);
        assert_eq!(a.generation, 1);
        assert_eq!(b.generation, 1);
        assert_eq!(c.generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_snapshot_served_with_zero_io() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::ZERO);
        let cache = cache_with(source.clone(), 5);

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(first.generation, second.generation);
        assert_eq!(cache.state().await, CacheState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_then_next_read_advances_the_generation() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::from_millis(50));
        let cache = cache_with(source.clone(), 5);

        // Three concurrent reads on a cold slot: one underlying call.
        let (a, b, c) = tokio::join!(cache.get(), cache.get(), cache.get());
        assert_eq!(a.unwrap().generation, 1);
        assert_eq!(b.unwrap().generation, 1);
        assert_eq!(c.unwrap().generation, 1);
        assert_eq!(source.calls(), 1);

        // Past the TTL the slot is stale and the next read refreshes.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.state().await, CacheState::Stale);
        let fourth = cache.get().await.unwrap();
        assert_eq!(fourth.generation, 2);
        assert!(!fourth.stale);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_serves_previous_snapshot_as_stale() {
        let source = ScriptedSource::new(
            vec![Outcome::Success, Outcome::ExecFail, Outcome::ExecFail],
            Duration::ZERO,
        );
        let cache = cache_with(source.clone(), 5);

        let good = cache.get().await.unwrap();
        assert_eq!(source.calls(), 1);

        cache.invalidate().await;
        let stale = cache.get().await.unwrap();

        // Attempt + exactly one retry.
        assert_eq!(source.calls(), 3);
        assert!(stale.stale);
        assert!(stale
            .stale_reason
            .as_deref()
            .is_some_and(|r| r.contains("backend stopped")));
        // Data and generation carry over unchanged.
        assert_eq!(stale.generation, good.generation);
        assert_eq!(stale.peers, good.peers);
        assert_eq!(stale.self_device, good.self_device);
        assert_eq!(cache.state().await, CacheState::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_is_never_retried() {
        let source = ScriptedSource::new(
            vec![Outcome::Success, Outcome::ParseFail],
            Duration::ZERO,
        );
        let cache = cache_with(source.clone(), 5);

        cache.get().await.unwrap();
        cache.invalidate().await;
        let stale = cache.get().await.unwrap();

        // One initial call plus one failed attempt, no retry.
        assert_eq!(source.calls(), 2);
        assert!(stale.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_failure_is_explicit_for_every_waiter() {
        let source = ScriptedSource::new(vec![Outcome::ExecFail], Duration::from_millis(20));
        let cache = cache_with(source.clone(), 5);

        let (a, b, c) = tokio::join!(cache.get(), cache.get(), cache.get());
        for result in [a, b, c] {
            match result {
                Err(StatusError::ColdStart { reason }) => {
                    assert!(reason.contains("backend stopped"));
                }
                other => panic!("expected ColdStart, got {other:?}"),
            }
        }
        // Single flight: one attempt + one retry, even with three waiters.
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.state().await, CacheState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn generations_are_strictly_increasing() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::ZERO);
        let cache = cache_with(source.clone(), 5);

        let mut last = 0;
        for _ in 0..4 {
            let snapshot = cache.force_refresh().await.unwrap();
            assert!(snapshot.generation > last);
            last = snapshot.generation;
        }
        assert_eq!(last, 4);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_does_not_consume_a_generation() {
        let source = ScriptedSource::new(
            vec![
                Outcome::Success,
                Outcome::ExecFail,
                Outcome::ExecFail,
                Outcome::Success,
            ],
            Duration::ZERO,
        );
        let cache = cache_with(source.clone(), 5);

        assert_eq!(cache.get().await.unwrap().generation, 1);
        cache.invalidate().await;
        // Fails (attempt + retry), serves generation 1 marked stale.
        assert_eq!(cache.get().await.unwrap().generation, 1);
        // The next successful refresh picks up where the counter left off.
        assert_eq!(cache.force_refresh().await.unwrap().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_joins_an_in_flight_refresh() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::from_millis(100));
        let cache = cache_with(source.clone(), 5);

        let (read, forced) = tokio::join!(cache.get(), cache.force_refresh());
        assert_eq!(read.unwrap().generation, 1);
        assert_eq!(forced.unwrap().generation, 1);
        assert_eq!(source.calls(), 1);

        // Once the flight is done, force starts a genuinely new one.
        let next = cache.force_refresh().await.unwrap();
        assert_eq!(next.generation, 2);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_releases_a_hung_refresh() {
        let source = ScriptedSource::new(
            vec![Outcome::Hang, Outcome::Success],
            Duration::ZERO,
        );
        let cache = SnapshotCache::new(
            source.clone(),
            None,
            CachePolicy {
                ttl: Duration::from_secs(5),
                refresh_timeout: Duration::from_secs(1),
                retry_backoff: Duration::from_millis(10),
            },
        );

        match cache.get().await {
            Err(StatusError::ColdStart { reason }) => {
                assert!(reason.contains("timed out after 1s"), "reason: {reason}");
            }
            other => panic!("expected ColdStart, got {other:?}"),
        }

        // The slot was released; the next read succeeds normally.
        assert_eq!(cache.state().await, CacheState::Empty);
        let snapshot = cache.get().await.unwrap();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_snapshot_is_stale_and_continues_the_sequence() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::ZERO);
        let cache = cache_with(source.clone(), 5);

        cache
            .seed(test_snapshot(41), "restored from disk cache")
            .await;

        let seeded = cache.cached().await.unwrap();
        assert!(seeded.stale);
        assert_eq!(seeded.generation, 41);
        assert_eq!(
            seeded.stale_reason.as_deref(),
            Some("restored from disk cache")
        );
        assert_eq!(cache.state().await, CacheState::Stale);

        // Seeding never supplies freshness: the first read refreshes and
        // the generation sequence continues from the restored value.
        let live = cache.get().await.unwrap();
        assert_eq!(live.generation, 42);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_keeps_the_snapshot_for_fallback() {
        let source = ScriptedSource::new(vec![Outcome::Success], Duration::ZERO);
        let cache = cache_with(source.clone(), 5);

        cache.get().await.unwrap();
        assert_eq!(cache.state().await, CacheState::Fresh);

        cache.invalidate().await;
        assert_eq!(cache.state().await, CacheState::Stale);
        assert!(cache.cached().await.is_some());
    }
}
