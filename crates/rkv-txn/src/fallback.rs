use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rkv_types::{CommitResult, Consistency, KeyRange, Mutation, RkvError, StoreKind, TxState};

use crate::raft::{RaftKvDatabase, RaftTransaction};
use crate::standalone::{StandaloneKvDatabase, StandaloneTransaction};
use crate::{KvDatabase, KvTransaction, TxOptions};

// ---------------------------------------------------------------------------
// Policies and configuration
// ---------------------------------------------------------------------------

/// What happens to data written in standalone mode once the cluster is
/// reachable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Drop it and continue from the cluster's state.
    #[default]
    Discard,
    /// Overwrite the replicated key space with it in one transaction.
    Resync,
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilePolicy::Discard => f.write_str("discard"),
            ReconcilePolicy::Resync => f.write_str("resync"),
        }
    }
}

impl FromStr for ReconcilePolicy {
    type Err = RkvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(ReconcilePolicy::Discard),
            "resync" => Ok(ReconcilePolicy::Resync),
            other => Err(RkvError::InvalidArgument(format!("unknown reconcile policy {other:?}"))),
        }
    }
}

/// How LINEARIZABLE transactions are treated while no cluster is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearizablePolicy {
    /// Fail `begin` with `Unreachable`.
    #[default]
    Reject,
    /// Serve them from the standalone store like any other level.
    Downgrade,
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Time between reachability probes.
    pub check_interval: Duration,
    /// Upper bound on one probe.
    pub probe_timeout: Duration,
    /// How long probes must fail continuously before switching to standalone.
    pub min_unavailable: Duration,
    /// How long probes must succeed continuously before switching back.
    pub min_available: Duration,
    pub reconcile: ReconcilePolicy,
    pub standalone_linearizable: LinearizablePolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            check_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            min_unavailable: Duration::from_secs(5),
            min_available: Duration::from_secs(10),
            reconcile: ReconcilePolicy::default(),
            standalone_linearizable: LinearizablePolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    #[default]
    Normal,
    Standalone,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackMode::Normal => f.write_str("NORMAL"),
            FallbackMode::Standalone => f.write_str("STANDALONE"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackState {
    pub mode: FallbackMode,
    pub last_switch: Option<SystemTime>,
    pub migration_in_progress: bool,
}

#[derive(Debug, Default)]
struct Health {
    failing_since: Option<Instant>,
    healthy_since: Option<Instant>,
}

struct Shared {
    state: Mutex<FallbackState>,
    reconcile: Mutex<ReconcilePolicy>,
    health: Mutex<Health>,
    /// Bumped on every switch. Transactions remember the epoch they began in.
    epoch: AtomicU64,
    /// Commits hold the read side, switches the write side.
    gate: RwLock<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// FallbackKvDatabase
// ---------------------------------------------------------------------------

/// Serves transactions from the replicated store while its leader is
/// reachable and from a local standalone store while it is not.
///
/// On entering standalone mode the standalone store is seeded with this
/// node's applied replicated state. On leaving it the configured
/// [`ReconcilePolicy`] decides whether standalone writes are copied back.
/// Switches wait for in-flight commits; a transaction whose commit starts
/// after a switch fails with `Conflict`.
#[derive(Clone)]
pub struct FallbackKvDatabase {
    raft: RaftKvDatabase,
    standalone: StandaloneKvDatabase,
    config: FallbackConfig,
    shared: Arc<Shared>,
}

impl FallbackKvDatabase {
    pub fn new(raft: RaftKvDatabase, standalone: StandaloneKvDatabase, config: FallbackConfig) -> Self {
        Self::with_mode(raft, standalone, config, FallbackMode::Normal)
    }

    /// Like [`new`](Self::new), but resumes in standalone mode when the
    /// standalone store still holds data from an outage that was never
    /// reconciled.
    pub async fn open(raft: RaftKvDatabase, standalone: StandaloneKvDatabase, config: FallbackConfig) -> Self {
        let mode = if standalone.is_empty().await { FallbackMode::Normal } else { FallbackMode::Standalone };
        if mode == FallbackMode::Standalone {
            warn!("standalone store holds unreconciled data, starting in standalone mode");
        }
        Self::with_mode(raft, standalone, config, mode)
    }

    fn with_mode(
        raft: RaftKvDatabase,
        standalone: StandaloneKvDatabase,
        config: FallbackConfig,
        mode: FallbackMode,
    ) -> Self {
        let shared = Shared {
            state: Mutex::new(FallbackState { mode, ..FallbackState::default() }),
            reconcile: Mutex::new(config.reconcile),
            health: Mutex::new(Health::default()),
            epoch: AtomicU64::new(0),
            gate: RwLock::new(()),
        };
        FallbackKvDatabase { raft, standalone, config, shared: Arc::new(shared) }
    }

    pub fn raft(&self) -> &RaftKvDatabase {
        &self.raft
    }

    pub fn standalone(&self) -> &StandaloneKvDatabase {
        &self.standalone
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn state(&self) -> FallbackState {
        lock(&self.shared.state).clone()
    }

    /// The store new transactions are served from.
    pub fn active_store(&self) -> StoreKind {
        match self.state().mode {
            FallbackMode::Normal => StoreKind::Raft,
            FallbackMode::Standalone => StoreKind::Standalone,
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        *lock(&self.shared.reconcile)
    }

    pub fn set_reconcile_policy(&self, policy: ReconcilePolicy) {
        let previous = std::mem::replace(&mut *lock(&self.shared.reconcile), policy);
        if previous != policy {
            info!(%previous, %policy, "reconcile policy changed");
        }
    }

    /// One reachability probe: a read-index round trip to the leader.
    pub async fn probe(&self) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, self.raft.raft().read_index()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "reachability probe failed");
                false
            }
            Err(_) => {
                debug!("reachability probe timed out");
                false
            }
        }
    }

    /// Probe once and switch mode if the outcome has held long enough.
    /// Returns the mode in effect afterwards.
    pub async fn check(&self) -> Result<FallbackMode, RkvError> {
        let reachable = self.probe().await;
        let mode = self.state().mode;
        let switch = {
            let now = Instant::now();
            let mut health = lock(&self.shared.health);
            if reachable {
                health.failing_since = None;
                let since = *health.healthy_since.get_or_insert(now);
                mode == FallbackMode::Standalone && now.duration_since(since) >= self.config.min_available
            } else {
                health.healthy_since = None;
                let since = *health.failing_since.get_or_insert(now);
                mode == FallbackMode::Normal && now.duration_since(since) >= self.config.min_unavailable
            }
        };
        if switch {
            match mode {
                FallbackMode::Normal => self.enter_standalone().await?,
                FallbackMode::Standalone => self.leave_standalone().await?,
            }
        }
        Ok(self.state().mode)
    }

    /// Run [`check`](Self::check) every `check_interval` until aborted.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(db.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = db.check().await {
                    warn!(error = %e, "fallback mode switch failed");
                }
            }
        })
    }

    async fn enter_standalone(&self) -> Result<(), RkvError> {
        let _gate = self.shared.gate.write().await;
        let (applied, pairs) = {
            let sm = self.raft.raft().store().read().await;
            (sm.applied_index(), sm.scan(&KeyRange::all(), sm.applied_index(), usize::MAX))
        };
        let keys = pairs.len();
        self.standalone.replace(pairs).await?;
        self.switch_to(FallbackMode::Standalone);
        warn!(applied, keys, "cluster unreachable, serving transactions from the standalone store");
        Ok(())
    }

    async fn leave_standalone(&self) -> Result<(), RkvError> {
        let _gate = self.shared.gate.write().await;
        lock(&self.shared.state).migration_in_progress = true;
        let policy = self.reconcile_policy();
        let result = self.reconcile(policy).await;
        lock(&self.shared.state).migration_in_progress = false;
        result?;
        self.switch_to(FallbackMode::Normal);
        info!(%policy, "cluster reachable again, serving transactions from the replicated store");
        Ok(())
    }

    async fn reconcile(&self, policy: ReconcilePolicy) -> Result<(), RkvError> {
        if policy == ReconcilePolicy::Resync {
            let pairs = self.standalone.export().await;
            let keys = pairs.len();
            let mut tx = self.raft.begin(TxOptions::new(Consistency::Linearizable)).await?;
            tx.delete_range(KeyRange::all())?;
            for (key, value) in pairs {
                tx.put(key, value)?;
            }
            let result = tx.commit().await?;
            info!(keys, index = result.index, "standalone data copied to the replicated store");
        }
        self.standalone.clear().await
    }

    fn switch_to(&self, mode: FallbackMode) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.shared.state);
        state.mode = mode;
        state.last_switch = Some(SystemTime::now());
    }
}

impl KvDatabase for FallbackKvDatabase {
    type Tx = FallbackTransaction;

    /// The kind of the store currently active; individual transactions
    /// report their own.
    fn kind(&self) -> StoreKind {
        self.active_store()
    }

    async fn begin(&self, options: TxOptions) -> Result<FallbackTransaction, RkvError> {
        // The gate only pairs epoch with mode. Begin itself may wait on a read
        // index; a switch meanwhile is caught by the epoch check at commit.
        let (epoch, mode) = {
            let _gate = self.shared.gate.read().await;
            (self.shared.epoch.load(Ordering::SeqCst), self.state().mode)
        };
        let inner = match mode {
            FallbackMode::Normal => Backing::Raft(self.raft.begin(options).await?),
            FallbackMode::Standalone => {
                if options.consistency == Consistency::Linearizable {
                    match self.config.standalone_linearizable {
                        LinearizablePolicy::Reject => {
                            return Err(RkvError::Unreachable(
                                "linearizable transactions are unavailable in standalone mode".into(),
                            ))
                        }
                        LinearizablePolicy::Downgrade => {
                            debug!("linearizable transaction served by the standalone store");
                        }
                    }
                }
                Backing::Standalone(self.standalone.begin(options).await?)
            }
        };
        Ok(FallbackTransaction { inner, epoch, shared: self.shared.clone() })
    }
}

// ---------------------------------------------------------------------------
// FallbackTransaction
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Backing {
    Raft(RaftTransaction),
    Standalone(StandaloneTransaction),
}

/// A transaction bound to whichever store was active when it began.
pub struct FallbackTransaction {
    inner: Backing,
    epoch: u64,
    shared: Arc<Shared>,
}

impl fmt::Debug for FallbackTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackTransaction")
            .field("inner", &self.inner)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl FallbackTransaction {
    /// The replicated transaction underneath, if that is where this one runs.
    pub fn as_raft(&self) -> Option<&RaftTransaction> {
        match &self.inner {
            Backing::Raft(tx) => Some(tx),
            Backing::Standalone(_) => None,
        }
    }
}

impl KvTransaction for FallbackTransaction {
    fn kind(&self) -> StoreKind {
        match &self.inner {
            Backing::Raft(tx) => tx.kind(),
            Backing::Standalone(tx) => tx.kind(),
        }
    }

    fn consistency(&self) -> Consistency {
        match &self.inner {
            Backing::Raft(tx) => tx.consistency(),
            Backing::Standalone(tx) => tx.consistency(),
        }
    }

    fn state(&self) -> TxState {
        match &self.inner {
            Backing::Raft(tx) => tx.state(),
            Backing::Standalone(tx) => tx.state(),
        }
    }

    fn base_index(&self) -> u64 {
        match &self.inner {
            Backing::Raft(tx) => tx.base_index(),
            Backing::Standalone(tx) => tx.base_index(),
        }
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, RkvError> {
        match &mut self.inner {
            Backing::Raft(tx) => tx.get(key).await,
            Backing::Standalone(tx) => tx.get(key).await,
        }
    }

    async fn scan(&mut self, range: KeyRange, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RkvError> {
        match &mut self.inner {
            Backing::Raft(tx) => tx.scan(range, limit).await,
            Backing::Standalone(tx) => tx.scan(range, limit).await,
        }
    }

    fn write(&mut self, mutation: Mutation) -> Result<(), RkvError> {
        match &mut self.inner {
            Backing::Raft(tx) => tx.write(mutation),
            Backing::Standalone(tx) => tx.write(mutation),
        }
    }

    async fn commit(&mut self) -> Result<CommitResult, RkvError> {
        let shared = self.shared.clone();
        let _gate = shared.gate.read().await;
        if shared.epoch.load(Ordering::SeqCst) != self.epoch {
            self.rollback();
            return Err(RkvError::Conflict("backing store switched during the transaction".into()));
        }
        match &mut self.inner {
            Backing::Raft(tx) => tx.commit().await,
            Backing::Standalone(tx) => tx.commit().await,
        }
    }

    fn rollback(&mut self) {
        match &mut self.inner {
            Backing::Raft(tx) => tx.rollback(),
            Backing::Standalone(tx) => tx.rollback(),
        }
    }
}
