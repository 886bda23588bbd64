//! Sync Service - Front-end for triggering and controlling backups
//!
//! Owns the state machine, the progress counter and the broadcaster, and runs
//! each backup on a dedicated worker thread. At most one run is active at a
//! time; further start requests are rejected as busy.

use super::broadcast::{StateChangeBroadcaster, StateObserver};
use super::engine::{SyncResult, SyncRun, SyncStateMachine};
use super::models::{RejectReason, StartOutcome, StateChange, SyncState, TrustDecision};
use super::progress::{ProgressCounter, ProgressSnapshot};
use super::source::MessageSource;
use super::status::{describe, StatusReport};
use super::trust::{summarize, CertificateChain, CertificateTrustNegotiator};
use crate::db::{BackupCursor, Database, DbResult, TrustStore};
use crate::mail::{BackupConfig, ImapStore, MailStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

/// Creates a fresh mail store connection for each run
pub type StoreFactory = Arc<dyn Fn() -> Box<dyn MailStore> + Send + Sync>;

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    machine: SyncStateMachine,
    progress: Arc<ProgressCounter>,
    broadcaster: Arc<StateChangeBroadcaster>,
    config: RwLock<BackupConfig>,
    source: Arc<dyn MessageSource>,
    cursor: Arc<dyn BackupCursor>,
    negotiator: CertificateTrustNegotiator,
    store_factory: StoreFactory,
    working: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start and cancel requests
    control: Mutex<()>,
}

/// Clears the working flag when the worker exits, even by panic
struct WorkingGuard(Arc<ServiceInner>);

impl Drop for WorkingGuard {
    fn drop(&mut self) {
        self.0.working.store(false, Ordering::SeqCst);
    }
}

impl SyncService {
    pub fn new(
        config: BackupConfig,
        source: Arc<dyn MessageSource>,
        cursor: Arc<dyn BackupCursor>,
        trust_store: Arc<dyn TrustStore>,
        store_factory: StoreFactory,
    ) -> Self {
        let progress = Arc::new(ProgressCounter::new());
        let broadcaster = Arc::new(StateChangeBroadcaster::new());

        Self {
            inner: Arc::new(ServiceInner {
                machine: SyncStateMachine::new(progress.clone(), broadcaster.clone()),
                progress,
                broadcaster,
                config: RwLock::new(config),
                source,
                cursor,
                negotiator: CertificateTrustNegotiator::new(trust_store),
                store_factory,
                working: AtomicBool::new(false),
                worker: Mutex::new(None),
                control: Mutex::new(()),
            }),
        }
    }

    /// Service persisting to `db` and uploading over IMAP
    pub fn with_database(config: BackupConfig, source: Arc<dyn MessageSource>, db: Database) -> Self {
        let db = Arc::new(db);
        let factory: StoreFactory = Arc::new(|| Box::new(ImapStore::new()) as Box<dyn MailStore>);
        Self::new(config, source, db.clone(), db, factory)
    }

    // ========================================================================
    // Trigger interface
    // ========================================================================

    /// Start a backup run on the worker thread.
    ///
    /// `skip_existing` is only honoured on the very first sync: it marks every
    /// local message as already backed up without uploading anything.
    pub fn start_sync(&self, skip_existing: bool) -> StartOutcome {
        let inner = &self.inner;
        // A cancel must not land between claiming `working` and clearing the
        // previous run's cancel flag.
        let _control = lock(&inner.control);

        if inner
            .working
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::info!("Sync already running, rejecting start request");
            return StartOutcome::Rejected(RejectReason::Busy);
        }

        let config = self.config();
        if !config.account.has_credentials() {
            inner.working.store(false, Ordering::SeqCst);
            log::warn!("Sync requested without login credentials");
            return StartOutcome::Rejected(RejectReason::MissingCredentials);
        }
        if let Err(errors) = config.validate() {
            inner.working.store(false, Ordering::SeqCst);
            log::warn!("Sync requested with invalid configuration: {:?}", errors);
            return StartOutcome::Rejected(RejectReason::InvalidConfig(errors));
        }

        let skip = skip_existing && self.first_sync_or_false();

        // The previous worker has already cleared `working`, so this join is short.
        if let Some(previous) = lock(&inner.worker).take() {
            if previous.join().is_err() {
                log::warn!("Previous sync worker panicked");
            }
        }

        inner.machine.clear_cancel();
        let run = SyncRun::new(
            config,
            skip,
            (inner.store_factory)(),
            inner.source.clone(),
            inner.cursor.clone(),
            inner.negotiator.clone(),
        );

        let guard = WorkingGuard(inner.clone());
        let spawned = thread::Builder::new()
            .name("sms-backup-sync".to_string())
            .spawn(move || {
                let final_state = guard.0.machine.run(run);
                log::debug!("Sync worker exiting in state {}", final_state);
                drop(guard);
            });

        match spawned {
            Ok(handle) => {
                *lock(&inner.worker) = Some(handle);
                log::info!("Sync started (skip existing: {})", skip);
                StartOutcome::Accepted
            }
            Err(e) => {
                log::error!("Failed to spawn sync worker: {}", e);
                inner.working.store(false, Ordering::SeqCst);
                StartOutcome::Rejected(RejectReason::WorkerUnavailable(e.to_string()))
            }
        }
    }

    /// Ask the running backup to stop. Ignored when idle.
    pub fn cancel(&self) {
        let _control = lock(&self.inner.control);
        if self.is_working() {
            self.inner.machine.request_cancel();
        }
    }

    /// True from an accepted start until the terminal state has been delivered
    pub fn is_working(&self) -> bool {
        self.inner.working.load(Ordering::SeqCst)
    }

    /// Block until the current worker, if any, has finished. Must not be called
    /// from an observer callback.
    pub fn wait_for_completion(&self) {
        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("Sync worker panicked");
            }
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn register_observer(&self, observer: Arc<dyn StateObserver>) {
        self.inner.broadcaster.register(observer);
    }

    pub fn unregister_observer(&self) {
        self.inner.broadcaster.unregister();
    }

    pub fn state(&self) -> SyncState {
        self.inner.machine.state()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    pub fn status(&self, change: StateChange) -> StatusReport {
        let max_items = self.config().max_items_per_sync;
        let last_sync = self.last_sync().unwrap_or_else(|e| {
            log::warn!("Failed to read last sync time: {}", e);
            None
        });
        describe(change, &self.progress(), max_items, last_sync)
    }

    // ========================================================================
    // Certificate trust
    // ========================================================================

    pub fn pending_certificate(&self) -> Option<CertificateChain> {
        self.inner.machine.pending_certificate()
    }

    /// Prompt text for the pending certificate
    pub fn certificate_summary(&self) -> Option<String> {
        let chain = self.pending_certificate()?;
        Some(summarize(&chain, &self.config().account.expected_hosts()))
    }

    pub fn resolve_trust(&self, decision: TrustDecision) -> SyncResult<()> {
        self.inner.machine.resolve_trust(decision)
    }

    // ========================================================================
    // Configuration and history
    // ========================================================================

    pub fn config(&self) -> BackupConfig {
        match self.inner.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Takes effect on the next run
    pub fn update_config(&self, config: BackupConfig) {
        match self.inner.config.write() {
            Ok(mut slot) => *slot = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub fn is_first_sync(&self) -> DbResult<bool> {
        Ok(self.inner.cursor.watermark()?.is_none())
    }

    pub fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.inner.cursor.last_sync()
    }

    fn first_sync_or_false(&self) -> bool {
        match self.is_first_sync() {
            Ok(first) => {
                if !first {
                    log::info!("Not the first sync, ignoring skip request");
                }
                first
            }
            Err(e) => {
                log::warn!("Cannot determine whether this is the first sync: {}", e);
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
