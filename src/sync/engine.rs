//! Sync State Machine - Drives one backup run
//!
//! A run moves IDLE → CALC → LOGIN → SYNC → IDLE, or ends in AUTH_FAILED,
//! GENERAL_ERROR or CANCELED. An untrusted server certificate suspends the run
//! in MISSING_CERTIFICATE until a trust decision (or a cancel) arrives.
//!
//! Every transition is delivered through the `StateChangeBroadcaster`, and each
//! uploaded item re-notifies SYNC → SYNC so observers can refresh counters.

use super::broadcast::StateChangeBroadcaster;
use super::models::{ErrorDescriptor, ErrorKind, SyncState, TrustDecision};
use super::progress::ProgressCounter;
use super::source::{BackupPosition, MessageSource, SourceError};
use super::trust::{CertificateChain, CertificateTrustNegotiator, TrustError, TrustOutcome};
use crate::db::{BackupCursor, DbError};
use crate::mail::{encode_message, BackupConfig, MailError, MailStore, SmsMessage, SortOrder};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub type SyncResult<T> = Result<T, SyncError>;

/// Inputs of one run, snapshotted when the run is started
pub struct SyncRun {
    config: BackupConfig,
    skip_existing: bool,
    store: Box<dyn MailStore>,
    source: Arc<dyn MessageSource>,
    cursor: Arc<dyn BackupCursor>,
    negotiator: CertificateTrustNegotiator,
}

impl SyncRun {
    pub fn new(
        config: BackupConfig,
        skip_existing: bool,
        store: Box<dyn MailStore>,
        source: Arc<dyn MessageSource>,
        cursor: Arc<dyn BackupCursor>,
        negotiator: CertificateTrustNegotiator,
    ) -> Self {
        Self {
            config,
            skip_existing,
            store,
            source,
            cursor,
            negotiator,
        }
    }
}

enum TrustSignal {
    Decision(TrustDecision),
    Cancel,
}

/// A run parked in MISSING_CERTIFICATE
struct Suspension {
    chain: CertificateChain,
    tx: mpsc::UnboundedSender<TrustSignal>,
}

pub struct SyncStateMachine {
    state: Mutex<SyncState>,
    progress: Arc<ProgressCounter>,
    broadcaster: Arc<StateChangeBroadcaster>,
    cancel_requested: AtomicBool,
    suspension: Mutex<Option<Suspension>>,
}

impl SyncStateMachine {
    pub fn new(progress: Arc<ProgressCounter>, broadcaster: Arc<StateChangeBroadcaster>) -> Self {
        Self {
            state: Mutex::new(SyncState::Idle),
            progress,
            broadcaster,
            cancel_requested: AtomicBool::new(false),
            suspension: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.state)
    }

    pub fn progress(&self) -> &Arc<ProgressCounter> {
        &self.progress
    }

    // ========================================================================
    // Control (any thread)
    // ========================================================================

    /// Ask the running sync to stop at the next item boundary. A run waiting
    /// for a trust decision is woken and canceled.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(suspension) = lock(&self.suspension).as_ref() {
            let _ = suspension.tx.send(TrustSignal::Cancel);
        }
        log::info!("Sync cancel requested");
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_cancel(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
    }

    /// Chain awaiting a decision while in MISSING_CERTIFICATE
    pub fn pending_certificate(&self) -> Option<CertificateChain> {
        lock(&self.suspension).as_ref().map(|s| s.chain.clone())
    }

    /// Deliver the decision for the pending certificate. Exactly one decision is
    /// accepted per suspension.
    pub fn resolve_trust(&self, decision: TrustDecision) -> SyncResult<()> {
        let mut slot = lock(&self.suspension);
        let suspension = slot.take().ok_or(SyncError::NoPendingDecision)?;

        if let TrustDecision::Accept(index) = decision {
            if index >= suspension.chain.certificates.len() {
                *slot = Some(suspension);
                return Err(TrustError::NoSuchCertificate(index).into());
            }
        }

        let _ = suspension.tx.send(TrustSignal::Decision(decision));
        Ok(())
    }

    // ========================================================================
    // Run (worker thread)
    // ========================================================================

    /// Execute `run` to a terminal state and return it. Blocks the calling thread.
    pub fn run(&self, mut run: SyncRun) -> SyncState {
        self.progress.reset(0);
        self.transition(SyncState::Calc);

        let result = self.execute(&mut run);

        if let Err(e) = run.store.logout() {
            log::warn!("Logout after sync failed: {}", e);
        }

        let final_state = match result {
            Ok(()) => {
                let (synced, total) = self.progress.counts();
                log::info!("Sync finished: {} of {} messages backed up", synced, total);
                SyncState::Idle
            }
            Err(SyncError::Canceled) => {
                let (synced, total) = self.progress.counts();
                log::info!("Sync canceled after {} of {} messages", synced, total);
                SyncState::Canceled
            }
            Err(e) => {
                let descriptor = e.descriptor();
                log::error!("Sync failed: {}", descriptor);
                let state = if descriptor.kind == ErrorKind::AuthenticationFailed {
                    SyncState::AuthFailed
                } else {
                    SyncState::GeneralError
                };
                self.progress.set_error(descriptor);
                state
            }
        };

        self.transition(final_state);
        final_state
    }

    fn execute(&self, run: &mut SyncRun) -> SyncResult<()> {
        // CALC
        if run.skip_existing {
            if let Some(newest) = run.source.newest()? {
                run.cursor.advance_watermark(newest)?;
                log::info!("Skipped existing messages up to {}", newest.date);
            }
            run.cursor.set_last_sync(Utc::now())?;
            return Ok(());
        }

        let limit = run.config.max_items_per_sync as usize;
        let watermark = run.cursor.watermark()?;
        let ahead: BTreeSet<BackupPosition> = run.cursor.uploaded_ahead()?.into_iter().collect();

        // The batch is always the oldest pending window; the sort order only
        // decides the upload order inside it.
        let candidates = run.source.pending(watermark, limit + ahead.len())?;
        let mut items: Vec<SmsMessage> = candidates
            .iter()
            .filter(|sms| !ahead.contains(&BackupPosition::of(sms)))
            .take(limit)
            .cloned()
            .collect();
        if run.config.sort == SortOrder::NewestFirst {
            items.reverse();
        }
        let mut tracker = WatermarkTracker::new(candidates.iter().map(BackupPosition::of).collect(), ahead);

        self.progress.reset(items.len() as u32);
        self.check_cancel()?;

        if items.is_empty() {
            log::info!("No new messages to back up");
            run.cursor.set_last_sync(Utc::now())?;
            return Ok(());
        }

        // LOGIN
        self.transition(SyncState::Login);
        self.login(run)?;

        // SYNC
        self.transition(SyncState::Sync);
        let owner = run.config.owner_address();
        let folder = run.config.account.folder.clone();
        let total = items.len();

        for (index, sms) in items.iter().enumerate() {
            self.check_cancel()?;

            let message = encode_message(sms, &owner, Utc::now())?;
            run.store.append(&folder, &message)?;

            let position = BackupPosition::of(sms);
            match tracker.complete(position) {
                Some(watermark) => run.cursor.advance_watermark(watermark)?,
                None => run.cursor.record_uploaded_ahead(position)?,
            }
            self.progress.advance(1);

            log::debug!("Backed up message {} ({}/{})", sms.id, index + 1, total);
            self.broadcaster.notify(SyncState::Sync, SyncState::Sync);
        }

        run.cursor.set_last_sync(Utc::now())?;
        Ok(())
    }

    fn login(&self, run: &mut SyncRun) -> SyncResult<()> {
        let account = run.config.account.clone();
        let mut retried_trusted = false;

        loop {
            self.check_cancel()?;
            let pinned = run.negotiator.pinned(&account.host, account.port)?;

            let chain = match run.store.connect(&account, pinned.as_ref()) {
                Ok(()) => break,
                Err(MailError::UntrustedCertificate(chain)) => chain,
                Err(e) => return Err(e.into()),
            };

            match run.negotiator.evaluate(chain)? {
                TrustOutcome::Trusted if !retried_trusted => {
                    retried_trusted = true;
                }
                TrustOutcome::Trusted => {
                    return Err(MailError::Connection(format!(
                        "Server {}:{} refused a trusted certificate",
                        account.host, account.port
                    ))
                    .into());
                }
                TrustOutcome::Untrusted(chain) => match self.await_trust_decision(chain.clone())? {
                    TrustDecision::Accept(index) => {
                        run.negotiator.accept(&chain, index)?;
                        self.transition(SyncState::Login);
                    }
                    TrustDecision::Reject => {
                        run.negotiator.reject(&chain);
                        return Err(SyncError::Canceled);
                    }
                },
            }
        }

        self.check_cancel()?;
        run.store.login(&account)?;
        run.store.ensure_folder(&account.folder)?;
        log::info!("Logged in to {}:{}", account.host, account.port);
        Ok(())
    }

    /// Park the worker until a trust decision or a cancel arrives. No timeout.
    fn await_trust_decision(&self, chain: CertificateChain) -> SyncResult<TrustDecision> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        log::warn!(
            "Untrusted certificate offered by {}:{}, waiting for a decision",
            chain.host,
            chain.port
        );

        lock(&self.suspension).replace(Suspension { chain, tx });
        if self.is_cancel_requested() {
            lock(&self.suspension).take();
            return Err(SyncError::Canceled);
        }

        self.transition(SyncState::MissingCertificate);
        let signal = rx.blocking_recv();
        lock(&self.suspension).take();

        match signal {
            Some(TrustSignal::Decision(decision)) => Ok(decision),
            Some(TrustSignal::Cancel) | None => Err(SyncError::Canceled),
        }
    }

    fn check_cancel(&self) -> SyncResult<()> {
        if self.is_cancel_requested() {
            Err(SyncError::Canceled)
        } else {
            Ok(())
        }
    }

    fn transition(&self, new: SyncState) {
        let old = std::mem::replace(&mut *lock(&self.state), new);
        log::info!("Sync state {} -> {}", old, new);
        self.broadcaster.notify(old, new);
    }
}

/// Tracks the longest fully backed-up prefix of the pending sequence
struct WatermarkTracker {
    order: Vec<BackupPosition>,
    next: usize,
    done: BTreeSet<BackupPosition>,
}

impl WatermarkTracker {
    fn new(order: Vec<BackupPosition>, done: BTreeSet<BackupPosition>) -> Self {
        Self { order, next: 0, done }
    }

    /// Mark `position` backed up. Returns the new watermark when the prefix grew.
    fn complete(&mut self, position: BackupPosition) -> Option<BackupPosition> {
        self.done.insert(position);

        let mut advanced = None;
        while let Some(next) = self.order.get(self.next) {
            if !self.done.contains(next) {
                break;
            }
            advanced = Some(*next);
            self.next += 1;
        }
        advanced
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Sync mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Mail(#[from] MailError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DbError),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Trust(#[from] TrustError),

    #[error("No certificate decision is pending")]
    NoPendingDecision,

    #[error("Sync canceled")]
    Canceled,
}

impl SyncError {
    pub fn descriptor(&self) -> ErrorDescriptor {
        let kind = match self {
            SyncError::Mail(MailError::Authentication(_)) => ErrorKind::AuthenticationFailed,
            SyncError::Mail(MailError::UntrustedCertificate(_)) => ErrorKind::UntrustedCertificate,
            SyncError::Canceled => ErrorKind::Canceled,
            _ => ErrorKind::TransportOrProtocol,
        };
        ErrorDescriptor::new(kind, self.to_string())
    }
}
