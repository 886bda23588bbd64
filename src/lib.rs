//! # SMS Backup
//!
//! Backs up a device's SMS store into a dedicated folder of an IMAP mailbox.
//!
//! The crate is organised like this:
//! - `mail`: connection settings, the `MailStore` seam with its IMAP adapter,
//!   and the SMS to RFC 822 encoder
//! - `db`: SQLite persistence for the trust store, the backup watermark and settings
//! - `sync`: the sync engine (state machine, progress, observers, certificate trust)

pub mod db;
pub mod mail;
pub mod sync;

pub use db::{BackupCursor, Database, DbError, DbResult, TrustStore};
pub use mail::{AccountConnectionInfo, BackupConfig, ImapStore, MailError, MailStore, SecurityType, SortOrder};
pub use sync::{
    CertificateTrustNegotiator, ProgressCounter, StartOutcome, StateChangeBroadcaster,
    StateObserver, SyncError, SyncService, SyncState, SyncStateMachine,
};

/// Initialize `env_logger` output, honouring `RUST_LOG` (defaults to `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
