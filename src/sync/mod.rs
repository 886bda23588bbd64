//! Sync Module - SMS backup to an IMAP folder
//!
//! Provides:
//! - The backup state machine and its worker-thread front-end
//! - Certificate trust negotiation for servers the platform does not trust
//! - A lock-free progress counter and a single-observer state broadcaster
//!
//! Architecture:
//! - One run at a time, executed on a dedicated worker thread
//! - Observers are notified synchronously on that thread, in transition order
//! - Progress is tracked by a (date, id) watermark that only moves forward

pub mod broadcast;
pub mod engine;
pub mod models;
pub mod progress;
pub mod service;
pub mod source;
pub mod status;
pub mod trust;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use broadcast::{ChannelObserver, StateChangeBroadcaster, StateObserver};
pub use engine::{SyncError, SyncResult, SyncRun, SyncStateMachine};
pub use models::{
    ErrorDescriptor, ErrorKind, RejectReason, StartOutcome, StateChange, SyncState, TrustDecision,
};
pub use progress::{ProgressCounter, ProgressSnapshot};
pub use service::{StoreFactory, SyncService};
pub use source::{BackupPosition, MessageSource, SourceError};
pub use status::{describe, StatusClass, StatusDetail, StatusReport};
pub use trust::{
    summarize, AltName, AltNames, CertificateChain, CertificateRecord, CertificateTrustNegotiator,
    TrustError, TrustOutcome,
};
