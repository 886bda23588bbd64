//! Sync Data Models
//!
//! States, trigger outcomes, trust decisions and error descriptors shared by
//! the engine, the service front-end and observers.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Sync State
// ============================================================================

/// State of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    #[default]
    Idle,
    Calc,
    Login,
    Sync,
    AuthFailed,
    GeneralError,
    MissingCertificate,
    Canceled,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "IDLE",
            SyncState::Calc => "CALC",
            SyncState::Login => "LOGIN",
            SyncState::Sync => "SYNC",
            SyncState::AuthFailed => "AUTH_FAILED",
            SyncState::GeneralError => "GENERAL_ERROR",
            SyncState::MissingCertificate => "MISSING_CERTIFICATE",
            SyncState::Canceled => "CANCELED",
        }
    }

    /// States a run ends in
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::AuthFailed | SyncState::GeneralError | SyncState::Canceled
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncState::AuthFailed | SyncState::GeneralError)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub old: SyncState,
    pub new: SyncState,
}

// ============================================================================
// Trigger interface
// ============================================================================

/// Why a start request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    MissingCredentials,
    InvalidConfig(Vec<String>),
    WorkerUnavailable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Busy => f.write_str("busy"),
            RejectReason::MissingCredentials => f.write_str("missing credentials"),
            RejectReason::InvalidConfig(errors) => write!(f, "invalid configuration: {}", errors.join("; ")),
            RejectReason::WorkerUnavailable(reason) => write!(f, "worker unavailable: {}", reason),
        }
    }
}

/// Answer to a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl StartOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StartOutcome::Accepted)
    }
}

/// Answer to a MISSING_CERTIFICATE suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    /// Trust the certificate at this index of the offered chain
    Accept(usize),
    Reject,
}

// ============================================================================
// Errors as seen by observers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingCredentials,
    UntrustedCertificate,
    AuthenticationFailed,
    TransportOrProtocol,
    Canceled,
}

/// Last error of a run, kept in the progress counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
