//! # SMS Backup - Mail Module
//!
//! Everything the sync engine needs from the remote side: connection settings,
//! the `MailStore` primitives, an IMAP implementation of them, and the encoder
//! that turns an SMS into a mail item.

pub mod config;
pub mod imap;
pub mod message;

use crate::sync::trust::{CertificateChain, CertificateRecord};

// Re-export commonly used types
pub use config::{AccountConnectionInfo, BackupConfig, SecurityType, SortOrder};
pub use imap::ImapStore;
pub use message::{encode_message, SmsKind, SmsMessage};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Untrusted certificate offered by {}:{}", .0.host, .0.port)]
    UntrustedCertificate(CertificateChain),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Message error: {0}")]
    Message(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote mail store primitives, sequenced by the sync engine.
///
/// Calls block the calling thread. An implementation is used by one run at a
/// time and is dropped when the run ends.
pub trait MailStore: Send {
    /// Open a TLS-protected connection to the store.
    ///
    /// `pinned` is the certificate previously accepted for this host/port, if any.
    /// A peer certificate that fails platform verification and does not match
    /// `pinned` is reported as [`MailError::UntrustedCertificate`].
    fn connect(
        &mut self,
        account: &AccountConnectionInfo,
        pinned: Option<&CertificateRecord>,
    ) -> MailResult<()>;

    /// Authenticate the open connection.
    fn login(&mut self, account: &AccountConnectionInfo) -> MailResult<()>;

    /// Make sure `folder` exists, creating it when missing.
    fn ensure_folder(&mut self, folder: &str) -> MailResult<()>;

    /// Append one RFC 822 message to `folder`.
    fn append(&mut self, folder: &str, message: &[u8]) -> MailResult<()>;

    /// Close the session. Safe to call when not connected.
    fn logout(&mut self) -> MailResult<()>;
}
