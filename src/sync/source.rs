//! Local message source
//!
//! The device's SMS store, as seen by the engine. Messages are ordered by
//! [`BackupPosition`], i.e. by date with the message id breaking ties.

use crate::mail::SmsMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("Message source error: {0}")]
pub struct SourceError(pub String);

/// Place of a message in backup order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupPosition {
    /// Milliseconds since the Unix epoch
    pub date: i64,
    pub id: i64,
}

impl BackupPosition {
    pub fn new(date: i64, id: i64) -> Self {
        Self { date, id }
    }

    pub fn of(sms: &SmsMessage) -> Self {
        Self::new(sms.date, sms.id)
    }
}

pub trait MessageSource: Send + Sync {
    /// Up to `limit` messages positioned strictly after `after` (all messages
    /// when `None`), in ascending position order.
    fn pending(&self, after: Option<BackupPosition>, limit: usize) -> Result<Vec<SmsMessage>, SourceError>;

    /// Position of the newest local message, if any
    fn newest(&self) -> Result<Option<BackupPosition>, SourceError>;
}
