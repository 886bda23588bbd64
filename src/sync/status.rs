//! Status presentation
//!
//! Maps a state transition plus the progress snapshot to what a status view
//! shows: a class, a detail line and an optional progress bar.

use super::models::{StateChange, SyncState};
use super::progress::ProgressSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Idle,
    Working,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatusDetail {
    NeverSynced,
    LastSync { at: DateTime<Utc> },
    Calculating,
    LoggingIn,
    Progress { synced: u32, total: u32 },
    /// The per-run cap was hit, more may be pending
    MaxPerSyncReached { synced: u32 },
    BackedUp { synced: u32 },
    NothingToSync,
    AuthFailure,
    Failed { message: String },
    MissingCertificate,
    CanceledAfter { synced: u32, total: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub class: StatusClass,
    pub detail: StatusDetail,
    /// `(value, max)`; `None` while the bar is indeterminate or hidden
    pub progress: Option<(u32, u32)>,
}

impl StatusReport {
    fn new(class: StatusClass, detail: StatusDetail) -> Self {
        Self {
            class,
            detail,
            progress: None,
        }
    }

    fn with_progress(mut self, value: u32, max: u32) -> Self {
        self.progress = Some((value, max));
        self
    }
}

pub fn describe(
    change: StateChange,
    progress: &ProgressSnapshot,
    max_items_per_sync: u32,
    last_sync: Option<DateTime<Utc>>,
) -> StatusReport {
    let (synced, total) = (progress.synced, progress.total);

    match change.new {
        SyncState::Idle if matches!(change.old, SyncState::Sync | SyncState::Calc) => {
            if synced == 0 {
                StatusReport::new(StatusClass::Done, StatusDetail::NothingToSync).with_progress(1, 1)
            } else if synced == max_items_per_sync {
                StatusReport::new(StatusClass::Done, StatusDetail::MaxPerSyncReached { synced })
                    .with_progress(synced, total)
            } else {
                StatusReport::new(StatusClass::Done, StatusDetail::BackedUp { synced })
                    .with_progress(synced, total)
            }
        }
        SyncState::Idle => match last_sync {
            Some(at) => StatusReport::new(StatusClass::Idle, StatusDetail::LastSync { at }),
            None => StatusReport::new(StatusClass::Idle, StatusDetail::NeverSynced),
        },
        SyncState::Calc => StatusReport::new(StatusClass::Working, StatusDetail::Calculating),
        SyncState::Login => StatusReport::new(StatusClass::Working, StatusDetail::LoggingIn),
        SyncState::Sync => StatusReport::new(StatusClass::Working, StatusDetail::Progress { synced, total })
            .with_progress(synced, total),
        SyncState::AuthFailed => StatusReport::new(StatusClass::Error, StatusDetail::AuthFailure),
        SyncState::GeneralError => {
            let message = progress
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Unknown error".to_string());
            StatusReport::new(StatusClass::Error, StatusDetail::Failed { message })
        }
        SyncState::MissingCertificate => StatusReport::new(StatusClass::Error, StatusDetail::MissingCertificate),
        SyncState::Canceled => StatusReport::new(StatusClass::Idle, StatusDetail::CanceledAfter { synced, total }),
    }
}
