//! Progress Counter
//!
//! `(synced, total)` is packed into one `AtomicU64` so observers always read a
//! consistent pair without taking a lock. The error slot is written at most
//! once per run and sits behind an `RwLock`.

use super::models::ErrorDescriptor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time view of the counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub synced: u32,
    pub total: u32,
    pub error: Option<ErrorDescriptor>,
}

#[derive(Debug, Default)]
pub struct ProgressCounter {
    pair: AtomicU64,
    error: RwLock<Option<ErrorDescriptor>>,
}

fn pack(synced: u32, total: u32) -> u64 {
    ((synced as u64) << 32) | total as u64
}

fn unpack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over at `(0, total)` and clear the error slot
    pub fn reset(&self, total: u32) {
        // Error first: a reader that sees the new pair must not see the old error.
        match self.error.write() {
            Ok(mut error) => *error = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.pair.store(pack(0, total), Ordering::SeqCst);
    }

    /// Add `n` transferred items. `synced` never exceeds `total`.
    pub fn advance(&self, n: u32) {
        let _ = self.pair.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            let (synced, total) = unpack(current);
            Some(pack(synced.saturating_add(n).min(total), total))
        });
    }

    pub fn set_error(&self, descriptor: ErrorDescriptor) {
        match self.error.write() {
            Ok(mut error) => *error = Some(descriptor),
            Err(poisoned) => *poisoned.into_inner() = Some(descriptor),
        }
    }

    pub fn counts(&self) -> (u32, u32) {
        unpack(self.pair.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let (synced, total) = self.counts();
        let error = match self.error.read() {
            Ok(error) => error.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ProgressSnapshot { synced, total, error }
    }
}
