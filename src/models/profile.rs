//! # Profile Resource Lock
//!
//! A profile is the shared, exclusively-lockable browser profile a script's steps run
//! against. The lock is nothing more than a nullable holder plus an acquisition
//! timestamp stored on the profile row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: Uuid,
    pub name: String,
    /// External account the profile is signed into
    pub account_ref: Option<String>,
    pub locked_by_machine_id: Option<Uuid>,
    pub locked_by_execution_id: Option<Uuid>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held {
        machine_id: Uuid,
        since: DateTime<Utc>,
    },
}

impl Profile {
    pub fn new(profile_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            profile_id,
            name: name.into(),
            account_ref: None,
            locked_by_machine_id: None,
            locked_by_execution_id: None,
            lock_acquired_at: None,
            lock_released_at: None,
        }
    }

    pub fn lock_state(&self) -> LockState {
        match self.locked_by_machine_id {
            // A holder without a timestamp is treated as held since the epoch, so it is always stale
            Some(machine_id) => LockState::Held {
                machine_id,
                since: self.lock_acquired_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            },
            None => LockState::Free,
        }
    }

    /// A hold strictly older than `expiry` is abandoned.
    pub fn is_lock_stale(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        match self.lock_state() {
            LockState::Held { since, .. } => now.signed_duration_since(since) > expiry,
            LockState::Free => false,
        }
    }
}

/// Proof of a successful acquire, bound to the execution that asked for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub profile_id: Uuid,
    pub machine_id: Uuid,
    pub execution_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    /// Previous holder whose expired lock was reclaimed, if any
    pub reclaimed_from: Option<Uuid>,
}
