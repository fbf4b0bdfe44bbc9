//! # Resource Lock Manager
//!
//! Time-boxed mutual exclusion on a shared browser profile. Acquire never waits:
//! it either takes the lock, reclaims one whose hold is older than the expiry
//! window, or fails with [`OrchestratorError::ResourceInUse`].
//!
//! Release does not check ownership. A release by someone other than the recorded
//! holder still clears the lock and is logged.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{ExecutionStore, LockAttempt, LockRelease};
use crate::error::{OrchestratorError, Result};
use crate::models::{LockGrant, LockState};

#[derive(Clone)]
pub struct ResourceLockManager {
    store: Arc<dyn ExecutionStore>,
    expiry: Duration,
}

impl std::fmt::Debug for ResourceLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLockManager")
            .field("expiry_seconds", &self.expiry.num_seconds())
            .finish()
    }
}

impl ResourceLockManager {
    pub fn new(store: Arc<dyn ExecutionStore>, expiry: Duration) -> Self {
        Self { store, expiry }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Take the profile lock for `execution_id` running on `machine_id`.
    ///
    /// An execution that already holds the lock gets its existing grant back.
    pub async fn acquire(
        &self,
        profile_id: Uuid,
        machine_id: Uuid,
        execution_id: Uuid,
    ) -> Result<LockGrant> {
        let profile = self
            .store
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Profile", profile_id))?;

        if let LockState::Held {
            machine_id: holder,
            since,
        } = profile.lock_state()
        {
            if profile.locked_by_execution_id == Some(execution_id) {
                return Ok(LockGrant {
                    profile_id,
                    machine_id: holder,
                    execution_id,
                    acquired_at: since,
                    reclaimed_from: None,
                });
            }
        }

        let attempt = self
            .store
            .try_acquire_profile_lock(profile_id, machine_id, execution_id, Utc::now(), self.expiry)
            .await?;

        match attempt {
            LockAttempt::Acquired {
                acquired_at,
                reclaimed_from,
            } => {
                if let Some(previous) = reclaimed_from {
                    warn!(
                        profile_id = %profile_id,
                        previous_holder = %previous,
                        machine_id = %machine_id,
                        execution_id = %execution_id,
                        "⏰ LOCK: Reclaimed expired profile lock"
                    );
                } else {
                    info!(
                        profile_id = %profile_id,
                        machine_id = %machine_id,
                        execution_id = %execution_id,
                        "🔒 LOCK: Profile lock acquired"
                    );
                }
                Ok(LockGrant {
                    profile_id,
                    machine_id,
                    execution_id,
                    acquired_at,
                    reclaimed_from,
                })
            }
            LockAttempt::Held { holder, since } => {
                info!(
                    profile_id = %profile_id,
                    holder = %holder,
                    held_since = %since,
                    execution_id = %execution_id,
                    "⛔ LOCK: Profile already in use"
                );
                Err(OrchestratorError::ResourceInUse { profile_id, holder })
            }
        }
    }

    /// Clear the profile lock on behalf of `execution_id`
    pub async fn release(&self, profile_id: Uuid, execution_id: Uuid) -> Result<LockRelease> {
        let released = self
            .store
            .release_profile_lock(profile_id, Utc::now())
            .await?;

        match released.previous_execution {
            Some(holder) if holder == execution_id => {
                info!(
                    profile_id = %profile_id,
                    execution_id = %execution_id,
                    "🔓 LOCK: Profile lock released"
                );
            }
            previous => {
                warn!(
                    profile_id = %profile_id,
                    execution_id = %execution_id,
                    recorded_holder = ?previous,
                    "⚠️ LOCK: Profile lock released by an execution that was not the recorded holder"
                );
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryExecutionStore;
    use crate::models::Profile;

    fn setup() -> (Arc<InMemoryExecutionStore>, ResourceLockManager, Uuid) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let profile_id = Uuid::new_v4();
        store.upsert_profile(Profile::new(profile_id, "shared"));
        let manager = ResourceLockManager::new(store.clone(), Duration::hours(1));
        (store, manager, profile_id)
    }

    #[tokio::test]
    async fn test_acquire_free_then_contended() {
        let (_store, manager, profile_id) = setup();
        let (m1, m2) = (Uuid::new_v4(), Uuid::new_v4());

        let grant = manager.acquire(profile_id, m1, Uuid::new_v4()).await.unwrap();
        assert_eq!(grant.machine_id, m1);
        assert!(grant.reclaimed_from.is_none());

        let err = manager
            .acquire(profile_id, m2, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceInUse { holder, .. } if holder == m1));
    }

    #[tokio::test]
    async fn test_reacquire_by_same_execution() {
        let (_store, manager, profile_id) = setup();
        let (machine, execution) = (Uuid::new_v4(), Uuid::new_v4());

        let first = manager.acquire(profile_id, machine, execution).await.unwrap();
        let second = manager.acquire(profile_id, machine, execution).await.unwrap();
        assert_eq!(first.acquired_at, second.acquired_at);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (store, manager, profile_id) = setup();
        let stale_holder = Uuid::new_v4();
        let mut profile = Profile::new(profile_id, "shared");
        profile.locked_by_machine_id = Some(stale_holder);
        profile.locked_by_execution_id = Some(Uuid::new_v4());
        profile.lock_acquired_at = Some(Utc::now() - Duration::minutes(61));
        store.upsert_profile(profile);

        let machine = Uuid::new_v4();
        let grant = manager
            .acquire(profile_id, machine, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(grant.reclaimed_from, Some(stale_holder));
        assert_eq!(grant.machine_id, machine);
    }

    #[tokio::test]
    async fn test_release_is_permissive() {
        let (store, manager, profile_id) = setup();
        let holder_execution = Uuid::new_v4();
        manager
            .acquire(profile_id, Uuid::new_v4(), holder_execution)
            .await
            .unwrap();

        let released = manager.release(profile_id, Uuid::new_v4()).await.unwrap();
        assert_eq!(released.previous_execution, Some(holder_execution));

        let profile = store.get_profile(profile_id).await.unwrap().unwrap();
        assert!(profile.locked_by_machine_id.is_none());
        assert!(profile.lock_released_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let (_store, manager, _) = setup();
        let err = manager
            .acquire(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { entity: "Profile", .. }));
    }
}
