//! # Upload Registry
//!
//! Maps `(user, step, slot)` to an uploaded file id. The store holds the durable
//! association; a `DashMap` in front of it answers repeated lookups for the same
//! step. A cache miss or stale entry always goes back to the store, so losing the
//! cache loses nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::database::ExecutionStore;
use crate::error::Result;
use crate::models::{NewUploadAssociation, UploadAssociation};

#[derive(Debug, Clone)]
struct CachedUploads {
    file_ids: Vec<String>,
    cached_at: Instant,
    /// Earliest association expiry among the cached entries
    expires_at: Option<DateTime<Utc>>,
}

impl CachedUploads {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.cached_at.elapsed() < ttl && self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct UploadRegistry {
    store: Arc<dyn ExecutionStore>,
    cache: DashMap<(Uuid, String), CachedUploads>,
    cache_ttl: Duration,
    association_ttl: chrono::Duration,
}

impl std::fmt::Debug for UploadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRegistry")
            .field("cached_steps", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl UploadRegistry {
    pub fn new(store: Arc<dyn ExecutionStore>, config: &UploadConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            cache_ttl: config.cache_ttl(),
            association_ttl: config.association_ttl(),
        }
    }

    /// Record (or replace) the file uploaded into `slot` of a step
    pub async fn register_upload(
        &self,
        user_id: Uuid,
        step_id: &str,
        slot: i32,
        file_id: &str,
    ) -> Result<UploadAssociation> {
        let upload = NewUploadAssociation {
            user_id,
            step_id: step_id.to_string(),
            slot,
            file_id: file_id.to_string(),
        };
        let association = self
            .store
            .upsert_upload(&upload, Utc::now(), self.association_ttl)
            .await?;

        self.invalidate(user_id, step_id);
        debug!(
            user_id = %user_id,
            step_id = step_id,
            slot = slot,
            file_id = file_id,
            "📎 UPLOADS: Association recorded"
        );
        Ok(association)
    }

    /// File ids uploaded for a step, ordered by slot
    pub async fn files_for_step(&self, user_id: Uuid, step_id: &str) -> Result<Vec<String>> {
        let key = (user_id, step_id.to_string());
        let now = Utc::now();

        if let Some(entry) = self.cache.get(&key) {
            if entry.is_fresh(self.cache_ttl, now) {
                return Ok(entry.file_ids.clone());
            }
        }

        let associations = self.store.list_uploads(user_id, step_id, now).await?;
        let cached = CachedUploads {
            file_ids: associations.iter().map(|a| a.file_id.clone()).collect(),
            cached_at: Instant::now(),
            expires_at: associations.iter().map(|a| a.expires_at).min(),
        };
        let file_ids = cached.file_ids.clone();
        self.cache.insert(key, cached);
        Ok(file_ids)
    }

    pub fn invalidate(&self, user_id: Uuid, step_id: &str) {
        self.cache.remove(&(user_id, step_id.to_string()));
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}
