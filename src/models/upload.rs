use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file a user uploaded for one input slot of one step.
///
/// Keyed by `(user_id, step_id, slot)`; a later upload for the same key replaces the
/// earlier one. Associations expire so stale uploads are not fed into new runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAssociation {
    pub user_id: Uuid,
    pub step_id: String,
    pub slot: i32,
    pub file_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadAssociation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUploadAssociation {
    pub user_id: Uuid,
    pub step_id: String,
    pub slot: i32,
    pub file_id: String,
}
