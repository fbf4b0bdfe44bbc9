use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A worker machine candidate with live telemetry.
///
/// Metrics are written by an external collector; any of them may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub machine_id: Uuid,
    pub name: String,
    pub online: bool,
    pub tunnel_url: Option<String>,
    pub running_job_count: Option<i64>,
    pub cpu_percent: Option<f64>,
    pub free_memory_gb: Option<f64>,
    /// Profiles provisioned on this machine
    #[serde(default)]
    pub profile_ids: Vec<Uuid>,
    pub metrics_updated_at: Option<DateTime<Utc>>,
}

impl Machine {
    pub fn has_reachable_tunnel(&self) -> bool {
        self.tunnel_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn has_profile(&self, profile_id: Uuid) -> bool {
        self.profile_ids.contains(&profile_id)
    }
}
