use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sandbox::{SandboxSession, SandboxStatus};
use serde::Serialize;

/// Aggregate view over all live sandboxes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub active_sandboxes: usize,
    pub max_per_user: usize,
    /// Live sandbox count per user id.
    pub per_user: BTreeMap<String, usize>,
    pub sandboxes: Vec<SessionStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub id: String,
    pub user_id: String,
    pub status: SandboxStatus,
    pub age_secs: i64,
    pub idle_secs: i64,
}

impl ManagerStats {
    pub(crate) fn from_sessions(
        sessions: &[SandboxSession],
        max_per_user: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut per_user = BTreeMap::new();
        for session in sessions {
            *per_user.entry(session.user_id.clone()).or_insert(0) += 1;
        }
        let sandboxes = sessions
            .iter()
            .map(|s| SessionStats {
                id: s.id.clone(),
                user_id: s.user_id.clone(),
                status: s.status,
                age_secs: (now - s.created_at).num_seconds().max(0),
                idle_secs: (now - s.last_activity).num_seconds().max(0),
            })
            .collect();
        Self {
            active_sandboxes: sessions.len(),
            max_per_user,
            per_user,
            sandboxes,
        }
    }
}
