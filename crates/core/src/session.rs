use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::referrer::UrlDescriptor;

/// One record per tab per session; persisted under the tab-scoped
/// `metadata` key and posted to the collector at session end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub session_id: String,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    /// Milliseconds; set at termination.
    pub session_duration: Option<i64>,
    pub user_agent: String,
    pub location: Option<serde_json::Value>,
    pub language: String,
    pub referrer: Option<UrlDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_history: Vec<String>,
}

impl SessionMetadata {
    pub fn finalize_duration(&mut self, now: DateTime<Utc>) -> i64 {
        let duration = (now - self.start_time).num_milliseconds().max(0);
        self.session_duration = Some(duration);
        duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Active,
    Terminated,
}
