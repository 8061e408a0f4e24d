use std::{
    cell::RefCell,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use rand::{RngCore, SeedableRng, rngs::SmallRng};
use tracing::{debug, warn};
use uuid::{Builder, Uuid};

use crate::{
    error::{Result, TrackerError},
    host::Storage,
    session::SessionMetadata,
};

/// Tab-scoped key holding the full serialized session record.
pub const METADATA_KEY: &str = "metadata";
/// Origin-scoped key; outlives the session.
pub const USER_ID_KEY: &str = "userId";
/// Origin-scoped key; outlives the session.
pub const LAST_ACTIVITY_KEY: &str = "lastActivityTime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// Platform CSPRNG.
    Secure,
    /// Clock-seeded PRNG for hosts without a secure random primitive.
    Pseudo,
}

thread_local! {
    static FALLBACK_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(clock_seed()));
}

fn clock_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ u64::from(std::process::id()).rotate_left(32)
}

/// Returns a v4-shaped UUID string from either source.
pub fn generate_session_id(source: IdSource) -> String {
    let uuid = match source {
        IdSource::Secure => Uuid::new_v4(),
        IdSource::Pseudo => {
            let mut bytes = [0u8; 16];
            FALLBACK_RNG.with(|rng| rng.borrow_mut().fill_bytes(&mut bytes));
            Builder::from_random_bytes(bytes).into_uuid()
        }
    };
    uuid.to_string()
}

/// The trimmed id, or `InvalidUserId` for non-strings and blank strings.
pub fn validate_user_id(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_owned()),
        serde_json::Value::String(_) => Err(TrackerError::InvalidUserId {
            reason: "blank string".to_owned(),
        }),
        other => Err(TrackerError::InvalidUserId {
            reason: format!("expected a string, got {other}"),
        }),
    }
}

pub struct IdentityStore {
    session_storage: Rc<dyn Storage>,
    local_storage: Rc<dyn Storage>,
    id_source: IdSource,
}

impl IdentityStore {
    pub fn new(
        session_storage: Rc<dyn Storage>,
        local_storage: Rc<dyn Storage>,
        id_source: IdSource,
    ) -> Self {
        Self {
            session_storage,
            local_storage,
            id_source,
        }
    }

    pub fn generate_session_id(&self) -> String {
        generate_session_id(self.id_source)
    }

    /// Reads the tab-scoped record. Absent, unreadable and unparsable all
    /// come back as `None`.
    pub fn restore(&self) -> Option<SessionMetadata> {
        let raw = match self.session_storage.get_item(METADATA_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "session storage unavailable, starting a fresh session");
                return None;
            }
        };

        match serde_json::from_str::<SessionMetadata>(&raw) {
            Ok(metadata) => {
                debug!(session_id = %metadata.session_id, "restored session metadata");
                Some(metadata)
            }
            Err(e) => {
                warn!(error = %e, "discarding unparsable session metadata");
                None
            }
        }
    }

    pub fn persist(&self, metadata: &SessionMetadata) -> Result<()> {
        let raw = serde_json::to_string(metadata)?;
        self.session_storage.set_item(METADATA_KEY, &raw)
    }

    /// Accepts only a non-empty trimmed string. On failure nothing changes.
    pub fn set_user_id(
        &self,
        metadata: &mut SessionMetadata,
        value: &serde_json::Value,
    ) -> Result<()> {
        let id = validate_user_id(value)?;
        metadata.user_id = Some(id.clone());
        self.local_storage.set_item(USER_ID_KEY, &id)
    }

    pub fn stored_user_id(&self) -> Option<String> {
        self.local_storage
            .get_item(USER_ID_KEY)
            .inspect_err(|e| warn!(error = %e, "could not read stored user id"))
            .ok()
            .flatten()
            .filter(|id| !id.trim().is_empty())
    }

    pub fn last_activity_time(&self) -> Option<DateTime<Utc>> {
        let raw = self
            .local_storage
            .get_item(LAST_ACTIVITY_KEY)
            .inspect_err(|e| warn!(error = %e, "could not read last activity time"))
            .ok()
            .flatten()?;

        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .inspect_err(|e| warn!(error = %e, raw = %raw, "ignoring malformed last activity time"))
            .ok()
    }

    pub fn record_activity(&self, at: DateTime<Utc>) -> Result<()> {
        self.local_storage
            .set_item(LAST_ACTIVITY_KEY, &at.to_rfc3339())
    }
}
