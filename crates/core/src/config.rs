use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    beacon::{HttpTransport, Transport},
    error::{Result, TrackerError},
    events::CaptureListener,
    host::Target,
    identity::IdSource,
};

pub const DOMAIN_ENV: &str = "BOREA_DOMAIN";
pub const PORT_ENV: &str = "BOREA_PORT";
pub const DEFAULT_LOCAL_PORT: u16 = 8080;
pub const DEFAULT_ROUTE: &str = "postSession";

/// Where session beacons go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Production collector host, used over https.
    pub domain: String,
    /// Port of the collector when the page itself is served from loopback.
    pub local_port: u16,
    pub route: String,
}

impl CollectorConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            local_port: DEFAULT_LOCAL_PORT,
            route: DEFAULT_ROUTE.to_owned(),
        }
    }

    /// Reads `BOREA_DOMAIN` (required) and `BOREA_PORT` (optional).
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let domain = var(DOMAIN_ENV)
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| TrackerError::MissingCollectorConfig {
                env_var: DOMAIN_ENV.to_owned(),
            })?;

        let mut config = Self::new(domain);
        if let Some(port) = var(PORT_ENV) {
            config.local_port = port.parse().map_err(|_| TrackerError::InvalidOptions {
                reason: format!("{PORT_ENV} is not a port number: {port}"),
            })?;
        }
        Ok(config)
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }
}

/// Runtime options a host page may change at any time. Unknown keys are
/// rejected rather than silently kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TrackerOptions {
    /// Applied through the same validation as `Tracker::set_user_id`.
    pub user_id: Option<serde_json::Value>,
    /// Replaces the default event set when present.
    pub whitelist: Option<Vec<String>>,
    /// Removed from the enabled set after the whitelist is applied.
    pub blacklist: Vec<String>,
    /// Per-type target overrides; unlisted types go on the window.
    pub targets: BTreeMap<String, Target>,
    /// Send the beacon at session end.
    pub post_data: bool,
    /// Add captured event summaries to the beacon body.
    pub include_captured_events: bool,
    /// Record pathnames on virtual navigation.
    pub track_paths: bool,
    /// Run the session-end sequence as soon as the page becomes hidden.
    pub early_flush_on_hidden: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            whitelist: None,
            blacklist: Vec::new(),
            targets: BTreeMap::new(),
            post_data: true,
            include_captured_events: false,
            track_paths: false,
            early_flush_on_hidden: false,
        }
    }
}

impl TrackerOptions {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(TrackerError::InvalidOptions {
                reason: format!("expected a JSON object, got {value}"),
            });
        }
        serde_json::from_value(value).map_err(|e| TrackerError::InvalidOptions {
            reason: e.to_string(),
        })
    }

    /// Overlays the keys of `patch` onto these options.
    pub fn merged(&self, patch: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(patch) = patch else {
            return Err(TrackerError::InvalidOptions {
                reason: format!("expected a JSON object, got {patch}"),
            });
        };

        let mut current = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut current {
            fields.extend(patch);
        }
        Self::from_value(current)
    }
}

/// Fixed at attach time.
#[derive(Clone)]
pub struct TrackerConfig {
    pub collector: CollectorConfig,
    pub token: Option<String>,
    pub options: TrackerOptions,
    /// `None` asks the page whether a secure random primitive exists.
    pub id_source: Option<IdSource>,
    /// A restored session idle for longer than this starts over.
    pub inactivity_timeout: Option<Duration>,
    pub global_listener: Option<CaptureListener>,
    pub type_listeners: HashMap<String, CaptureListener>,
    pub transport: Arc<dyn Transport>,
}

impl TrackerConfig {
    pub fn new(collector: CollectorConfig) -> Self {
        Self {
            collector,
            token: None,
            options: TrackerOptions::default(),
            id_source: None,
            inactivity_timeout: None,
            global_listener: None,
            type_listeners: HashMap::new(),
            transport: Arc::new(HttpTransport::new()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_options(mut self, options: TrackerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_id_source(mut self, source: IdSource) -> Self {
        self.id_source = Some(source);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Called for every captured event, after any type-specific listener.
    pub fn on_event(mut self, listener: CaptureListener) -> Self {
        self.global_listener = Some(listener);
        self
    }

    pub fn on_event_type(mut self, event_type: impl Into<String>, listener: CaptureListener) -> Self {
        self.type_listeners.insert(event_type.into(), listener);
        self
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("collector", &self.collector)
            .field("token", &self.token)
            .field("options", &self.options)
            .field("id_source", &self.id_source)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("global_listener", &self.global_listener.is_some())
            .field("type_listeners", &self.type_listeners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
