//! Ports through which the tracker reaches the page it is embedded in.
//!
//! Every browser facility the tracker touches sits behind one of these
//! traits: tab- and origin-scoped storage, event targets, the history
//! binding, page facts and the clock. [`crate::sim`] implements them in
//! memory.

pub mod signal;

use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use signal::{AbortController, AbortSignal};

/// Something listeners can be attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Window,
    Document,
    /// An element addressed by CSS selector.
    Element(String),
}

/// A native event as delivered by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct DomEvent {
    pub event_type: String,
    pub target: Target,
    pub detail: Option<serde_json::Value>,
}

impl DomEvent {
    pub fn new(event_type: impl Into<String>, target: Target) -> Self {
        Self {
            event_type: event_type.into(),
            target,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub type DomListener = Rc<dyn Fn(&Rc<DomEvent>)>;

#[derive(Clone, Default)]
pub struct ListenerOptions {
    pub capture: Option<bool>,
    pub once: bool,
    pub signal: Option<AbortSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub trait Storage {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

pub trait EventTargets {
    fn add_event_listener(
        &self,
        target: &Target,
        event_type: &str,
        listener: DomListener,
        options: &ListenerOptions,
    ) -> Result<ListenerId>;

    fn remove_event_listener(&self, target: &Target, event_type: &str, id: ListenerId);

    /// Whether `ListenerOptions::signal` is honoured natively.
    fn supports_abort_signal(&self) -> bool;
}

/// Arguments of a `pushState`/`replaceState` call, carried as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub state: serde_json::Value,
    pub title: String,
    pub url: Option<String>,
}

impl HistoryEntry {
    pub fn to(url: impl Into<String>) -> Self {
        Self {
            state: serde_json::Value::Null,
            title: String::new(),
            url: Some(url.into()),
        }
    }
}

pub trait HistoryApi {
    fn push_state(&self, entry: HistoryEntry);
    fn replace_state(&self, entry: HistoryEntry);
}

/// The page's `window.history` binding. Every caller goes through
/// `current()`, so replacing it affects existing and future callers alike.
pub trait HistorySlot {
    fn current(&self) -> Rc<dyn HistoryApi>;
    fn replace(&self, history: Rc<dyn HistoryApi>);
    /// Flags the page's history as intercepted. Returns whether it already was.
    fn mark_intercepted(&self) -> bool;
}

pub trait Page {
    fn location_href(&self) -> String;
    fn referrer(&self) -> Option<String>;
    fn user_agent(&self) -> String;
    fn language(&self) -> String;
    fn is_hidden(&self) -> bool;
    fn has_secure_random(&self) -> bool;

    fn hostname(&self) -> String {
        url::Url::parse(&self.location_href())
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_default()
    }

    fn pathname(&self) -> String {
        url::Url::parse(&self.location_href())
            .map(|u| u.path().to_owned())
            .unwrap_or_else(|_| "/".to_owned())
    }
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything the tracker needs from one page load.
#[derive(Clone)]
pub struct PageEnv {
    pub page: Rc<dyn Page>,
    pub session_storage: Rc<dyn Storage>,
    pub local_storage: Rc<dyn Storage>,
    pub events: Rc<dyn EventTargets>,
    pub history: Rc<dyn HistorySlot>,
    pub clock: Rc<dyn Clock>,
}
