use std::{
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{events::RegistrationHandle, host::DomEvent};

/// One observed occurrence of a registered event type.
pub struct CapturedEvent {
    pub event_type: String,
    /// Back-reference to the native event; never serialized.
    pub event: Rc<DomEvent>,
    pub handle: RegistrationHandle,
    pub captured_at: DateTime<Utc>,
    /// Position in the page-wide capture order.
    pub seq: u64,
}

impl CapturedEvent {
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            event_type: self.event_type.clone(),
            captured_at: self.captured_at,
            seq: self.seq,
        }
    }
}

impl fmt::Debug for CapturedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedEvent")
            .field("event_type", &self.event_type)
            .field("captured_at", &self.captured_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a [`CapturedEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    #[serde(rename = "type")]
    pub event_type: String,
    pub captured_at: DateTime<Utc>,
    pub seq: u64,
}

/// Append-only for the life of the page.
#[derive(Debug, Clone, Default)]
pub struct CapturedEvents {
    by_type: HashMap<String, Vec<Rc<CapturedEvent>>>,
    chronological: Vec<Rc<CapturedEvent>>,
}

impl CapturedEvents {
    pub(crate) fn record(&mut self, event: Rc<CapturedEvent>) {
        self.by_type
            .entry(event.event_type.clone())
            .or_default()
            .push(Rc::clone(&event));
        self.chronological.push(event);
    }

    pub fn of_type(&self, event_type: &str) -> &[Rc<CapturedEvent>] {
        self.by_type
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn chronological(&self) -> &[Rc<CapturedEvent>] {
        &self.chronological
    }

    /// Captured types, in order of first occurrence.
    pub fn event_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.chronological
            .iter()
            .map(|e| e.event_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chronological.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chronological.is_empty()
    }

    pub fn summaries(&self) -> Vec<EventSummary> {
        self.chronological.iter().map(|e| e.summary()).collect()
    }
}
