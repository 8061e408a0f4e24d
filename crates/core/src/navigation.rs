//! Observes virtual page views: programmatic history mutation, browser
//! back/forward, and the `pushstate`/`replacestate` events a host page can
//! dispatch itself.

use std::{cell::Cell, rc::Rc};

use tracing::{debug, warn};

use crate::{
    events::{EventCaptureRegistry, ListenerSpec},
    host::{HistoryApi, HistoryEntry, HistorySlot, Target},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    Push,
    Replace,
    /// A window event: `popstate` or one of the host-dispatched signals.
    Event(&'static str),
}

pub const NAVIGATION_EVENTS: [&str; 3] = ["popstate", "pushstate", "replacestate"];

pub type NavigationHook = Rc<dyn Fn(NavigationKind)>;

/// Runs the platform's own implementation, then the hook.
struct InterceptedHistory {
    original: Rc<dyn HistoryApi>,
    on_navigate: NavigationHook,
}

impl HistoryApi for InterceptedHistory {
    fn push_state(&self, entry: HistoryEntry) {
        self.original.push_state(entry);
        (self.on_navigate)(NavigationKind::Push);
    }

    fn replace_state(&self, entry: HistoryEntry) {
        self.original.replace_state(entry);
        (self.on_navigate)(NavigationKind::Replace);
    }
}

#[derive(Default)]
pub struct NavigationObserver {
    installed: Cell<bool>,
}

impl NavigationObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the page's history binding and subscribes to the navigation
    /// events. The wrap is a global side effect on the page and is never
    /// undone. The page keeps its own intercepted flag, so a second observer
    /// on the same page only subscribes to the events and its hook does not
    /// see push or replace. A second call on one observer is a no-op
    /// returning `false`.
    pub fn install(
        &self,
        history: &dyn HistorySlot,
        registry: &EventCaptureRegistry,
        on_navigate: NavigationHook,
    ) -> bool {
        if self.installed.replace(true) {
            debug!("navigation interception already installed");
            return false;
        }

        if history.mark_intercepted() {
            warn!("page history already intercepted, subscribing to navigation events only");
        } else {
            history.replace(Rc::new(InterceptedHistory {
                original: history.current(),
                on_navigate: Rc::clone(&on_navigate),
            }));
        }

        for event_type in NAVIGATION_EVENTS {
            let hook = Rc::clone(&on_navigate);
            registry.register(ListenerSpec::maintenance(
                Target::Window,
                event_type,
                move |_| hook(NavigationKind::Event(event_type)),
            ));
        }

        debug!("navigation interception installed");
        true
    }
}
