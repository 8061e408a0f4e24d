//! In-memory host: a deterministic stand-in for a browser tab.
//!
//! Drives the tracker under tests and under the `borea` simulator. Each
//! port mirrors the observable behavior of its browser counterpart closely
//! enough for the tracker's contracts to be exercised end to end.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::{
    beacon::Transport,
    error::{Result, TrackerError},
    host::{
        AbortSignal, Clock, DomEvent, DomListener, EventTargets, HistoryApi, HistoryEntry,
        HistorySlot, ListenerId, ListenerOptions, Page, PageEnv, Storage, SystemClock, Target,
    },
};

#[derive(Default)]
pub struct MemoryStorage {
    items: RefCell<BTreeMap<String, String>>,
    unavailable: Cell<bool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, as a browser does with storage disabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.unavailable.get() {
            return Err(TrackerError::StorageUnavailable {
                key: key.to_owned(),
                reason: "storage disabled".to_owned(),
            });
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.check(key)?;
        Ok(self.items.borrow().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check(key)?;
        self.items
            .borrow_mut()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.items.borrow_mut().remove(key);
        Ok(())
    }
}

struct ListenerSlot {
    id: ListenerId,
    target: Target,
    event_type: String,
    capture: bool,
    once: bool,
    listener: DomListener,
    signal: Option<AbortSignal>,
}

impl ListenerSlot {
    fn live(&self) -> bool {
        !self.signal.as_ref().is_some_and(AbortSignal::aborted)
    }
}

/// Listener table for window, document and elements of one page load.
pub struct SimulatedEventTargets {
    slots: RefCell<Vec<ListenerSlot>>,
    next_id: Cell<u64>,
    abort_signals: bool,
}

impl SimulatedEventTargets {
    /// `abort_signals` selects whether `ListenerOptions::signal` is honoured
    /// natively or left to the caller's own removal bookkeeping.
    pub fn new(abort_signals: bool) -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            abort_signals,
        }
    }

    pub fn listener_count(&self, target: &Target, event_type: &str) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|s| s.live() && &s.target == target && s.event_type == event_type)
            .count()
    }

    /// Delivers `event` to its target's listeners, capture-phase ones first.
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: DomEvent) -> usize {
        let event = Rc::new(event);
        self.prune_aborted();

        // Snapshot first: listeners may add or remove listeners while running.
        let mut batch: Vec<(bool, ListenerId, bool, DomListener)> = self
            .slots
            .borrow()
            .iter()
            .filter(|s| s.live() && s.target == event.target && s.event_type == event.event_type)
            .map(|s| (s.capture, s.id, s.once, Rc::clone(&s.listener)))
            .collect();
        batch.sort_by_key(|(capture, ..)| !*capture);

        trace!(event_type = %event.event_type, listeners = batch.len(), "dispatch");

        for (_, id, once, listener) in &batch {
            if *once {
                self.remove(*id);
            }
            listener(&event);
        }
        batch.len()
    }

    pub fn fire(&self, target: Target, event_type: &str) -> usize {
        self.dispatch(DomEvent::new(event_type, target))
    }

    fn remove(&self, id: ListenerId) {
        self.slots.borrow_mut().retain(|s| s.id != id);
    }

    /// Drops listeners whose signal has fired since they were added.
    fn prune_aborted(&self) {
        self.slots.borrow_mut().retain(ListenerSlot::live);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }
}

impl EventTargets for SimulatedEventTargets {
    fn add_event_listener(
        &self,
        target: &Target,
        event_type: &str,
        listener: DomListener,
        options: &ListenerOptions,
    ) -> Result<ListenerId> {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let signal = if self.abort_signals {
            options.signal.clone()
        } else {
            None
        };
        if signal.as_ref().is_some_and(AbortSignal::aborted) {
            return Ok(id);
        }

        self.prune_aborted();
        self.slots.borrow_mut().push(ListenerSlot {
            id,
            target: target.clone(),
            event_type: event_type.to_owned(),
            capture: options.capture.unwrap_or(false),
            once: options.once,
            listener,
            signal,
        });
        Ok(id)
    }

    fn remove_event_listener(&self, _target: &Target, _event_type: &str, id: ListenerId) {
        self.remove(id);
    }

    fn supports_abort_signal(&self) -> bool {
        self.abort_signals
    }
}

pub struct SimulatedPage {
    href: RefCell<String>,
    referrer: Option<String>,
    user_agent: String,
    language: String,
    hidden: Cell<bool>,
    secure_random: bool,
}

impl SimulatedPage {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: RefCell::new(href.into()),
            referrer: None,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) borea-sim".to_owned(),
            language: "en-US".to_owned(),
            hidden: Cell::new(false),
            secure_random: true,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn without_secure_random(mut self) -> Self {
        self.secure_random = false;
        self
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.set(hidden);
    }

    /// Resolves `url` against the current location, like `history.pushState`.
    pub fn navigate(&self, url: &str) {
        let next = url::Url::parse(&self.href.borrow())
            .and_then(|base| base.join(url))
            .map(String::from)
            .unwrap_or_else(|_| url.to_owned());
        *self.href.borrow_mut() = next;
    }
}

impl Page for SimulatedPage {
    fn location_href(&self) -> String {
        self.href.borrow().clone()
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.clone()
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn language(&self) -> String {
        self.language.clone()
    }

    fn is_hidden(&self) -> bool {
        self.hidden.get()
    }

    fn has_secure_random(&self) -> bool {
        self.secure_random
    }
}

/// The platform's own history implementation.
pub struct SimulatedHistory {
    page: Rc<SimulatedPage>,
    entries: RefCell<Vec<HistoryEntry>>,
}

impl SimulatedHistory {
    pub fn new(page: Rc<SimulatedPage>) -> Self {
        Self {
            page,
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.borrow().clone()
    }
}

impl HistoryApi for SimulatedHistory {
    fn push_state(&self, entry: HistoryEntry) {
        if let Some(url) = &entry.url {
            self.page.navigate(url);
        }
        self.entries.borrow_mut().push(entry);
    }

    fn replace_state(&self, entry: HistoryEntry) {
        if let Some(url) = &entry.url {
            self.page.navigate(url);
        }
        let mut entries = self.entries.borrow_mut();
        entries.pop();
        entries.push(entry);
    }
}

pub struct SimulatedHistorySlot {
    current: RefCell<Rc<dyn HistoryApi>>,
    intercepted: Cell<bool>,
}

impl SimulatedHistorySlot {
    pub fn new(history: Rc<dyn HistoryApi>) -> Self {
        Self {
            current: RefCell::new(history),
            intercepted: Cell::new(false),
        }
    }
}

impl HistorySlot for SimulatedHistorySlot {
    fn current(&self) -> Rc<dyn HistoryApi> {
        Rc::clone(&self.current.borrow())
    }

    fn replace(&self, history: Rc<dyn HistoryApi>) {
        *self.current.borrow_mut() = history;
    }

    fn mark_intercepted(&self) -> bool {
        self.intercepted.replace(true)
    }
}

pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// One simulated page load, plus the storage that survives it.
pub struct SimulatedBrowser {
    pub page: Rc<SimulatedPage>,
    pub session_storage: Rc<dyn Storage>,
    pub local_storage: Rc<dyn Storage>,
    pub events: Rc<SimulatedEventTargets>,
    pub native_history: Rc<SimulatedHistory>,
    pub history: Rc<SimulatedHistorySlot>,
    pub clock: Rc<dyn Clock>,
}

impl SimulatedBrowser {
    pub fn new(page: SimulatedPage) -> Self {
        Self::builder(page).build()
    }

    pub fn builder(page: SimulatedPage) -> SimulatedBrowserBuilder {
        SimulatedBrowserBuilder {
            page,
            session_storage: None,
            local_storage: None,
            clock: None,
            abort_signals: true,
        }
    }

    pub fn env(&self) -> PageEnv {
        PageEnv {
            page: self.page.clone(),
            session_storage: Rc::clone(&self.session_storage),
            local_storage: Rc::clone(&self.local_storage),
            events: self.events.clone(),
            history: self.history.clone(),
            clock: Rc::clone(&self.clock),
        }
    }

    /// A fresh page load in the same tab: both storages carry over, while
    /// listeners and the history binding start from scratch.
    pub fn reload(&self, page: SimulatedPage) -> Self {
        Self::builder(page)
            .session_storage(Rc::clone(&self.session_storage))
            .local_storage(Rc::clone(&self.local_storage))
            .clock(Rc::clone(&self.clock))
            .abort_signals(self.events.supports_abort_signal())
            .build()
    }

    /// A page load in a new tab of the same origin: only origin-scoped
    /// storage carries over.
    pub fn new_tab(&self, page: SimulatedPage) -> Self {
        Self::builder(page)
            .local_storage(Rc::clone(&self.local_storage))
            .clock(Rc::clone(&self.clock))
            .abort_signals(self.events.supports_abort_signal())
            .build()
    }

    pub fn push_state(&self, url: &str) {
        self.history.current().push_state(HistoryEntry::to(url));
    }

    pub fn replace_state(&self, url: &str) {
        self.history.current().replace_state(HistoryEntry::to(url));
    }

    /// Browser back/forward: the platform moves the location itself and
    /// then fires `popstate`.
    pub fn go_to(&self, url: &str) {
        self.page.navigate(url);
        self.events.fire(Target::Window, "popstate");
    }

    pub fn fire(&self, event_type: &str) -> usize {
        self.events.fire(Target::Window, event_type)
    }
}

pub struct SimulatedBrowserBuilder {
    page: SimulatedPage,
    session_storage: Option<Rc<dyn Storage>>,
    local_storage: Option<Rc<dyn Storage>>,
    clock: Option<Rc<dyn Clock>>,
    abort_signals: bool,
}

impl SimulatedBrowserBuilder {
    pub fn session_storage(mut self, storage: Rc<dyn Storage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    pub fn local_storage(mut self, storage: Rc<dyn Storage>) -> Self {
        self.local_storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn abort_signals(mut self, supported: bool) -> Self {
        self.abort_signals = supported;
        self
    }

    pub fn build(self) -> SimulatedBrowser {
        let page = Rc::new(self.page);
        let native_history = Rc::new(SimulatedHistory::new(Rc::clone(&page)));
        let history = Rc::new(SimulatedHistorySlot::new(native_history.clone()));

        SimulatedBrowser {
            page,
            session_storage: self
                .session_storage
                .unwrap_or_else(|| Rc::new(MemoryStorage::new())),
            local_storage: self
                .local_storage
                .unwrap_or_else(|| Rc::new(MemoryStorage::new())),
            events: Rc::new(SimulatedEventTargets::new(self.abort_signals)),
            native_history,
            history,
            clock: self.clock.unwrap_or_else(|| Rc::new(SystemClock)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconCall {
    pub url: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Status(u16),
    Unreachable,
}

/// Collector stand-in that records every POST it receives.
pub struct RecordingTransport {
    calls: Mutex<Vec<BeaconCall>>,
    outcome: Outcome,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::with_status(200)
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            outcome: Outcome::Status(status),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            outcome: Outcome::Unreachable,
        }
    }

    pub fn calls(&self) -> Vec<BeaconCall> {
        self.calls.lock().expect("RecordingTransport poisoned").clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<u16> {
        self.calls
            .lock()
            .expect("RecordingTransport poisoned")
            .push(BeaconCall {
                url: url.to_owned(),
                body,
            });

        match self.outcome {
            Outcome::Status(status) => Ok(status),
            Outcome::Unreachable => Err(TrackerError::TransportFailed {
                reason: format!("connection refused: {url}"),
            }),
        }
    }
}
