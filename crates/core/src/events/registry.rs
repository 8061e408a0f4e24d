use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, error, trace};

use crate::{
    error::TrackerError,
    events::{CapturedEvent, CapturedEvents},
    host::{AbortController, Clock, DomEvent, DomListener, EventTargets, ListenerOptions, Target},
};

pub type CaptureListener = Rc<dyn Fn(&Rc<DomEvent>, &CapturedEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Occurrences are recorded for the session.
    Capture,
    /// Tracker wiring; nothing is recorded.
    Maintenance,
}

#[derive(Clone)]
pub enum Handler {
    Record(Option<CaptureListener>),
    Maintain(DomListener),
}

impl Handler {
    fn purpose(&self) -> Purpose {
        match self {
            Handler::Record(_) => Purpose::Capture,
            Handler::Maintain(_) => Purpose::Maintenance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationKey {
    pub target: Target,
    pub event_type: String,
    pub purpose: Purpose,
}

/// Arguments of one registration request. `target` and `event_type` are
/// required; leaving either out is a caller bug and is rejected.
#[derive(Clone)]
pub struct ListenerSpec {
    pub target: Option<Target>,
    pub event_type: Option<String>,
    pub handler: Handler,
    pub options: ListenerOptions,
    pub use_capture: Option<bool>,
}

impl ListenerSpec {
    pub fn capture(target: Target, event_type: impl Into<String>) -> Self {
        Self {
            target: Some(target),
            event_type: Some(event_type.into()),
            handler: Handler::Record(None),
            options: ListenerOptions::default(),
            use_capture: None,
        }
    }

    pub fn maintenance(
        target: Target,
        event_type: impl Into<String>,
        listener: impl Fn(&Rc<DomEvent>) + 'static,
    ) -> Self {
        Self {
            target: Some(target),
            event_type: Some(event_type.into()),
            handler: Handler::Maintain(Rc::new(listener)),
            options: ListenerOptions::default(),
            use_capture: None,
        }
    }

    pub fn with_listener(mut self, listener: CaptureListener) -> Self {
        self.handler = Handler::Record(Some(listener));
        self
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_use_capture(mut self, use_capture: bool) -> Self {
        self.use_capture = Some(use_capture);
        self
    }

    /// `options.capture` wins, then `use_capture`; otherwise capture phase,
    /// so the tracker sees events before page listeners can stop them.
    pub fn resolved_capture(&self) -> bool {
        self.options.capture.or(self.use_capture).unwrap_or(true)
    }
}

/// Cancels exactly one registration.
#[derive(Clone)]
pub struct RegistrationHandle {
    key: Rc<RegistrationKey>,
    controller: AbortController,
}

impl RegistrationHandle {
    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        !self.controller.signal().aborted()
    }

    pub fn cancel(&self) {
        self.controller.abort();
    }

    pub fn same_as(&self, other: &RegistrationHandle) -> bool {
        self.controller.signal().same_as(other.controller.signal())
    }
}

impl fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

struct RegistryInner {
    targets: Rc<dyn EventTargets>,
    clock: Rc<dyn Clock>,
    captured: RefCell<CapturedEvents>,
    active: RefCell<HashMap<RegistrationKey, RegistrationHandle>>,
    next_seq: Cell<u64>,
}

impl RegistryInner {
    fn record(&self, handle: &RegistrationHandle, event: &Rc<DomEvent>) -> Rc<CapturedEvent> {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        let record = Rc::new(CapturedEvent {
            event_type: event.event_type.clone(),
            event: Rc::clone(event),
            handle: handle.clone(),
            captured_at: self.clock.now(),
            seq,
        });
        self.captured.borrow_mut().record(Rc::clone(&record));
        trace!(event_type = %record.event_type, seq, "captured");
        record
    }
}

/// Owns every listener the tracker attaches, and everything they capture.
#[derive(Clone)]
pub struct EventCaptureRegistry {
    inner: Rc<RegistryInner>,
}

impl EventCaptureRegistry {
    pub fn new(targets: Rc<dyn EventTargets>, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                targets,
                clock,
                captured: RefCell::new(CapturedEvents::default()),
                active: RefCell::new(HashMap::new()),
                next_seq: Cell::new(0),
            }),
        }
    }

    /// Registers a listener, or returns the live handle already registered
    /// for the same target, type and purpose.
    pub fn register(&self, spec: ListenerSpec) -> Option<RegistrationHandle> {
        let Some(event_type) = spec.event_type.clone().filter(|t| !t.is_empty()) else {
            let e = TrackerError::MissingEventType;
            error!(error = %e, "listener not registered");
            return None;
        };
        let Some(target) = spec.target.clone() else {
            let e = TrackerError::MissingTarget { event_type };
            error!(error = %e, "listener not registered");
            return None;
        };

        let key = RegistrationKey {
            target,
            event_type,
            purpose: spec.handler.purpose(),
        };

        if let Some(existing) = self.inner.active.borrow().get(&key) {
            if existing.is_active() {
                debug!(?key, "already registered, keeping existing listener");
                return Some(existing.clone());
            }
        }

        let controller = AbortController::new();
        let handle = RegistrationHandle {
            key: Rc::new(key.clone()),
            controller: controller.clone(),
        };

        let mut options = spec.options.clone();
        options.capture = Some(spec.resolved_capture());
        options.signal = Some(controller.signal().clone());

        let callback = self.callback(handle.clone(), spec.handler, options.once);
        let id = match self.inner.targets.add_event_listener(
            &key.target,
            &key.event_type,
            callback,
            &options,
        ) {
            Ok(id) => id,
            Err(e) => {
                let e = TrackerError::ListenerRejected {
                    event_type: key.event_type.clone(),
                    reason: e.to_string(),
                };
                error!(error = %e, "listener not registered");
                return None;
            }
        };

        if !self.inner.targets.supports_abort_signal() {
            let targets = Rc::downgrade(&self.inner.targets);
            let (target, event_type) = (key.target.clone(), key.event_type.clone());
            controller.signal().on_abort(move || {
                if let Some(targets) = targets.upgrade() {
                    targets.remove_event_listener(&target, &event_type, id);
                }
            });
        }

        let registry = Rc::downgrade(&self.inner);
        let released = key.clone();
        controller.signal().on_abort(move || {
            if let Some(inner) = registry.upgrade() {
                inner.active.borrow_mut().remove(&released);
            }
        });

        debug!(?key, capture = ?options.capture, "registered listener");
        self.inner.active.borrow_mut().insert(key, handle.clone());
        Some(handle)
    }

    fn callback(&self, handle: RegistrationHandle, handler: Handler, once: bool) -> DomListener {
        let registry: Weak<RegistryInner> = Rc::downgrade(&self.inner);

        Rc::new(move |event: &Rc<DomEvent>| {
            if !handle.is_active() {
                return;
            }

            match &handler {
                Handler::Record(listener) => {
                    let Some(inner) = registry.upgrade() else {
                        return;
                    };
                    let record = inner.record(&handle, event);
                    drop(inner);
                    if let Some(listener) = listener {
                        listener(event, &record);
                    }
                }
                Handler::Maintain(listener) => listener(event),
            }

            if once {
                handle.cancel();
            }
        })
    }

    pub fn is_registered(&self, target: &Target, event_type: &str, purpose: Purpose) -> bool {
        let key = RegistrationKey {
            target: target.clone(),
            event_type: event_type.to_owned(),
            purpose,
        };
        self.inner.active.borrow().contains_key(&key)
    }

    /// Keys of the live registrations with the given purpose.
    pub fn active_keys(&self, purpose: Purpose) -> Vec<RegistrationKey> {
        self.inner
            .active
            .borrow()
            .keys()
            .filter(|k| k.purpose == purpose)
            .cloned()
            .collect()
    }

    /// Cancels the registration for `key`, if live. Returns whether one was.
    pub fn cancel(&self, key: &RegistrationKey) -> bool {
        let handle = self.inner.active.borrow().get(key).cloned();
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.borrow().len()
    }

    pub fn cancel_all(&self) {
        let handles: Vec<RegistrationHandle> =
            self.inner.active.borrow().values().cloned().collect();
        for handle in handles {
            handle.cancel();
        }
    }

    /// Snapshot of everything captured so far.
    pub fn captured(&self) -> CapturedEvents {
        self.inner.captured.borrow().clone()
    }

    pub fn captured_len(&self) -> usize {
        self.inner.captured.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::sim::{ManualClock, SimulatedEventTargets};

    fn registry(abort_signals: bool) -> (EventCaptureRegistry, Rc<SimulatedEventTargets>, Rc<ManualClock>) {
        let targets = Rc::new(SimulatedEventTargets::new(abort_signals));
        let clock = Rc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let registry = EventCaptureRegistry::new(targets.clone(), clock.clone());
        (registry, targets, clock)
    }

    #[test]
    fn test_missing_target_or_type_is_rejected() {
        let (registry, _, _) = registry(true);

        let mut no_target = ListenerSpec::capture(Target::Window, "click");
        no_target.target = None;
        assert!(registry.register(no_target).is_none());

        let mut no_type = ListenerSpec::capture(Target::Window, "click");
        no_type.event_type = None;
        assert!(registry.register(no_type).is_none());

        let blank_type = ListenerSpec::capture(Target::Window, "");
        assert!(registry.register(blank_type).is_none());

        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_capture_records_per_type_and_chronologically() {
        let (registry, targets, clock) = registry(true);
        registry.register(ListenerSpec::capture(Target::Window, "click"));
        registry.register(ListenerSpec::capture(Target::Window, "scroll"));

        targets.fire(Target::Window, "click");
        clock.advance(Duration::milliseconds(250));
        targets.fire(Target::Window, "scroll");
        clock.advance(Duration::milliseconds(250));
        targets.fire(Target::Window, "click");

        let captured = registry.captured();
        assert_eq!(captured.len(), 3);
        assert_eq!(captured.of_type("click").len(), 2);
        assert_eq!(captured.of_type("scroll").len(), 1);
        assert!(captured.of_type("keydown").is_empty());
        assert_eq!(captured.event_types(), vec!["click", "scroll"]);

        let order: Vec<_> = captured
            .chronological()
            .iter()
            .map(|e| (e.event_type.as_str(), e.seq))
            .collect();
        assert_eq!(order, vec![("click", 0), ("scroll", 1), ("click", 2)]);

        let clicks = captured.of_type("click");
        assert!(clicks[0].captured_at < clicks[1].captured_at);
        assert!(Rc::ptr_eq(&clicks[1], &captured.chronological()[2]));
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let (registry, targets, _) = registry(true);

        let first = registry
            .register(ListenerSpec::capture(Target::Window, "click"))
            .unwrap();
        let second = registry
            .register(ListenerSpec::capture(Target::Window, "click"))
            .unwrap();

        assert!(first.same_as(&second));
        assert_eq!(targets.listener_count(&Target::Window, "click"), 1);

        targets.fire(Target::Window, "click");
        assert_eq!(registry.captured().of_type("click").len(), 1);
    }

    #[test]
    fn test_same_type_different_purpose_or_target_coexist() {
        let (registry, targets, _) = registry(true);

        registry.register(ListenerSpec::capture(Target::Window, "popstate"));
        registry.register(ListenerSpec::maintenance(Target::Window, "popstate", |_| {}));
        registry.register(ListenerSpec::capture(Target::Document, "popstate"));

        assert_eq!(registry.active_count(), 3);
        assert_eq!(targets.listener_count(&Target::Window, "popstate"), 2);

        targets.fire(Target::Window, "popstate");
        assert_eq!(registry.captured_len(), 1);
    }

    #[test]
    fn test_listener_receives_event_and_record() {
        let (registry, targets, _) = registry(true);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        registry.register(ListenerSpec::capture(Target::Window, "submit").with_listener(
            Rc::new(move |event: &Rc<DomEvent>, record: &CapturedEvent| {
                sink.borrow_mut()
                    .push((event.event_type.clone(), record.seq, Rc::ptr_eq(event, &record.event)));
            }),
        ));

        targets.fire(Target::Window, "submit");
        assert_eq!(*seen.borrow(), vec![("submit".to_owned(), 0, true)]);
    }

    #[test]
    fn test_capture_flag_resolution() {
        let spec = ListenerSpec::capture(Target::Window, "click");
        assert!(spec.resolved_capture());
        assert!(!spec.clone().with_use_capture(false).resolved_capture());

        let explicit = ListenerOptions {
            capture: Some(false),
            ..Default::default()
        };
        assert!(!spec.clone().with_options(explicit.clone()).with_use_capture(true).resolved_capture());

        let explicit_true = ListenerOptions {
            capture: Some(true),
            ..Default::default()
        };
        assert!(spec.with_options(explicit_true).with_use_capture(false).resolved_capture());
    }

    #[test]
    fn test_cancel_stops_capture_in_both_removal_modes() {
        for abort_signals in [true, false] {
            let (registry, targets, _) = registry(abort_signals);
            let handle = registry
                .register(ListenerSpec::capture(Target::Window, "click"))
                .unwrap();

            targets.fire(Target::Window, "click");
            handle.cancel();
            targets.fire(Target::Window, "click");

            assert_eq!(registry.captured_len(), 1, "abort_signals={abort_signals}");
            assert_eq!(targets.listener_count(&Target::Window, "click"), 0);
            assert!(!registry.is_registered(&Target::Window, "click", Purpose::Capture));
        }
    }

    #[test]
    fn test_cancelled_key_can_register_again() {
        let (registry, targets, _) = registry(false);
        let first = registry
            .register(ListenerSpec::capture(Target::Window, "click"))
            .unwrap();
        first.cancel();

        let second = registry
            .register(ListenerSpec::capture(Target::Window, "click"))
            .unwrap();

        assert!(!first.same_as(&second));
        assert_eq!(targets.fire(Target::Window, "click"), 1);
        assert_eq!(registry.captured_len(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let (registry, targets, _) = registry(true);
        for event_type in ["click", "scroll", "input"] {
            registry.register(ListenerSpec::capture(Target::Window, event_type));
        }

        registry.cancel_all();

        assert_eq!(registry.active_count(), 0);
        assert_eq!(targets.fire(Target::Window, "scroll"), 0);
    }

    #[test]
    fn test_cancel_by_key_leaves_other_purposes() {
        let (registry, targets, _) = registry(false);
        registry.register(ListenerSpec::capture(Target::Window, "popstate"));
        registry.register(ListenerSpec::maintenance(Target::Window, "popstate", |_| {}));

        let keys = registry.active_keys(Purpose::Capture);
        assert_eq!(keys.len(), 1);
        assert!(registry.cancel(&keys[0]));
        assert!(!registry.cancel(&keys[0]));

        assert_eq!(targets.listener_count(&Target::Window, "popstate"), 1);
        assert!(registry.active_keys(Purpose::Capture).is_empty());
        assert_eq!(registry.active_keys(Purpose::Maintenance).len(), 1);
    }

    #[test]
    fn test_once_listener_frees_its_key() {
        let (registry, targets, _) = registry(true);
        let options = ListenerOptions {
            once: true,
            ..Default::default()
        };
        registry.register(ListenerSpec::capture(Target::Window, "load").with_options(options));

        targets.fire(Target::Window, "load");
        targets.fire(Target::Window, "load");

        assert_eq!(registry.captured_len(), 1);
        assert!(!registry.is_registered(&Target::Window, "load", Purpose::Capture));
    }

    #[test]
    fn test_listener_registering_same_type_during_dispatch() {
        let (registry, targets, _) = registry(true);
        let inner = registry.clone();

        registry.register(ListenerSpec::capture(Target::Window, "click").with_listener(Rc::new(
            move |_: &Rc<DomEvent>, _: &CapturedEvent| {
                inner.register(ListenerSpec::capture(Target::Document, "click"));
            },
        )));

        targets.fire(Target::Window, "click");
        targets.fire(Target::Window, "click");

        assert_eq!(registry.captured_len(), 2);
        assert_eq!(registry.active_count(), 2);
    }
}
