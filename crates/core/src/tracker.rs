//! Session lifecycle: `Uninitialized -> Active -> Terminated`.
//!
//! A [`Tracker`] is an ordinary value; a host page that wants a singleton
//! constructs one and keeps the reference. Every public method is
//! best-effort: failures are logged and never returned to the host page.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeSet, HashMap},
    rc::{Rc, Weak},
};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    beacon::{Beacon, BeaconPayload},
    config::{TrackerConfig, TrackerOptions},
    events::{
        CaptureListener, CapturedEvent, CapturedEvents, EventCaptureRegistry, ListenerSpec,
        Purpose, RegistrationKey, resolve_enabled,
    },
    host::{DomEvent, PageEnv, Target},
    identity::{IdSource, IdentityStore, validate_user_id},
    navigation::{NavigationKind, NavigationObserver},
    referrer,
    session::{LifecycleState, SessionMetadata},
};

struct TrackerInner {
    env: PageEnv,
    identity: IdentityStore,
    registry: EventCaptureRegistry,
    navigation: NavigationObserver,
    beacon: Beacon,
    token: Option<String>,
    inactivity_timeout: Option<Duration>,
    global_listener: Option<CaptureListener>,
    type_listeners: HashMap<String, CaptureListener>,
    state: Cell<LifecycleState>,
    metadata: RefCell<Option<SessionMetadata>>,
    options: RefCell<TrackerOptions>,
    beacon_sent: Cell<bool>,
    pending_beacon: RefCell<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Rc<TrackerInner>,
}

impl Tracker {
    /// Builds an uninitialized tracker; nothing touches the page until
    /// [`Tracker::attach`].
    pub fn new(env: PageEnv, config: TrackerConfig) -> Self {
        let id_source = config.id_source.unwrap_or(if env.page.has_secure_random() {
            IdSource::Secure
        } else {
            IdSource::Pseudo
        });

        let identity = IdentityStore::new(
            Rc::clone(&env.session_storage),
            Rc::clone(&env.local_storage),
            id_source,
        );
        let registry = EventCaptureRegistry::new(Rc::clone(&env.events), Rc::clone(&env.clock));

        Self {
            inner: Rc::new(TrackerInner {
                identity,
                registry,
                navigation: NavigationObserver::new(),
                beacon: Beacon::new(config.collector, config.transport),
                token: config.token,
                inactivity_timeout: config.inactivity_timeout,
                global_listener: config.global_listener,
                type_listeners: config.type_listeners,
                state: Cell::new(LifecycleState::Uninitialized),
                metadata: RefCell::new(None),
                options: RefCell::new(config.options),
                beacon_sent: Cell::new(false),
                pending_beacon: RefCell::new(None),
                env,
            }),
        }
    }

    /// `new` followed by `attach`.
    pub fn attached(env: PageEnv, config: TrackerConfig) -> Self {
        let tracker = Self::new(env, config);
        tracker.attach();
        tracker
    }

    /// Restores or creates the session, then wires maintenance listeners,
    /// navigation interception and the configured event set.
    pub fn attach(&self) {
        if self.state() != LifecycleState::Uninitialized {
            debug!(state = ?self.state(), "tracker already attached");
            return;
        }

        let metadata = self.restore_or_create();
        info!(session_id = %metadata.session_id, "session tracking attached");
        *self.inner.metadata.borrow_mut() = Some(metadata);
        self.inner.state.set(LifecycleState::Active);

        self.parse_options();
        self.init_maintenance_listeners();
        self.init_event_listeners();
    }

    fn restore_or_create(&self) -> SessionMetadata {
        let now = self.inner.env.clock.now();

        match self.inner.identity.restore() {
            Some(metadata) if !self.is_stale(&metadata, now) => metadata,
            Some(metadata) => {
                info!(session_id = %metadata.session_id, "restored session expired, starting a new one");
                self.new_session(now)
            }
            None => self.new_session(now),
        }
    }

    fn is_stale(&self, metadata: &SessionMetadata, now: DateTime<Utc>) -> bool {
        match (self.inner.inactivity_timeout, metadata.last_activity_time) {
            (Some(timeout), Some(last)) => now - last > timeout,
            _ => false,
        }
    }

    fn new_session(&self, now: DateTime<Utc>) -> SessionMetadata {
        let inner = &self.inner;
        let page = &inner.env.page;

        SessionMetadata {
            token: inner.token.clone(),
            user_id: inner.identity.stored_user_id(),
            session_id: inner.identity.generate_session_id(),
            last_activity_time: inner.identity.last_activity_time(),
            start_time: now,
            session_duration: None,
            user_agent: page.user_agent(),
            location: None,
            language: page.language(),
            referrer: referrer::parse(page.referrer().as_deref()).into_descriptor(),
            path_history: Vec::new(),
        }
    }

    fn weak(&self) -> Weak<TrackerInner> {
        Rc::downgrade(&self.inner)
    }

    fn init_maintenance_listeners(&self) {
        let inner = &self.inner;

        let tracker = self.weak();
        inner.registry.register(ListenerSpec::maintenance(
            Target::Window,
            "beforeunload",
            move |_| {
                if let Some(inner) = tracker.upgrade() {
                    Tracker { inner }.terminate();
                }
            },
        ));

        let tracker = self.weak();
        inner.registry.register(ListenerSpec::maintenance(
            Target::Window,
            "visibilitychange",
            move |_| {
                if let Some(inner) = tracker.upgrade() {
                    Tracker { inner }.flush_if_hidden();
                }
            },
        ));

        let tracker = self.weak();
        inner.navigation.install(
            inner.env.history.as_ref(),
            &inner.registry,
            Rc::new(move |kind| {
                if let Some(inner) = tracker.upgrade() {
                    Tracker { inner }.capture_location_metadata(kind);
                }
            }),
        );
    }

    /// Registers the enabled event set. Types no longer enabled (or moved to
    /// another target) are cancelled; types already registered are kept.
    pub fn init_event_listeners(&self) {
        if self.state() == LifecycleState::Uninitialized {
            warn!("event listeners requested before attach");
            return;
        }

        let wanted: BTreeSet<(Target, String)> = {
            let options = self.inner.options.borrow();
            resolve_enabled(options.whitelist.as_deref(), &options.blacklist)
                .into_iter()
                .map(|t| (options.targets.get(&t).cloned().unwrap_or_default(), t))
                .collect()
        };

        for key in self.inner.registry.active_keys(Purpose::Capture) {
            if !wanted.contains(&(key.target.clone(), key.event_type.clone())) {
                debug!(?key, "event type disabled");
                self.inner.registry.cancel(&key);
            }
        }

        for (target, event_type) in wanted {
            let listener = self.compose_listener(&event_type);
            self.inner
                .registry
                .register(ListenerSpec::capture(target, event_type).with_listener(listener));
        }
    }

    fn compose_listener(&self, event_type: &str) -> CaptureListener {
        let tracker = self.weak();
        let specific = self.inner.type_listeners.get(event_type).cloned();
        let global = self.inner.global_listener.clone();

        Rc::new(move |event: &Rc<DomEvent>, record: &CapturedEvent| {
            if let Some(inner) = tracker.upgrade() {
                Tracker { inner }.touch(record.captured_at);
            }
            if let Some(listener) = &specific {
                listener(event, record);
            }
            if let Some(listener) = &global {
                listener(event, record);
            }
        })
    }

    fn touch(&self, at: DateTime<Utc>) {
        if self.state() != LifecycleState::Active {
            return;
        }
        if let Some(metadata) = self.inner.metadata.borrow_mut().as_mut() {
            metadata.last_activity_time = Some(at);
        }
    }

    fn capture_location_metadata(&self, kind: NavigationKind) {
        if !self.inner.options.borrow().track_paths {
            return;
        }
        let pathname = self.inner.env.page.pathname();
        debug!(?kind, pathname, "virtual page view");
        if let Some(metadata) = self.inner.metadata.borrow_mut().as_mut() {
            metadata.path_history.push(pathname);
        }
    }

    fn flush_if_hidden(&self) {
        let enabled = self.inner.options.borrow().early_flush_on_hidden;
        if enabled && self.inner.env.page.is_hidden() {
            debug!("page hidden, flushing session early");
            self.terminate();
        }
    }

    /// Session end: stamp activity, compute duration, persist, then hand
    /// the snapshot to the beacon without waiting on it. Safe to call
    /// repeatedly; only the first call posts.
    pub fn terminate(&self) {
        if self.state() == LifecycleState::Uninitialized {
            warn!("terminate called before attach");
            return;
        }

        let inner = &self.inner;
        let now = inner.env.clock.now();

        let Some(snapshot) = inner.metadata.borrow_mut().as_mut().map(|metadata| {
            metadata.last_activity_time = Some(now);
            metadata.finalize_duration(now);
            metadata.clone()
        }) else {
            return;
        };

        if let Err(e) = inner.identity.record_activity(now) {
            warn!(error = %e, "could not store last activity time");
        }
        if let Err(e) = inner.identity.persist(&snapshot) {
            warn!(error = %e, "could not persist session metadata");
        }
        inner.state.set(LifecycleState::Terminated);

        if !inner.options.borrow().post_data {
            debug!("beacon disabled by options");
            return;
        }
        if inner.beacon_sent.replace(true) {
            debug!("session beacon already sent");
            return;
        }

        let Some(body) = self.beacon_body_for(&snapshot) else {
            return;
        };
        let handle = inner.beacon.send(&inner.env.page.hostname(), body);
        *inner.pending_beacon.borrow_mut() = handle;
    }

    fn beacon_body_for(&self, snapshot: &SessionMetadata) -> Option<String> {
        let events = self
            .inner
            .options
            .borrow()
            .include_captured_events
            .then(|| self.inner.registry.captured().summaries());

        BeaconPayload {
            metadata: snapshot,
            events,
        }
        .to_body()
        .inspect_err(|e| error!(error = %e, "could not serialize session beacon"))
        .ok()
    }

    /// The JSON body a beacon would carry right now.
    pub fn beacon_body(&self) -> Option<String> {
        let snapshot = self.session_data()?;
        self.beacon_body_for(&snapshot)
    }

    /// Merges `patch` into the current options. Non-objects, unknown keys,
    /// ill-typed values and an invalid `userId` are logged, and the current
    /// options are kept.
    pub fn update_options(&self, patch: serde_json::Value) {
        let merged = self.inner.options.borrow().merged(patch);
        match merged {
            Ok(options) => self.apply_options(options),
            Err(e) => error!(error = %e, "options not updated"),
        }
    }

    /// Replaces the options wholesale, with the same validation as
    /// [`Tracker::update_options`].
    pub fn set_options(&self, options: serde_json::Value) {
        match TrackerOptions::from_value(options) {
            Ok(options) => self.apply_options(options),
            Err(e) => error!(error = %e, "options not set"),
        }
    }

    fn apply_options(&self, options: TrackerOptions) {
        if let Some(Err(e)) = options.user_id.as_ref().map(validate_user_id) {
            error!(error = %e, "options rejected");
            return;
        }
        *self.inner.options.borrow_mut() = options;
        self.parse_options();
        if self.state() == LifecycleState::Active {
            self.init_event_listeners();
        }
    }

    fn parse_options(&self) {
        let user_id = self.inner.options.borrow().user_id.clone();
        if let Some(user_id) = user_id {
            self.set_user_id(user_id);
        }
    }

    pub fn set_user_id(&self, value: impl Into<serde_json::Value>) {
        let value = value.into();
        let mut metadata = self.inner.metadata.borrow_mut();
        let Some(metadata) = metadata.as_mut() else {
            warn!("user id set before attach, ignored");
            return;
        };
        if let Err(e) = self.inner.identity.set_user_id(metadata, &value) {
            error!(error = %e, "user id not set");
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner
            .metadata
            .borrow()
            .as_ref()
            .and_then(|m| m.user_id.clone())
    }

    /// Sets the reserved `location` field, e.g. from
    /// [`crate::enrich::fetch_ip_address`].
    pub fn set_location(&self, location: serde_json::Value) {
        if let Some(metadata) = self.inner.metadata.borrow_mut().as_mut() {
            metadata.location = Some(location);
        }
    }

    pub fn session_data(&self) -> Option<SessionMetadata> {
        self.inner.metadata.borrow().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .metadata
            .borrow()
            .as_ref()
            .map(|m| m.session_id.clone())
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    pub fn options(&self) -> TrackerOptions {
        self.inner.options.borrow().clone()
    }

    pub fn captured(&self) -> CapturedEvents {
        self.inner.registry.captured()
    }

    pub fn registry(&self) -> &EventCaptureRegistry {
        &self.inner.registry
    }

    /// The in-flight beacon, if one was sent. Only callers that outlive
    /// the page have a use for awaiting it.
    pub fn take_pending_beacon(&self) -> Option<JoinHandle<()>> {
        self.inner.pending_beacon.borrow_mut().take()
    }

    /// Cancels every listener the tracker registered. The history wrap is
    /// left in place.
    pub fn detach(&self) {
        self.inner.registry.cancel_all();
    }

    pub fn is_registered(&self, key: &RegistrationKey) -> bool {
        self.inner
            .registry
            .is_registered(&key.target, &key.event_type, key.purpose)
    }
}
