//! Session tracking for a single page load: identity that survives reloads,
//! event capture, virtual page views and a one-shot beacon at session end.
//!
//! The tracker talks to its page only through the ports in [`host`]; the
//! [`sim`] module provides an in-memory page for tests and the CLI.

pub mod beacon;
pub mod config;
pub mod enrich;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod navigation;
pub mod referrer;
pub mod session;
pub mod sim;
#[cfg(test)]
mod testing;
pub mod tracker;

pub use beacon::{Beacon, BeaconPayload, HttpTransport, Transport};
pub use config::{CollectorConfig, TrackerConfig, TrackerOptions};
pub use error::{Result, TrackerError};
pub use events::{
    CaptureListener, CapturedEvent, CapturedEvents, EventCaptureRegistry, EventSummary,
    ListenerSpec, Purpose, RegistrationHandle, RegistrationKey,
};
pub use host::{DomEvent, PageEnv, Target};
pub use identity::{IdSource, IdentityStore};
pub use navigation::{NavigationKind, NavigationObserver};
pub use referrer::UrlDescriptor;
pub use session::{LifecycleState, SessionMetadata};
pub use tracker::Tracker;
