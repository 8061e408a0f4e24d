use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::CollectorConfig,
    error::{Result, TrackerError},
    events::EventSummary,
    session::SessionMetadata,
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs a JSON body and returns the response status.
    async fn post_json(&self, url: &str, body: String) -> Result<u16>;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Body of the session-end POST. Captured events appear only when opted in.
#[derive(Debug, Serialize)]
pub struct BeaconPayload<'a> {
    #[serde(flatten)]
    pub metadata: &'a SessionMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventSummary>>,
}

impl BeaconPayload<'_> {
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn is_loopback(hostname: &str) -> bool {
    matches!(hostname, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

pub struct Beacon {
    collector: CollectorConfig,
    transport: Arc<dyn Transport>,
}

impl Beacon {
    pub fn new(collector: CollectorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            collector,
            transport,
        }
    }

    pub fn collector_url(&self, hostname: &str) -> String {
        if is_loopback(hostname) {
            format!(
                "http://localhost:{}/{}",
                self.collector.local_port, self.collector.route
            )
        } else {
            format!("https://{}/{}", self.collector.domain, self.collector.route)
        }
    }

    /// Fire-and-forget: the POST runs on the current tokio runtime and its
    /// outcome is only logged. The handle is returned for callers that
    /// outlive the page (the simulator, tests); the tracker never awaits it.
    pub fn send(&self, hostname: &str, body: String) -> Option<JoinHandle<()>> {
        if !is_loopback(hostname) && self.collector.domain.is_empty() {
            warn!(hostname, "no collector domain configured, session beacon dropped");
            return None;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available, session beacon dropped");
            return None;
        };

        let url = self.collector_url(hostname);
        let transport = Arc::clone(&self.transport);
        debug!(url = %url, bytes = body.len(), "sending session beacon");

        Some(runtime.spawn(async move {
            match transport.post_json(&url, body).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(url = %url, status, "session beacon delivered");
                }
                Ok(status) => {
                    let e = TrackerError::BeaconRejected { url, status };
                    warn!(error = %e, "session beacon not accepted");
                }
                Err(e) => warn!(error = %e, url = %url, "session beacon failed"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::sim::RecordingTransport;

    fn beacon(transport: Arc<RecordingTransport>) -> Beacon {
        Beacon::new(
            CollectorConfig::new("collector.borea.example").with_local_port(9090),
            transport,
        )
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            token: None,
            user_id: Some("alice".to_owned()),
            session_id: "7b1c1c6e-6a55-4b8e-9f0e-1d2c3b4a5f60".to_owned(),
            last_activity_time: None,
            start_time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            session_duration: Some(1500),
            user_agent: "test-agent".to_owned(),
            location: None,
            language: "en".to_owned(),
            referrer: None,
            path_history: Vec::new(),
        }
    }

    #[test]
    fn test_collector_url_by_environment() {
        let beacon = beacon(Arc::new(RecordingTransport::new()));

        assert_eq!(beacon.collector_url("localhost"), "http://localhost:9090/postSession");
        assert_eq!(beacon.collector_url("127.0.0.1"), "http://localhost:9090/postSession");
        assert_eq!(
            beacon.collector_url("shop.example.com"),
            "https://collector.borea.example/postSession"
        );
    }

    #[test]
    fn test_payload_excludes_events_unless_present() {
        let md = metadata();
        let body = BeaconPayload { metadata: &md, events: None }.to_body().unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(json["sessionId"], md.session_id);
        assert_eq!(json["sessionDuration"], 1500);
        assert_eq!(json["userId"], "alice");
        assert!(json.get("events").is_none());
        assert!(json.get("pathHistory").is_none());
    }

    #[tokio::test]
    async fn test_send_posts_once() {
        let transport = Arc::new(RecordingTransport::new());
        let beacon = beacon(transport.clone());

        let handle = beacon.send("shop.example.com", "{\"a\":1}".to_owned()).unwrap();
        handle.await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://collector.borea.example/postSession");
        assert_eq!(calls[0].body, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_failures_are_only_logged() {
        for transport in [RecordingTransport::with_status(503), RecordingTransport::failing()] {
            let transport = Arc::new(transport);
            let handle = beacon(transport.clone())
                .send("localhost", "{}".to_owned())
                .unwrap();

            handle.await.unwrap();
            assert_eq!(transport.calls().len(), 1);
        }
    }

    #[test]
    fn test_send_without_runtime_is_dropped() {
        let transport = Arc::new(RecordingTransport::new());
        assert!(beacon(transport.clone()).send("localhost", "{}".to_owned()).is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_domain_drops_beacon() {
        let transport = Arc::new(RecordingTransport::new());
        let beacon = Beacon::new(CollectorConfig::new(""), transport.clone());

        assert!(beacon.send("shop.example.com", "{}".to_owned()).is_none());
        assert!(beacon.send("localhost", "{}".to_owned()).is_some());
    }
}
