//! Best-effort usage analytics. Events are emitted as detached tasks and
//! failures never reach the request path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use url::Url;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// A client established a new session.
    PageView {
        client_version: String,
        server_version: String,
        page_title: String,
        page_location: String,
    },
    /// Periodic liveness signal with the live session count.
    Heartbeat { session_count: usize },
}

impl AnalyticsEvent {
    pub fn new_session(client_version: &str, server_version: &str) -> Self {
        let page = format!("server_version/{server_version}");
        Self::PageView {
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            page_title: page.clone(),
            page_location: page,
        }
    }
}

#[async_trait]
pub trait AnalyticsTracker: Send + Sync {
    async fn track(&self, event: AnalyticsEvent) -> Result<()>;
}

/// Tracker posting events to an HTTP collector.
pub struct HttpTracker {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTracker {
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("building analytics client")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl AnalyticsTracker for HttpTracker {
    async fn track(&self, event: AnalyticsEvent) -> Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&event)
            .send()
            .await
            .context("analytics post failed")?
            .error_for_status()
            .context("analytics collector rejected event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_event_shape() {
        let event = AnalyticsEvent::new_session("4.2.1", "0.3.1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "page_view");
        assert_eq!(json["client_version"], "4.2.1");
        assert_eq!(json["page_title"], "server_version/0.3.1");
        assert_eq!(json["page_location"], "server_version/0.3.1");
    }

    #[test]
    fn test_heartbeat_event_shape() {
        let event = AnalyticsEvent::Heartbeat { session_count: 17 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["session_count"], 17);
    }
}
