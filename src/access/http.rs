use super::{
    AccessAuthority, SessionCreateRequest, SessionResponse, SessionResponseEx, UsageInfo,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Access authority reached over HTTP/JSON.
pub struct HttpAccessAuthority {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpAccessAuthority {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building access authority client")?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid access authority path: {path}"))
    }
}

#[async_trait]
impl AccessAuthority for HttpAccessAuthority {
    async fn session_create(&self, request: SessionCreateRequest) -> Result<SessionResponseEx> {
        let url = self.endpoint("sessions")?;
        let response = self
            .client
            .post(url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(&request)
            .send()
            .await
            .context("session_create request failed")?
            .error_for_status()
            .context("session_create rejected")?;
        response
            .json()
            .await
            .context("invalid session_create response")
    }

    async fn session_get(
        &self,
        session_id: u64,
        host_endpoint: SocketAddr,
        client_ip: IpAddr,
    ) -> Result<SessionResponseEx> {
        let url = self.endpoint(&format!("sessions/{session_id}"))?;
        let response = self
            .client
            .get(url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .query(&[
                ("host_endpoint", host_endpoint.to_string()),
                ("client_ip", client_ip.to_string()),
            ])
            .send()
            .await
            .context("session_get request failed")?
            .error_for_status()
            .context("session_get rejected")?;
        response.json().await.context("invalid session_get response")
    }

    async fn session_add_usage(
        &self,
        session_id: u64,
        usage: UsageInfo,
        closing: bool,
    ) -> Result<SessionResponse> {
        let url = self.endpoint(&format!("sessions/{session_id}/usage"))?;
        let response = self
            .client
            .post(url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .query(&[("closing", closing.to_string())])
            .json(&usage)
            .send()
            .await
            .context("session_add_usage request failed")?
            .error_for_status()
            .context("session_add_usage rejected")?;
        response
            .json()
            .await
            .context("invalid session_add_usage response")
    }
}
