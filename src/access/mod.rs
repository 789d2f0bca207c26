//! Contract with the access authority: the external service that issues
//! session credentials, authorizes recovery, and accepts usage reports.

mod http;

pub use http::HttpAccessAuthority;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SESSION_KEY_LEN: usize = 16;

/// The shared secret the authority issues per session. Requests are
/// authenticated by comparing it in constant time.
pub type SessionKey = [u8; SESSION_KEY_LEN];

/// Wall-clock unix time in milliseconds; the time domain of authority
/// timestamps (`created_time`, `expiration_time`).
pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    Ok,
    GeneralError,
    AccessError,
    AccessExpired,
    SessionClosed,
    SessionSuppressed,
    SessionError,
    UnsupportedClient,
    Maintenance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUsage {
    /// Unix millis after which the session must be closed.
    #[serde(default)]
    pub expiration_time: Option<u64>,
    #[serde(default)]
    pub sent_bytes: u64,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub max_traffic: u64,
    #[serde(default)]
    pub max_client_count: u32,
}

/// Authority verdict mirrored onto a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub error_code: SessionErrorCode,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub access_usage: Option<AccessUsage>,
}

impl SessionResponse {
    pub fn ok() -> Self {
        Self {
            error_code: SessionErrorCode::Ok,
            error_message: None,
            access_usage: None,
        }
    }

    pub fn error(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            access_usage: None,
        }
    }
}

/// Full session grant as returned by `session_create` / `session_get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponseEx {
    #[serde(flatten)]
    pub response: SessionResponse,
    pub session_id: u64,
    #[serde(with = "key_base64")]
    pub session_key: SessionKey,
    pub created_time: u64,
    /// Opaque serialized blob round-tripped to the client.
    #[serde(default)]
    pub extra_data: Option<String>,
}

/// Known contents of the extra-data blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExtraData {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

impl Default for SessionExtraData {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_protocol_version() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_version: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Payload of `session_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub host_endpoint: SocketAddr,
    pub client_ip: IpAddr,
    pub client_info: ClientInfo,
    pub encrypted_client_id: String,
    pub token_id: String,
    #[serde(default)]
    pub extra_data: Option<String>,
}

/// Traffic delta reported by `session_add_usage`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

#[async_trait]
pub trait AccessAuthority: Send + Sync {
    async fn session_create(&self, request: SessionCreateRequest) -> Result<SessionResponseEx>;

    async fn session_get(
        &self,
        session_id: u64,
        host_endpoint: SocketAddr,
        client_ip: IpAddr,
    ) -> Result<SessionResponseEx>;

    async fn session_add_usage(
        &self,
        session_id: u64,
        usage: UsageInfo,
        closing: bool,
    ) -> Result<SessionResponse>;
}

mod key_base64 {
    use super::{SESSION_KEY_LEN, SessionKey};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(key: &SessionKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SessionKey, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(&text).map_err(de::Error::custom)?;
        if bytes.len() != SESSION_KEY_LEN {
            return Err(de::Error::custom(format!(
                "session key must be {} bytes, got {}",
                SESSION_KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_response_ex_roundtrip() {
        let response = SessionResponseEx {
            response: SessionResponse {
                error_code: SessionErrorCode::Ok,
                error_message: None,
                access_usage: Some(AccessUsage {
                    expiration_time: Some(1_700_000_000_000),
                    ..Default::default()
                }),
            },
            session_id: 42,
            session_key: [7u8; SESSION_KEY_LEN],
            created_time: 1_600_000_000_000,
            extra_data: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        // The inner response flattens into the outer object
        assert!(json.contains("\"error_code\":\"ok\""));
        let back: SessionResponseEx = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, 42);
        assert_eq!(back.session_key, [7u8; SESSION_KEY_LEN]);
        assert_eq!(back.response.error_code, SessionErrorCode::Ok);
    }

    #[test]
    fn test_session_key_length_enforced() {
        let json = r#"{
            "error_code": "ok",
            "session_id": 1,
            "session_key": "AAECAw==",
            "created_time": 0
        }"#;
        assert!(serde_json::from_str::<SessionResponseEx>(json).is_err());
    }

    #[test]
    fn test_extra_data_defaults_protocol_version() {
        let extra: SessionExtraData = serde_json::from_str("{}").unwrap();
        assert_eq!(extra.protocol_version, 3);
        assert_eq!(SessionExtraData::default().protocol_version, 3);
    }
}
