//! Authorized client tunnel contexts and the manager that owns them.

mod keyed_lock;
mod manager;

pub(crate) use keyed_lock::KeyedLocks;
pub use manager::{PoolMode, SessionManager, SessionOptions};

use crate::access::{
    AccessAuthority, SessionErrorCode, SessionKey, SessionResponse, SessionResponseEx, UsageInfo,
};
use crate::packet;
use crate::sockets::SocketFactory;
use crate::udp::{
    DatagramRouter, DatagramSink, EndpointObserver, ProxyError, UdpProxyPool, UdpProxyPoolStats,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Local/remote addresses of the transport carrying a client request.
#[derive(Debug, Clone, Copy)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// First request of a new client.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub request_id: String,
    pub token_id: String,
    pub client_info: crate::access::ClientInfo,
    pub encrypted_client_id: String,
    pub extra_data: Option<String>,
}

/// Any follow-up request addressing an existing session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub request_id: String,
    pub session_id: u64,
    pub session_key: SessionKey,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Authentication failed. The message is the only detail a client may see.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// An authorized session was refused; carries the authority response.
    #[error("session request {request_id} rejected ({:?})", .response.error_code)]
    Rejected {
        response: SessionResponse,
        request_id: String,
    },
}

impl SessionError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn rejected(response: SessionResponse, request_id: &str) -> Self {
        Self::Rejected {
            response,
            request_id: request_id.to_string(),
        }
    }

    /// A rejection derived from a disposed session's current response.
    pub fn session_closed(mut response: SessionResponse, request_id: &str) -> Self {
        response.error_code = SessionErrorCode::SessionClosed;
        Self::rejected(response, request_id)
    }
}

/// Tunnel write side: receives rebuilt IP packets bound for the client.
pub trait PacketSink: Send + Sync {
    fn push_packet(&self, packet: Bytes);
}

/// How a session attaches to a UDP proxy pool.
pub(crate) enum PoolBinding {
    /// The session owns a private pool.
    Owned {
        socket_factory: Arc<dyn SocketFactory>,
        observer: Option<Arc<dyn EndpointObserver>>,
        worker_max_count: usize,
        udp_timeout: Duration,
    },
    /// A server-wide pool is shared between sessions; inbound datagrams are
    /// demuxed back through the router.
    Shared {
        pool: Arc<UdpProxyPool>,
        router: Arc<DatagramRouter>,
    },
}

pub(crate) struct SessionConfig {
    pub response: SessionResponseEx,
    pub endpoints: EndpointPair,
    pub protocol_version: u32,
    pub access: Arc<dyn AccessAuthority>,
    pub packet_sink: Arc<dyn PacketSink>,
    pub pool: PoolBinding,
}

/// One authorized client context. The manager only sees the credential
/// surface; the UDP data plane is private to the session.
pub struct Session {
    session_id: u64,
    session_key: SessionKey,
    endpoints: EndpointPair,
    protocol_version: u32,
    response: RwLock<SessionResponse>,
    last_activity: Arc<RwLock<Instant>>,
    sent_bytes: AtomicU64,
    received_bytes: Arc<AtomicU64>,
    reported_sent: AtomicU64,
    reported_received: AtomicU64,
    access: Arc<dyn AccessAuthority>,
    udp_pool: Arc<UdpProxyPool>,
    owns_pool: bool,
    inbound_sink: Arc<InboundUdpSink>,
    shared_router: Option<Arc<DatagramRouter>>,
    sync_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("protocol_version", &self.protocol_version)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(config: SessionConfig) -> Arc<Self> {
        let received_bytes = Arc::new(AtomicU64::new(0));
        let last_activity = Arc::new(RwLock::new(Instant::now()));
        let inbound_sink = Arc::new(InboundUdpSink {
            packet_sink: config.packet_sink,
            received_bytes: Arc::clone(&received_bytes),
            last_activity: Arc::clone(&last_activity),
        });

        let (udp_pool, owns_pool, shared_router) = match config.pool {
            PoolBinding::Owned {
                socket_factory,
                observer,
                worker_max_count,
                udp_timeout,
            } => {
                let pool = UdpProxyPool::new(
                    socket_factory,
                    Arc::clone(&inbound_sink) as Arc<dyn DatagramSink>,
                    observer,
                    worker_max_count,
                );
                pool.set_udp_timeout(udp_timeout);
                (Arc::new(pool), true, None)
            }
            PoolBinding::Shared { pool, router } => (pool, false, Some(router)),
        };

        Arc::new(Self {
            session_id: config.response.session_id,
            session_key: config.response.session_key,
            endpoints: config.endpoints,
            protocol_version: config.protocol_version,
            response: RwLock::new(config.response.response),
            last_activity,
            sent_bytes: AtomicU64::new(0),
            received_bytes,
            reported_sent: AtomicU64::new(0),
            reported_received: AtomicU64::new(0),
            access: config.access,
            udp_pool,
            owns_pool,
            inbound_sink,
            shared_router,
            sync_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn endpoints(&self) -> EndpointPair {
        self.endpoints
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn response(&self) -> SessionResponse {
        self.response.read().clone()
    }

    pub(crate) fn set_response(&self, response: SessionResponse) {
        *self.response.write() = response;
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn udp_stats(&self) -> UdpProxyPoolStats {
        self.udp_pool.stats()
    }

    /// Whether the authority-granted access window has passed.
    pub(crate) fn is_access_expired(&self, now_millis: u64) -> bool {
        self.response
            .read()
            .access_usage
            .and_then(|usage| usage.expiration_time)
            .is_some_and(|expiration| expiration < now_millis)
    }

    /// Forward one client UDP payload toward `destination`.
    pub async fn process_udp(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Option<&[u8]>,
        no_fragment: Option<bool>,
    ) -> Result<(), ProxyError> {
        if self.is_disposed() {
            return Err(ProxyError::Disposed);
        }
        self.touch();
        if let Some(data) = payload {
            self.sent_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        if let Some(router) = &self.shared_router {
            router.register(
                source,
                Arc::clone(&self.inbound_sink) as Arc<dyn DatagramSink>,
            );
        }
        self.udp_pool
            .send_packet(source, destination, payload, no_fragment)
            .await
    }

    /// Report unreported traffic to the authority and mirror its verdict.
    /// Safe to call repeatedly; a non-Ok verdict disposes the session.
    pub async fn sync(&self) -> anyhow::Result<()> {
        self.report_usage(false).await
    }

    async fn report_usage(&self, closing: bool) -> anyhow::Result<()> {
        let _guard = self.sync_lock.lock().await;
        let sent = self
            .sent_bytes
            .load(Ordering::Relaxed)
            .saturating_sub(self.reported_sent.load(Ordering::Relaxed));
        let received = self
            .received_bytes
            .load(Ordering::Relaxed)
            .saturating_sub(self.reported_received.load(Ordering::Relaxed));

        let response = self
            .access
            .session_add_usage(
                self.session_id,
                UsageInfo {
                    sent_bytes: sent,
                    received_bytes: received,
                },
                closing,
            )
            .await?;

        self.reported_sent.fetch_add(sent, Ordering::Relaxed);
        self.reported_received.fetch_add(received, Ordering::Relaxed);

        let code = response.error_code;
        *self.response.write() = response;
        if code != SessionErrorCode::Ok {
            info!("session {} ended by authority ({code:?})", self.session_id);
            self.dispose();
        }
        Ok(())
    }

    /// Cooperative close: flush usage, mark closed, tear down.
    pub async fn close(&self) {
        if self.is_disposed() {
            return;
        }
        if let Err(e) = self.report_usage(true).await {
            warn!(
                "session {} failed to flush usage on close: {e:#}",
                self.session_id
            );
        }
        {
            let mut response = self.response.write();
            if response.error_code == SessionErrorCode::Ok {
                response.error_code = SessionErrorCode::SessionClosed;
                response.error_message = Some("Session closed by client.".to_string());
            }
        }
        self.dispose();
    }

    /// Unconditional teardown. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owns_pool {
            self.udp_pool.dispose();
        }
        debug!("session {} disposed", self.session_id);
    }
}

/// Bridges inbound proxy datagrams back into the client tunnel: each reply
/// is rebuilt as an IP/UDP packet addressed remote -> client source.
struct InboundUdpSink {
    packet_sink: Arc<dyn PacketSink>,
    received_bytes: Arc<AtomicU64>,
    last_activity: Arc<RwLock<Instant>>,
}

impl DatagramSink for InboundUdpSink {
    fn on_datagram(&self, remote: SocketAddr, client: SocketAddr, data: Bytes) {
        match packet::build_udp_packet(remote, client, &data) {
            Ok(ip_packet) => {
                self.received_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                *self.last_activity.write() = Instant::now();
                self.packet_sink.push_packet(Bytes::from(ip_packet));
            }
            Err(e) => debug!("dropping inbound datagram from {remote}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessUsage, SessionCreateRequest};
    use crate::sockets::SystemSocketFactory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::net::IpAddr;

    struct RecordingAccess {
        usage_calls: Mutex<Vec<(UsageInfo, bool)>>,
        usage_response: Mutex<SessionResponse>,
    }

    impl RecordingAccess {
        fn new() -> Self {
            Self {
                usage_calls: Mutex::new(Vec::new()),
                usage_response: Mutex::new(SessionResponse::ok()),
            }
        }
    }

    #[async_trait]
    impl AccessAuthority for RecordingAccess {
        async fn session_create(
            &self,
            _request: SessionCreateRequest,
        ) -> anyhow::Result<SessionResponseEx> {
            anyhow::bail!("not used")
        }

        async fn session_get(
            &self,
            _session_id: u64,
            _host_endpoint: SocketAddr,
            _client_ip: IpAddr,
        ) -> anyhow::Result<SessionResponseEx> {
            anyhow::bail!("not used")
        }

        async fn session_add_usage(
            &self,
            _session_id: u64,
            usage: UsageInfo,
            closing: bool,
        ) -> anyhow::Result<SessionResponse> {
            self.usage_calls.lock().push((usage, closing));
            Ok(self.usage_response.lock().clone())
        }
    }

    struct CollectingSink {
        packets: Mutex<Vec<Bytes>>,
    }

    impl PacketSink for CollectingSink {
        fn push_packet(&self, packet: Bytes) {
            self.packets.lock().push(packet);
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn test_session(access: Arc<RecordingAccess>) -> Arc<Session> {
        Session::new(SessionConfig {
            response: SessionResponseEx {
                response: SessionResponse::ok(),
                session_id: 5,
                session_key: [9u8; 16],
                created_time: 0,
                extra_data: None,
            },
            endpoints: EndpointPair {
                local: addr("203.0.113.5:443"),
                remote: addr("198.51.100.7:50000"),
            },
            protocol_version: 3,
            access,
            packet_sink: Arc::new(CollectingSink {
                packets: Mutex::new(Vec::new()),
            }),
            pool: PoolBinding::Owned {
                socket_factory: Arc::new(SystemSocketFactory),
                observer: None,
                worker_max_count: 4,
                udp_timeout: Duration::from_secs(5),
            },
        })
    }

    #[tokio::test]
    async fn test_sync_reports_traffic_delta_once() {
        let access = Arc::new(RecordingAccess::new());
        let session = test_session(Arc::clone(&access));

        session
            .process_udp(addr("10.0.0.1:100"), addr("127.0.0.1:9100"), Some(b"12345"), None)
            .await
            .unwrap();

        session.sync().await.unwrap();
        session.sync().await.unwrap();

        let calls = access.usage_calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0.sent_bytes, 5);
        // Second sync has nothing new to report
        assert_eq!(calls[1].0.sent_bytes, 0);
    }

    #[tokio::test]
    async fn test_sync_disposes_on_authority_rejection() {
        let access = Arc::new(RecordingAccess::new());
        *access.usage_response.lock() =
            SessionResponse::error(SessionErrorCode::AccessExpired, "expired");
        let session = test_session(Arc::clone(&access));

        session.sync().await.unwrap();

        assert!(session.is_disposed());
        assert_eq!(session.response().error_code, SessionErrorCode::AccessExpired);
    }

    #[tokio::test]
    async fn test_close_flushes_once_and_marks_closed() {
        let access = Arc::new(RecordingAccess::new());
        let session = test_session(Arc::clone(&access));

        session.close().await;
        session.close().await;

        let calls = access.usage_calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1, "close must report with closing=true");
        assert!(session.is_disposed());
        assert_eq!(session.response().error_code, SessionErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn test_process_udp_rejected_after_dispose() {
        let access = Arc::new(RecordingAccess::new());
        let session = test_session(access);
        session.dispose();

        let err = session
            .process_udp(addr("10.0.0.1:100"), addr("127.0.0.1:9101"), Some(b"x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Disposed));
    }

    #[tokio::test]
    async fn test_access_expiry_detection() {
        let access = Arc::new(RecordingAccess::new());
        let session = test_session(access);

        session.set_response(SessionResponse {
            error_code: SessionErrorCode::Ok,
            error_message: None,
            access_usage: Some(AccessUsage {
                expiration_time: Some(1_000),
                ..Default::default()
            }),
        });

        assert!(session.is_access_expired(2_000));
        assert!(!session.is_access_expired(500));
    }
}
