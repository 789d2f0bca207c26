use super::{
    EndpointPair, HelloRequest, KeyedLocks, PacketSink, PoolBinding, Session, SessionConfig,
    SessionError, SessionRequest,
};
use crate::access::{
    AccessAuthority, SessionCreateRequest, SessionErrorCode, SessionExtraData, SessionResponse,
    SessionResponseEx, unix_now_millis,
};
use crate::analytics::{AnalyticsEvent, AnalyticsTracker};
use crate::sockets::SocketFactory;
use crate::udp::{DatagramRouter, DatagramSink, EndpointObserver, UdpProxyPool};
use anyhow::anyhow;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Heartbeat analytics fire at most once per this interval, regardless of
/// how often the outer job runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);

/// Fixed ASCII tag clients mix into the API-key derivation.
const HTTP_PASS_CHECK: &[u8] = b"TunnelHttpPassCheck";

pub const SERVER_SECRET_LEN: usize = 128;

/// Whether each session owns a private proxy pool or all sessions share a
/// server-wide one. Both satisfy the same flow invariants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    #[default]
    PerSession,
    Shared,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Idle time after which a session is removed and disposed.
    pub session_timeout: Duration,
    /// Cadence of the periodic cleanup job.
    pub cleanup_interval: Duration,
    pub udp_timeout: Duration,
    pub worker_max_count: usize,
    pub pool_mode: PoolMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(30),
            udp_timeout: crate::udp::DEFAULT_UDP_TIMEOUT,
            worker_max_count: 32,
            pool_mode: PoolMode::PerSession,
        }
    }
}

struct SecretState {
    secret: Vec<u8>,
    api_key: Vec<u8>,
}

/// Owns the set of live sessions: authenticates requests, creates sessions
/// through the access authority, recovers sessions lost from memory, and
/// drives periodic cleanup and heartbeat.
pub struct SessionManager {
    sessions: DashMap<u64, Arc<Session>>,
    access: Arc<dyn AccessAuthority>,
    socket_factory: Arc<dyn SocketFactory>,
    analytics: Option<Arc<dyn AnalyticsTracker>>,
    endpoint_observer: Option<Arc<dyn EndpointObserver>>,
    options: SessionOptions,
    server_version: String,
    secret: ArcSwap<SecretState>,
    recover_locks: KeyedLocks,
    heartbeat_gate: Mutex<Option<Instant>>,
    shared_pool: Option<Arc<UdpProxyPool>>,
    shared_router: Option<Arc<DatagramRouter>>,
    disposed: AtomicBool,
    dispose_latch: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
}

impl SessionManager {
    pub fn new(
        access: Arc<dyn AccessAuthority>,
        socket_factory: Arc<dyn SocketFactory>,
        analytics: Option<Arc<dyn AnalyticsTracker>>,
        endpoint_observer: Option<Arc<dyn EndpointObserver>>,
        options: SessionOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let mut secret = vec![0u8; SERVER_SECRET_LEN];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| anyhow!("system RNG unavailable"))?;

        let (shared_pool, shared_router) = match options.pool_mode {
            PoolMode::Shared => {
                let router = DatagramRouter::new(options.udp_timeout);
                let pool = UdpProxyPool::new(
                    Arc::clone(&socket_factory),
                    Arc::clone(&router) as Arc<dyn DatagramSink>,
                    endpoint_observer.clone(),
                    options.worker_max_count,
                );
                pool.set_udp_timeout(options.udp_timeout);
                (Some(Arc::new(pool)), Some(router))
            }
            PoolMode::PerSession => (None, None),
        };

        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            access,
            socket_factory,
            analytics,
            endpoint_observer,
            options,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            secret: ArcSwap::from_pointee(SecretState {
                secret: Vec::new(),
                api_key: Vec::new(),
            }),
            recover_locks: KeyedLocks::new(),
            heartbeat_gate: Mutex::new(None),
            shared_pool,
            shared_router,
            disposed: AtomicBool::new(false),
            dispose_latch: Mutex::new(None),
        });
        manager.set_server_secret(&secret);
        Ok(manager)
    }

    /// Replace the server secret; the derived API key updates atomically
    /// with it.
    pub fn set_server_secret(&self, secret: &[u8]) {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let tag = hmac::sign(&key, HTTP_PASS_CHECK);
        self.secret.store(Arc::new(SecretState {
            secret: secret.to_vec(),
            api_key: tag.as_ref().to_vec(),
        }));
    }

    pub fn server_secret(&self) -> Vec<u8> {
        self.secret.load().secret.clone()
    }

    pub fn api_key(&self) -> Vec<u8> {
        self.secret.load().api_key.clone()
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn session(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Authorize a new client against the access authority and materialize
    /// its session. Authority access denials reach the client as a generic
    /// unauthorized error only.
    pub async fn create_session(
        &self,
        request: &HelloRequest,
        endpoints: EndpointPair,
        packet_sink: Arc<dyn PacketSink>,
    ) -> Result<SessionResponseEx, SessionError> {
        let authority_request = SessionCreateRequest {
            host_endpoint: endpoints.local,
            client_ip: endpoints.remote.ip(),
            client_info: request.client_info.clone(),
            encrypted_client_id: request.encrypted_client_id.clone(),
            token_id: request.token_id.clone(),
            extra_data: request.extra_data.clone(),
        };
        let response = self
            .access
            .session_create(authority_request)
            .await
            .map_err(|e| {
                SessionError::rejected(
                    SessionResponse::error(SessionErrorCode::GeneralError, e.to_string()),
                    &request.request_id,
                )
            })?;

        match response.response.error_code {
            SessionErrorCode::Ok => {}
            SessionErrorCode::AccessError => {
                // Do not leak the authority's reasoning to the client
                debug!(
                    "access denied for token {}: {:?}",
                    request.token_id, response.response.error_message
                );
                return Err(SessionError::unauthorized("Access Error."));
            }
            _ => {
                return Err(SessionError::rejected(
                    response.response.clone(),
                    &request.request_id,
                ));
            }
        }

        self.create_session_internal(&response, endpoints, packet_sink, &request.request_id)?;
        self.track_new_session(&request.client_info.client_version);
        Ok(response)
    }

    /// Resolve a request to its live session, recovering it from the access
    /// authority when it is not in memory.
    pub async fn get_session(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
        packet_sink: Arc<dyn PacketSink>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = match self.find_session(request)? {
            Some(session) => session,
            None => {
                self.recover_session(request, endpoints, packet_sink)
                    .await?
            }
        };

        let response = session.response();
        if response.error_code != SessionErrorCode::Ok {
            return Err(SessionError::rejected(response, &request.request_id));
        }
        if session.is_disposed() {
            return Err(SessionError::session_closed(response, &request.request_id));
        }
        session.touch();
        Ok(session)
    }

    fn find_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let Some(session) = self.session(request.session_id) else {
            return Ok(None);
        };
        if !keys_match(session.session_key(), &request.session_key) {
            return Err(SessionError::unauthorized("Invalid session key."));
        }
        Ok(Some(session))
    }

    /// Serialized per session id so the authority sees at most one
    /// `session_get` in flight for it; concurrent callers join the winner.
    async fn recover_session(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
        packet_sink: Arc<dyn PacketSink>,
    ) -> Result<Arc<Session>, SessionError> {
        let _guard = self.recover_locks.lock(request.session_id).await;

        // Someone else may have recovered it while we waited
        if let Some(session) = self.find_session(request)? {
            return Ok(session);
        }

        info!(
            "recovering session {} from the access authority",
            request.session_id
        );
        match self
            .try_recover(request, endpoints, Arc::clone(&packet_sink))
            .await
        {
            Ok(session) => Ok(session),
            Err(err) => {
                warn!("session {} recovery failed: {err}", request.session_id);
                // Cache the failure so follow-up requests stop re-hitting
                // the authority until cleanup evicts the tombstone.
                let dead = SessionResponseEx {
                    response: SessionResponse::error(
                        SessionErrorCode::SessionError,
                        err.to_string(),
                    ),
                    session_id: request.session_id,
                    session_key: request.session_key,
                    created_time: unix_now_millis(),
                    extra_data: None,
                };
                if let Ok(session) =
                    self.create_session_internal(&dead, endpoints, packet_sink, &request.request_id)
                {
                    session.dispose();
                }
                Err(err)
            }
        }
    }

    async fn try_recover(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
        packet_sink: Arc<dyn PacketSink>,
    ) -> Result<Arc<Session>, SessionError> {
        let response = self
            .access
            .session_get(request.session_id, endpoints.local, endpoints.remote.ip())
            .await
            .map_err(|e| {
                SessionError::rejected(
                    SessionResponse::error(SessionErrorCode::SessionError, e.to_string()),
                    &request.request_id,
                )
            })?;

        if !keys_match(&response.session_key, &request.session_key) {
            return Err(SessionError::unauthorized("Invalid session key."));
        }
        if response.response.error_code != SessionErrorCode::Ok {
            // The caller proved it holds the key; authority detail may surface
            return Err(SessionError::rejected(
                response.response.clone(),
                &request.request_id,
            ));
        }
        self.create_session_internal(&response, endpoints, packet_sink, &request.request_id)
    }

    fn create_session_internal(
        &self,
        response: &SessionResponseEx,
        endpoints: EndpointPair,
        packet_sink: Arc<dyn PacketSink>,
        request_id: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let extra = match response.extra_data.as_deref() {
            None | Some("") => SessionExtraData::default(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!(
                    "session {}: unreadable extra data ({e}), using defaults",
                    response.session_id
                );
                SessionExtraData::default()
            }),
        };

        let pool = match (&self.shared_pool, &self.shared_router) {
            (Some(pool), Some(router)) => PoolBinding::Shared {
                pool: Arc::clone(pool),
                router: Arc::clone(router),
            },
            _ => PoolBinding::Owned {
                socket_factory: Arc::clone(&self.socket_factory),
                observer: self.endpoint_observer.clone(),
                worker_max_count: self.options.worker_max_count,
                udp_timeout: self.options.udp_timeout,
            },
        };

        let session = Session::new(SessionConfig {
            response: response.clone(),
            endpoints,
            protocol_version: extra.protocol_version,
            access: Arc::clone(&self.access),
            packet_sink,
            pool,
        });

        match self.sessions.entry(response.session_id) {
            Entry::Occupied(_) => {
                // An id collision must not occur; fail closed if it does
                session.set_response(SessionResponse::error(
                    SessionErrorCode::SessionError,
                    "Could not add session to collection.",
                ));
                let failure = session.response();
                session.dispose();
                Err(SessionError::rejected(failure, request_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                info!(
                    "session {} created for {}",
                    response.session_id, endpoints.remote
                );
                Ok(session)
            }
        }
    }

    fn track_new_session(&self, client_version: &str) {
        let Some(analytics) = self.analytics.clone() else {
            return;
        };
        let event = AnalyticsEvent::new_session(client_version, &self.server_version);
        tokio::spawn(async move {
            // Fire and forget
            let _ = analytics.track(event).await;
        });
    }

    /// Close one session, flushing its usage to the authority. Unknown ids
    /// are not an error.
    pub async fn close_session(&self, session_id: u64) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        session.close().await;
    }

    /// Push usage of every live session to the authority; per-session
    /// failures never abort the batch.
    pub async fn sync_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let results = futures::future::join_all(sessions.iter().map(|s| s.sync())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!("session {} sync failed: {e:#}", session.session_id());
            }
        }
    }

    /// Periodic job body: heartbeat (self-debounced) followed by cleanup.
    pub async fn run_job(&self) {
        self.heartbeat();
        self.cleanup().await;
    }

    fn heartbeat(&self) {
        let Some(analytics) = self.analytics.clone() else {
            return;
        };
        let due = {
            let Some(mut last) = self.heartbeat_gate.try_lock() else {
                return;
            };
            match *last {
                Some(fired) if fired.elapsed() < HEARTBEAT_INTERVAL => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if !due {
            return;
        }

        let session_count = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_disposed())
            .count();
        tokio::spawn(async move {
            let _ = analytics
                .track(AnalyticsEvent::Heartbeat { session_count })
                .await;
        });
    }

    /// Two passes: sync sessions whose access window expired (the authority
    /// marks them closed), then drop disposed and idle sessions.
    pub async fn cleanup(&self) {
        let now = unix_now_millis();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                !session.is_disposed() && session.is_access_expired(now)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in expired {
            if let Err(e) = session.sync().await {
                warn!(
                    "session {} expiry sync failed: {e:#}",
                    session.session_id()
                );
            }
        }

        let min_activity = Instant::now().checked_sub(self.options.session_timeout);
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.is_disposed()
                    || min_activity.is_some_and(|min| session.last_activity() < min)
            })
            .map(|entry| *entry.key())
            .collect();
        for session_id in stale {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                debug!("removing session {session_id}");
                session.dispose();
            }
        }
    }

    /// Spawn the interval task that drives `run_job`; stops once the manager
    /// is disposed.
    pub fn start_job_runner(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.options.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if manager.is_disposed() {
                    break;
                }
                manager.run_job().await;
            }
        })
    }

    /// Dispose every session and the shared pool. A concurrent second call
    /// joins the same in-flight disposal.
    pub async fn dispose(self: &Arc<Self>) {
        let task = {
            let mut latch = self.dispose_latch.lock();
            match latch.as_ref() {
                Some(task) => task.clone(),
                None => {
                    let manager = Arc::clone(self);
                    let task = async move {
                        manager.disposed.store(true, Ordering::Release);
                        let sessions: Vec<Arc<Session>> = manager
                            .sessions
                            .iter()
                            .map(|entry| Arc::clone(entry.value()))
                            .collect();
                        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
                        manager.sessions.clear();
                        if let Some(pool) = &manager.shared_pool {
                            pool.dispose();
                        }
                        info!("session manager disposed");
                    }
                    .boxed()
                    .shared();
                    *latch = Some(task.clone());
                    task
                }
            }
        };
        task.await;
    }
}

fn keys_match(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}
