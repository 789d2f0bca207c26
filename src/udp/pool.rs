use super::{
    DatagramSink, EndpointObserver, FlowKey, NewEndpointInfo, ProxyError, TransportProtocol,
    UdpProxyWorker,
};
use crate::collections::{TimeoutMap, TimeoutSet};
use crate::sockets::{AddressFamily, SocketFactory};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default idle timeout for flows, workers and map entries.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(120);

/// The remote-endpoint set starts with its own shorter default until the
/// pool timeout is set explicitly.
const DEFAULT_REMOTE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Multiplexes client UDP flows onto a bounded set of proxy workers.
///
/// Allocation is first-fit over existing workers, refusing any worker that
/// already proxies the flow's destination: replies from a destination to a
/// worker socket must identify exactly one client source.
pub struct UdpProxyPool {
    socket_factory: Arc<dyn SocketFactory>,
    /// Sink handed to every worker; wraps the owner's sink with counters.
    sink: Arc<dyn DatagramSink>,
    observer: Option<Arc<dyn EndpointObserver>>,
    flows: TimeoutMap<FlowKey, Arc<UdpProxyWorker>>,
    workers: Mutex<Vec<Arc<UdpProxyWorker>>>,
    remote_endpoints: TimeoutSet<SocketAddr>,
    udp_timeout: RwLock<Duration>,
    worker_max_count: usize,
    last_watch: Mutex<Instant>,
    counters: Arc<PoolCounters>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct PoolCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone)]
pub struct UdpProxyPoolStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub worker_count: usize,
}

struct CountingSink {
    inner: Arc<dyn DatagramSink>,
    counters: Arc<PoolCounters>,
}

impl DatagramSink for CountingSink {
    fn on_datagram(&self, remote: SocketAddr, client: SocketAddr, data: Bytes) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.inner.on_datagram(remote, client, data);
    }
}

impl UdpProxyPool {
    pub fn new(
        socket_factory: Arc<dyn SocketFactory>,
        sink: Arc<dyn DatagramSink>,
        observer: Option<Arc<dyn EndpointObserver>>,
        worker_max_count: usize,
    ) -> Self {
        let counters = Arc::new(PoolCounters::default());
        Self {
            socket_factory,
            sink: Arc::new(CountingSink {
                inner: sink,
                counters: Arc::clone(&counters),
            }),
            observer,
            flows: TimeoutMap::new(DEFAULT_UDP_TIMEOUT),
            workers: Mutex::new(Vec::new()),
            remote_endpoints: TimeoutSet::new(DEFAULT_REMOTE_ENDPOINT_TIMEOUT),
            udp_timeout: RwLock::new(DEFAULT_UDP_TIMEOUT),
            worker_max_count,
            last_watch: Mutex::new(Instant::now()),
            counters,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn udp_timeout(&self) -> Duration {
        *self.udp_timeout.read()
    }

    /// Change the idle timeout. Takes effect on the connection map, the
    /// remote-endpoint set, the watchdog cadence and every worker's
    /// destination map before returning.
    pub fn set_udp_timeout(&self, timeout: Duration) {
        *self.udp_timeout.write() = timeout;
        self.flows.set_timeout(timeout);
        self.remote_endpoints.set_timeout(timeout);
        for worker in self.workers.lock().iter() {
            worker.set_timeout(timeout);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn stats(&self) -> UdpProxyPoolStats {
        UdpProxyPoolStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            worker_count: self.worker_count(),
        }
    }

    /// Forward one client datagram toward `destination`, allocating a worker
    /// for the flow when needed.
    pub async fn send_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Option<&[u8]>,
        no_fragment: Option<bool>,
    ) -> Result<(), ProxyError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ProxyError::Disposed);
        }
        self.maybe_watch();

        let key = FlowKey {
            source,
            destination,
        };
        let worker = match self.flows.get(&key) {
            Some(worker) => worker,
            None => self.allocate_flow(key)?,
        };

        let data = payload.unwrap_or_default();
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        worker.send_to(destination, data, no_fragment).await;
        Ok(())
    }

    fn allocate_flow(&self, key: FlowKey) -> Result<Arc<UdpProxyWorker>, ProxyError> {
        let family = AddressFamily::of(&key.destination);
        let worker;
        let event;
        {
            let mut workers = self.workers.lock();

            // Lost the allocation race to a concurrent sender
            if let Some(existing) = self.flows.get(&key) {
                return Ok(existing);
            }

            let reusable = workers
                .iter()
                .find(|w| w.family() == family && !w.owns_destination(&key.destination))
                .cloned();
            let (chosen, is_new_local) = match reusable {
                Some(w) => (w, false),
                None => {
                    if workers.len() >= self.worker_max_count {
                        return Err(ProxyError::ClientQuota {
                            worker_count: workers.len(),
                        });
                    }
                    let w = UdpProxyWorker::start(
                        Arc::clone(&self.socket_factory),
                        family,
                        Arc::clone(&self.sink),
                        self.udp_timeout(),
                    )?;
                    workers.push(Arc::clone(&w));
                    (w, true)
                }
            };

            chosen.add_destination(key.destination, key.source);
            let is_new_remote = self.remote_endpoints.try_insert(key.destination);
            self.flows.insert(key, Arc::clone(&chosen));

            event = NewEndpointInfo {
                protocol: TransportProtocol::Udp,
                local_endpoint: chosen.local_endpoint(),
                remote_endpoint: key.destination,
                is_new_local,
                is_new_remote,
            };
            worker = chosen;
        }

        debug!(
            "UDP flow {} -> {} on worker {} (new_local={}, new_remote={})",
            key.source,
            key.destination,
            event.local_endpoint,
            event.is_new_local,
            event.is_new_remote
        );
        if let Some(observer) = &self.observer {
            observer.on_new_endpoint(&event);
        }
        Ok(worker)
    }

    /// Interval-gated watchdog trigger for the hot path.
    fn maybe_watch(&self) {
        let due = {
            let Some(mut last) = self.last_watch.try_lock() else {
                return;
            };
            if last.elapsed() < self.udp_timeout() {
                return;
            }
            *last = Instant::now();
            true
        };
        if due {
            self.do_watch();
        }
    }

    /// Reclaim idle workers and sweep the derived maps. Disposal happens
    /// after the pool lock is released.
    pub fn do_watch(&self) {
        let timeout = self.udp_timeout();
        let removed: Vec<Arc<UdpProxyWorker>> = {
            let mut workers = self.workers.lock();
            let mut removed = Vec::new();
            workers.retain(|worker| {
                if worker.is_idle(timeout) {
                    removed.push(Arc::clone(worker));
                    false
                } else {
                    true
                }
            });
            removed
        };
        for worker in removed {
            debug!("reclaiming idle UDP worker on {}", worker.local_endpoint());
            worker.dispose();
        }
        self.flows.cleanup();
        self.remote_endpoints.cleanup();
    }

    /// Dispose every worker and the derived maps. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<Arc<UdpProxyWorker>> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.dispose();
        }
        self.flows.clear();
        self.remote_endpoints.clear();
        debug!("UDP proxy pool disposed");
    }
}

impl Drop for UdpProxyPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets::SystemSocketFactory;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout as tokio_timeout;

    struct NullSink;

    impl DatagramSink for NullSink {
        fn on_datagram(&self, _remote: SocketAddr, _client: SocketAddr, _data: Bytes) {}
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<(SocketAddr, SocketAddr, Bytes)>,
    }

    impl DatagramSink for ChannelSink {
        fn on_datagram(&self, remote: SocketAddr, client: SocketAddr, data: Bytes) {
            let _ = self.tx.send((remote, client, data));
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<NewEndpointInfo>>,
    }

    impl EndpointObserver for RecordingObserver {
        fn on_new_endpoint(&self, info: &NewEndpointInfo) {
            self.events.lock().push(info.clone());
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn test_pool(max_workers: usize) -> UdpProxyPool {
        UdpProxyPool::new(
            Arc::new(SystemSocketFactory),
            Arc::new(NullSink),
            None,
            max_workers,
        )
    }

    #[tokio::test]
    async fn test_first_fit_allocation() {
        let pool = test_pool(2);
        let dst_x = addr("127.0.0.1:9001");
        let dst_y = addr("127.0.0.1:9002");
        let dst_z = addr("127.0.0.1:9003");

        // A opens worker 1 with dstX
        pool.send_packet(addr("10.0.0.1:100"), dst_x, Some(b"a"), None)
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 1);

        // B cannot share a worker that already holds dstX
        pool.send_packet(addr("10.0.0.2:100"), dst_x, Some(b"b"), None)
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 2);

        // C fits on worker 1 because dstY is free there
        pool.send_packet(addr("10.0.0.3:100"), dst_y, Some(b"c"), None)
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 2);

        // D reuses an existing worker; the pool is full but not over quota
        pool.send_packet(addr("10.0.0.4:100"), dst_z, Some(b"d"), None)
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 2);

        // Flows toward the same destination landed on distinct workers
        let w_a = pool
            .flows
            .get(&FlowKey {
                source: addr("10.0.0.1:100"),
                destination: dst_x,
            })
            .unwrap();
        let w_b = pool
            .flows
            .get(&FlowKey {
                source: addr("10.0.0.2:100"),
                destination: dst_x,
            })
            .unwrap();
        let w_c = pool
            .flows
            .get(&FlowKey {
                source: addr("10.0.0.3:100"),
                destination: dst_y,
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&w_a, &w_b));
        assert!(Arc::ptr_eq(&w_a, &w_c));
        assert!(w_a.owns_destination(&dst_x));
        assert!(w_b.owns_destination(&dst_x));
        assert!(!w_b.owns_destination(&dst_y));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_leaves_pool_unchanged() {
        let pool = test_pool(1);
        let dst_x = addr("127.0.0.1:9010");

        pool.send_packet(addr("10.0.0.1:100"), dst_x, Some(b"a"), None)
            .await
            .unwrap();

        let err = pool
            .send_packet(addr("10.0.0.2:100"), dst_x, Some(b"b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClientQuota { worker_count: 1 }));
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.flows.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_workers_reclaimed() {
        let pool = test_pool(4);
        pool.set_udp_timeout(Duration::from_millis(80));

        pool.send_packet(addr("10.0.0.1:100"), addr("127.0.0.1:9020"), Some(b"a"), None)
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.do_watch();

        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.flows.len(), 0);
    }

    #[tokio::test]
    async fn test_set_udp_timeout_propagates() {
        let pool = test_pool(2);
        assert_eq!(
            pool.remote_endpoints.timeout(),
            DEFAULT_REMOTE_ENDPOINT_TIMEOUT
        );

        let timeout = Duration::from_secs(5);
        pool.set_udp_timeout(timeout);

        assert_eq!(pool.udp_timeout(), timeout);
        assert_eq!(pool.flows.timeout(), timeout);
        assert_eq!(pool.remote_endpoints.timeout(), timeout);
    }

    #[tokio::test]
    async fn test_new_endpoint_events() {
        let observer = Arc::new(RecordingObserver::default());
        let pool = UdpProxyPool::new(
            Arc::new(SystemSocketFactory),
            Arc::new(NullSink),
            Some(observer.clone() as Arc<dyn EndpointObserver>),
            4,
        );
        let dst_x = addr("127.0.0.1:9030");
        let dst_y = addr("127.0.0.1:9031");

        pool.send_packet(addr("10.0.0.1:100"), dst_x, Some(b"a"), None)
            .await
            .unwrap();
        pool.send_packet(addr("10.0.0.2:100"), dst_x, Some(b"b"), None)
            .await
            .unwrap();
        pool.send_packet(addr("10.0.0.3:100"), dst_y, Some(b"c"), None)
            .await
            .unwrap();

        let events = observer.events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.protocol == TransportProtocol::Udp));
        // First flow: brand-new worker and remote
        assert!(events[0].is_new_local && events[0].is_new_remote);
        // Same destination through a second worker: remote already known
        assert!(events[1].is_new_local && !events[1].is_new_remote);
        // New destination on the first worker
        assert!(!events[2].is_new_local && events[2].is_new_remote);
    }

    #[tokio::test]
    async fn test_inbound_reply_reaches_client_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = UdpProxyPool::new(
            Arc::new(SystemSocketFactory),
            Arc::new(ChannelSink { tx }),
            None,
            4,
        );

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let client = addr("10.1.1.1:7777");

        pool.send_packet(client, remote_addr, Some(b"ping"), None)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, worker_addr) = tokio_timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");

        remote.send_to(b"pong", worker_addr).await.unwrap();
        let (from, to, data) = tokio_timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, remote_addr);
        assert_eq!(to, client);
        assert_eq!(&data[..], b"pong");

        let stats = pool.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_unknown_remote_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = UdpProxyPool::new(
            Arc::new(SystemSocketFactory),
            Arc::new(ChannelSink { tx }),
            None,
            4,
        );

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        pool.send_packet(addr("10.1.1.1:7777"), remote_addr, Some(b"ping"), None)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (_, worker_addr) = tokio_timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // A stranger writes to the worker socket
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"intruder", worker_addr).await.unwrap();

        assert!(
            tokio_timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_rejects_sends() {
        let pool = test_pool(2);
        pool.send_packet(addr("10.0.0.1:100"), addr("127.0.0.1:9040"), Some(b"a"), None)
            .await
            .unwrap();

        pool.dispose();
        pool.dispose();

        assert_eq!(pool.worker_count(), 0);
        let err = pool
            .send_packet(addr("10.0.0.1:100"), addr("127.0.0.1:9040"), Some(b"a"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Disposed));
    }

    #[tokio::test]
    async fn test_empty_payload_is_sent() {
        let pool = test_pool(2);
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        pool.send_packet(addr("10.0.0.1:100"), remote_addr, None, None)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = tokio_timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 0);
    }
}
