use super::DatagramSink;
use crate::collections::TimeoutMap;
use crate::sockets::{AddressFamily, SocketFactory};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum datagram size (64KB - typical max UDP payload)
const MAX_DATAGRAM_SIZE: usize = 65535;

/// One proxy socket. Each distinct remote endpoint it talks to is bound to
/// exactly one client source, so an inbound reply is demuxed by its sender
/// address alone.
pub struct UdpProxyWorker {
    family: AddressFamily,
    socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
    socket_factory: Arc<dyn SocketFactory>,
    /// destination endpoint -> client source endpoint
    destinations: TimeoutMap<SocketAddr, SocketAddr>,
    last_activity: RwLock<Instant>,
    no_fragment: Mutex<Option<bool>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl UdpProxyWorker {
    pub(super) fn start(
        socket_factory: Arc<dyn SocketFactory>,
        family: AddressFamily,
        sink: Arc<dyn DatagramSink>,
        udp_timeout: Duration,
    ) -> io::Result<Arc<Self>> {
        let socket = Arc::new(socket_factory.bind_udp(family)?);
        let local_endpoint = socket.local_addr()?;

        let worker = Arc::new(Self {
            family,
            socket: Arc::clone(&socket),
            local_endpoint,
            socket_factory,
            destinations: TimeoutMap::new(udp_timeout),
            last_activity: RwLock::new(Instant::now()),
            no_fragment: Mutex::new(None),
            recv_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Self::recv_loop(
            socket,
            Arc::downgrade(&worker),
            sink,
        ));
        *worker.recv_task.lock() = Some(handle);

        debug!("UDP worker started on {local_endpoint}");
        Ok(worker)
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    /// Whether this worker already proxies a flow toward `destination`.
    pub fn owns_destination(&self, destination: &SocketAddr) -> bool {
        self.destinations.contains_key(destination)
    }

    pub(super) fn add_destination(&self, destination: SocketAddr, source: SocketAddr) {
        self.destinations.insert(destination, source);
    }

    pub(super) fn set_timeout(&self, timeout: Duration) {
        self.destinations.set_timeout(timeout);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    pub(super) fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity().elapsed() >= timeout
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Transmit toward a remote destination. Socket errors are logged and do
    /// not poison the worker; proxying is best effort.
    pub async fn send_to(
        &self,
        destination: SocketAddr,
        payload: &[u8],
        no_fragment: Option<bool>,
    ) {
        if let Some(df) = no_fragment {
            let mut current = self.no_fragment.lock();
            if *current != Some(df) {
                if let Err(e) = self.socket_factory.set_no_fragment(&self.socket, df) {
                    debug!("setting no-fragment on {} failed: {e}", self.local_endpoint);
                }
                *current = Some(df);
            }
        }

        self.touch();
        if let Err(e) = self.socket.send_to(payload, destination).await {
            warn!(
                "UDP send from {} to {destination} failed: {e}",
                self.local_endpoint
            );
        }
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        worker: std::sync::Weak<UdpProxyWorker>,
        sink: Arc<dyn DatagramSink>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, remote)) => {
                    let Some(worker) = worker.upgrade() else {
                        break;
                    };
                    let Some(client) = worker.destinations.get(&remote) else {
                        // Unknown remotes are dropped without a trace on the
                        // wire; logging keeps the event observable.
                        debug!(
                            "dropping datagram from unknown remote {remote} on {}",
                            worker.local_endpoint
                        );
                        continue;
                    };
                    worker.touch();
                    sink.on_datagram(remote, client, Bytes::copy_from_slice(&buf[..len]));
                }
                Err(e) => {
                    let Some(worker) = worker.upgrade() else {
                        break;
                    };
                    if worker.disposed.load(Ordering::Acquire) {
                        break;
                    }
                    debug!("UDP recv on {} failed: {e}", worker.local_endpoint);
                }
            }
        }
    }

    /// Close the socket and stop the recv task. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }
        self.destinations.clear();
        debug!("UDP worker on {} disposed", self.local_endpoint);
    }
}

impl Drop for UdpProxyWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}
