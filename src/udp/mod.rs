//! NAT-like UDP proxying: client flows are multiplexed onto a bounded set of
//! proxy sockets and inbound replies are demuxed purely by remote endpoint.

mod pool;
mod worker;

pub use pool::{DEFAULT_UDP_TIMEOUT, UdpProxyPool, UdpProxyPoolStats};
pub use worker::UdpProxyWorker;

use crate::collections::TimeoutMap;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The smallest unit routed by the pool: one client source talking to one
/// remote destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// Emitted synchronously from the allocation path when a flow lands on an
/// endpoint the pool has not used before.
#[derive(Debug, Clone)]
pub struct NewEndpointInfo {
    pub protocol: TransportProtocol,
    pub local_endpoint: SocketAddr,
    pub remote_endpoint: SocketAddr,
    pub is_new_local: bool,
    pub is_new_remote: bool,
}

pub trait EndpointObserver: Send + Sync {
    fn on_new_endpoint(&self, info: &NewEndpointInfo);
}

/// Upward delivery of inbound datagrams, implemented by the worker's owner.
/// `remote` is the Internet peer the datagram came from; `client` is the
/// tunnel-side source the flow was opened for.
pub trait DatagramSink: Send + Sync {
    fn on_datagram(&self, remote: SocketAddr, client: SocketAddr, data: Bytes);
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Worker quota reached; the caller must shed load.
    #[error("UDP worker quota reached ({worker_count} workers)")]
    ClientQuota { worker_count: usize },

    #[error("UDP socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy pool is disposed")]
    Disposed,
}

/// Demux for a server-wide shared pool: routes each inbound datagram to the
/// sink registered for its client source endpoint.
pub struct DatagramRouter {
    routes: TimeoutMap<SocketAddr, Arc<dyn DatagramSink>>,
}

impl DatagramRouter {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            routes: TimeoutMap::new(timeout),
        })
    }

    /// Register (or refresh) the owner of a client source endpoint.
    pub fn register(&self, client: SocketAddr, sink: Arc<dyn DatagramSink>) {
        if self.routes.get(&client).is_none() {
            self.routes.insert(client, sink);
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.routes.set_timeout(timeout);
    }
}

impl DatagramSink for DatagramRouter {
    fn on_datagram(&self, remote: SocketAddr, client: SocketAddr, data: Bytes) {
        match self.routes.get(&client) {
            Some(sink) => sink.on_datagram(remote, client, data),
            None => debug!("no session route for inbound datagram to {client}, dropped"),
        }
    }
}
