use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket;

/// IP address family of a proxy socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

/// Creates the sockets the data plane forwards through.
///
/// `bind_udp` is synchronous (std bind, then handed to tokio) so worker
/// allocation can run under the pool lock without a suspension point.
pub trait SocketFactory: Send + Sync {
    /// Bind a UDP socket to an ephemeral local port for the given family.
    fn bind_udp(&self, family: AddressFamily) -> io::Result<UdpSocket>;

    /// Toggle the don't-fragment bit for outgoing datagrams.
    fn set_no_fragment(&self, socket: &UdpSocket, enabled: bool) -> io::Result<()>;
}

/// Factory backed by the host network stack.
pub struct SystemSocketFactory;

impl SocketFactory for SystemSocketFactory {
    fn bind_udp(&self, family: AddressFamily) -> io::Result<UdpSocket> {
        let bind_addr: SocketAddr = match family {
            AddressFamily::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
            AddressFamily::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = StdUdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }

    #[cfg(target_os = "linux")]
    fn set_no_fragment(&self, socket: &UdpSocket, enabled: bool) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let value: libc::c_int = if enabled {
            libc::IP_PMTUDISC_DO
        } else {
            libc::IP_PMTUDISC_WANT
        };
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_no_fragment(&self, _socket: &UdpSocket, _enabled: bool) -> io::Result<()> {
        // IPv6 never fragments in-flight and other platforms lack a portable
        // per-socket knob; the hint is best effort.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_udp_ephemeral_v4() {
        let factory = SystemSocketFactory;
        let socket = factory.bind_udp(AddressFamily::V4).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_two_binds_get_distinct_ports() {
        let factory = SystemSocketFactory;
        let a = factory.bind_udp(AddressFamily::V4).unwrap();
        let b = factory.bind_udp(AddressFamily::V4).unwrap();
        assert_ne!(
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port()
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_set_no_fragment_roundtrip() {
        let factory = SystemSocketFactory;
        let socket = factory.bind_udp(AddressFamily::V4).unwrap();
        factory.set_no_fragment(&socket, true).unwrap();
        factory.set_no_fragment(&socket, false).unwrap();
    }
}
