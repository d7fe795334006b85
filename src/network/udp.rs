//! UDP socket helpers
//!
//! Device specifier parsing, socket creation through socket2 and the
//! best-effort "bytes still queued for output" query.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::error::ConfigError;

/// Kernel receive buffer requested for audio sockets
const RECV_BUFFER_BYTES: usize = 256 * 1024;

/// Network endpoint of a device; either half may be unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointAddress {
    pub ip: Option<IpAddr>,
    /// 0 means unset
    pub port: u16,
}

impl EndpointAddress {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.port == 0
    }

    /// Complete destination, if both address and port are set
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.ip {
            Some(ip) if self.port != 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }

    fn domain(&self) -> Domain {
        match self.ip {
            Some(IpAddr::V6(_)) => Domain::IPV6,
            _ => Domain::IPV4,
        }
    }
}

/// Parsed `<tag>:<address>:<port>` specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub tag: String,
    pub endpoint: EndpointAddress,
}

impl DeviceSpec {
    /// Parse a specifier; an empty address or port means "unset"
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = spec.split(':').collect();
        let [tag, addr, port] = fields[..] else {
            return Err(ConfigError::InvalidSpecifier(spec.to_string()));
        };
        if tag.is_empty() {
            return Err(ConfigError::InvalidSpecifier(spec.to_string()));
        }

        let ip = if addr.is_empty() {
            None
        } else {
            Some(addr.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
                spec: spec.to_string(),
                addr: addr.to_string(),
            })?)
        };

        let port = if port.is_empty() {
            0
        } else if port.bytes().all(|b| b.is_ascii_digit()) {
            port.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                spec: spec.to_string(),
                port: port.to_string(),
            })?
        } else {
            return Err(ConfigError::InvalidPort {
                spec: spec.to_string(),
                port: port.to_string(),
            });
        };

        Ok(Self {
            tag: tag.to_string(),
            endpoint: EndpointAddress { ip, port },
        })
    }
}

/// Unbound non-blocking UDP socket for sending towards `endpoint`
pub fn create_send_socket(endpoint: &EndpointAddress) -> io::Result<UdpSocket> {
    let socket = new_udp_socket(endpoint.domain())?;
    Ok(socket.into())
}

/// Create a non-blocking UDP socket of the endpoint's family
pub fn create_socket(endpoint: &EndpointAddress) -> io::Result<Socket> {
    new_udp_socket(endpoint.domain())
}

/// Bind `socket` to the wildcard address on `port`
pub fn bind_socket(socket: Socket, endpoint: &EndpointAddress) -> io::Result<UdpSocket> {
    let ip: IpAddr = match endpoint.domain() {
        Domain::IPV6 => Ipv6Addr::UNSPECIFIED.into(),
        _ => Ipv4Addr::UNSPECIFIED.into(),
    };
    let addr = SocketAddr::new(ip, endpoint.port);
    socket.bind(&addr.into())?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::debug!("Could not set receive buffer size: {}", e);
    }
    Ok(socket.into())
}

fn new_udp_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Best-effort estimate of bytes queued for output on a socket
pub trait OutputQueueProbe: Send + Sync {
    /// `None` when the platform cannot tell
    fn pending_output_bytes(&self, socket: &UdpSocket) -> Option<usize>;
}

/// Asks the kernel (`TIOCOUTQ`) where supported
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketQueueProbe;

impl OutputQueueProbe for SocketQueueProbe {
    #[cfg(target_os = "linux")]
    fn pending_output_bytes(&self, socket: &UdpSocket) -> Option<usize> {
        use std::os::unix::io::AsRawFd;

        let mut len: libc::c_int = 0;
        // SAFETY: the fd is valid for the lifetime of `socket` and TIOCOUTQ
        // writes a single c_int through the pointer.
        let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::TIOCOUTQ, &mut len) };
        if rc == -1 {
            return None;
        }
        Some(len.max(0) as usize)
    }

    #[cfg(not(target_os = "linux"))]
    fn pending_output_bytes(&self, _socket: &UdpSocket) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_specifier() {
        let spec = DeviceSpec::parse("udp:127.0.0.1:10000").unwrap();
        assert_eq!(spec.tag, "udp");
        assert_eq!(
            spec.endpoint.socket_addr(),
            Some("127.0.0.1:10000".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_unset_fields() {
        let spec = DeviceSpec::parse("udp::10000").unwrap();
        assert_eq!(spec.endpoint.ip, None);
        assert_eq!(spec.endpoint.port, 10000);
        assert_eq!(spec.endpoint.socket_addr(), None);

        let spec = DeviceSpec::parse("udp:10.0.0.1:").unwrap();
        assert_eq!(spec.endpoint.port, 0);
        assert!(!spec.endpoint.is_empty());

        assert!(DeviceSpec::parse("udp::").unwrap().endpoint.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "udp",
            "udp:127.0.0.1",
            "udp:127.0.0.1:5000:1",
            ":127.0.0.1:5000",
            "udp:localhost:5000",
            "udp:300.1.1.1:5000",
            "udp:127.0.0.1:port",
            "udp:127.0.0.1:-1",
            "udp:127.0.0.1:+5",
            "udp:127.0.0.1:70000",
        ] {
            assert!(DeviceSpec::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_bind_and_query_output_queue() {
        let endpoint = EndpointAddress {
            ip: None,
            port: 0,
        };
        let sock = bind_socket(create_socket(&endpoint).unwrap(), &endpoint).unwrap();
        let pending = SocketQueueProbe.pending_output_bytes(&sock);
        if cfg!(target_os = "linux") {
            assert_eq!(pending, Some(0));
        } else {
            assert_eq!(pending, None);
        }
    }
}
