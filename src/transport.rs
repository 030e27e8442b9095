use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

/// Why binding the local endpoint failed.
#[derive(Debug, Fail)]
pub enum BindError {
    #[fail(display = "local address already in use")]
    AddressInUse,
    #[fail(display = "local address invalid or unavailable")]
    AddressInvalid,
    #[fail(display = "socket allocation failed")]
    SocketAllocation,
    #[fail(display = "socket initialization failed")]
    Initialization,
    #[fail(display = "failed to bind socket: {}", _0)]
    Generic(io::Error),
}

impl From<io::Error> for BindError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                BindError::AddressInvalid
            }
            io::ErrorKind::OutOfMemory => BindError::SocketAllocation,
            io::ErrorKind::PermissionDenied => BindError::Initialization,
            _ => BindError::Generic(e),
        }
    }
}

/// The datagram interface the socket drives.
///
/// Implementations must not block: `recv_from` returns `Ok(None)` when no
/// datagram is waiting. The library ships [`UdpTransport`]; tests substitute
/// an in-memory network.
pub trait Transport {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn send_to(&self, addr: &SocketAddr, data: &[u8]) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// A non-blocking UDP socket bound to a local address.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, BindError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true).map_err(BindError::Generic)?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&self, addr: &SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_maps_address_in_use() {
        let first = UdpTransport::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        match UdpTransport::bind(addr) {
            Err(BindError::AddressInUse) | Err(BindError::Generic(_)) => {}
            Ok(_) => panic!("second bind unexpectedly succeeded"),
            Err(e) => panic!("unexpected bind error: {}", e),
        }
    }

    #[test]
    fn loopback_datagram_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_to(&b_addr, b"ping").unwrap();
        let mut buf = [0; 64];
        let received = loop {
            if let Some((len, from)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(from, a.local_addr().unwrap());
                break buf[..len].to_vec();
            }
        };
        assert_eq!(received, b"ping");
    }
}
