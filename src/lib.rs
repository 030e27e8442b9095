//! Connected, unreliable, authenticated datagram protocol over UDP.
//!
//! A `Socket` multiplexes any number of peer connections over a single bound
//! UDP endpoint. Connections are negotiated with a two-phase handshake: the
//! initiator first obtains a challenge from the host (carrying the host's
//! public key and a client puzzle), then answers with a connect request whose
//! secret portion is sealed under an ECDH-derived shared secret. The host only
//! commits per-connection state once the puzzle solution and the stateless
//! client-identity token check out, which keeps connection floods cheap to
//! shed.
//!
//! Established connections exchange encrypted, integrity-protected datagrams.
//! Delivery is unreliable and unordered, but every sent packet eventually
//! produces exactly one delivery notification once the peer's acknowledgement
//! window has moved past it; the protocol never retransmits application data.
//!
//! The library performs no blocking I/O. Datagrams reach the wire through the
//! [`Transport`] trait, and everything the socket wants to tell the
//! application comes out of [`Socket::get_next_event`], which also drives
//! retries, timeouts, and puzzle solving.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate slog;

use std::fmt;

mod coding;
mod connection;
mod crypto;
mod packet;
mod puzzle;
mod socket;
mod transport;

pub use crate::packet::MAX_PACKET_PAYLOAD;
pub use crate::puzzle::SolutionCheck;
pub use crate::socket::{
    Config, OpError, Socket, SocketEvent, REASON_FAILED_PUZZLE, REASON_NEW_CONNECTION,
    REASON_RECONNECTING, REASON_SHUTDOWN, REASON_TIMEDOUT,
};
pub use crate::transport::{BindError, Transport, UdpTransport};

/// Largest datagram the protocol will emit or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1480;
/// Largest status/reason/connect-data blob carried by handshake packets.
pub const MAX_STATUS_SIZE: usize = 511;
/// Largest public key accepted on the wire.
pub const MAX_PUBLIC_KEY_SIZE: usize = 512;
/// Width of the send/recv packet windows.
pub const PACKET_WINDOW_SIZE: u32 = 31;

/// Stable handle to a connection, pending or established.
///
/// Ids are never reused within a process, even across sockets; operations on
/// an id whose connection has been torn down fail with
/// `OpError::UnknownConnection`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_u32(key, self.0)
    }
}

/// Which side of the handshake a connection plays, and whether a third party
/// brokered it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Host,
    IntroducedInitiator,
    IntroducedHost,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        match self {
            Role::Initiator | Role::IntroducedInitiator => true,
            Role::Host | Role::IntroducedHost => false,
        }
    }
}
