//! Protocol-level machinery for the DTLS cookie exchange and handshake
//! retransmission.
//!
//! This crate performs no I/O whatsoever and owns no thread of control. A
//! `Connection` consumes peeked datagrams and timer polls from its host
//! and drives the datagram transport, record protection layer, and handshake
//! state machine it is given through the traits defined here. The two entry
//! points that do real work are `Connection::listen`, the stateless
//! HelloVerifyRequest cookie exchange, and `Connection::handle_timeout`, the
//! retransmission controller.

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate rand;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;

use std::io;
use std::ops;

mod coding;
mod connection;
mod cookie;
mod flight;
mod heartbeat;
mod listen;
mod mtu;
mod packet;
mod timer;
mod transport;

pub use coding::{BufMutExt, ShortRead, WireReader};
pub use connection::{Connection, Ctrl, TimeoutCounters, DEFAULT_SESSION_TIMEOUT_SECS};
pub use cookie::{CookieEngine, GenerateCookie, VerifyCookie};
pub use flight::{FlightBuffer, HandshakeFragment};
pub use heartbeat::Heartbeat;
pub use mtu::{Mtu, MAX_MTU_OVERHEAD};
pub use packet::{
    ContentType, HandshakeHeader, RecordHeader, DTLS1_2_VERSION, DTLS1_BAD_VERSION, DTLS1_VERSION,
    MAX_COOKIE_LENGTH, MAX_PLAIN_LENGTH,
};
pub use timer::{RetransmitTimer, TIMEOUT_ALERT_COUNT, TIMEOUT_READ_COUNT};
pub use transport::DatagramBio;

/// Whether this endpoint initiated the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

/// The protocol version(s) a connection was configured to speak.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MethodVersion {
    Dtls1,
    Dtls12,
    /// Version-flexible: negotiate the highest version both sides enable.
    Any,
}

impl MethodVersion {
    /// Wire version for a fixed method. A version-flexible method has none
    /// until negotiation settles.
    pub fn wire(self) -> Option<u16> {
        match self {
            MethodVersion::Dtls1 => Some(DTLS1_VERSION),
            MethodVersion::Dtls12 => Some(DTLS1_2_VERSION),
            MethodVersion::Any => None,
        }
    }
}

/// Per-connection behavior toggles.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Options(u32);

impl Options {
    /// Never ask the transport for a path MTU; the application manages it.
    pub const NO_QUERY_MTU: Options = Options(1 << 0);
    /// A cookie exchange happened on this connection.
    pub const COOKIE_EXCHANGE: Options = Options(1 << 1);
    /// Interoperate with pre-RFC Cisco AnyConnect peers.
    pub const CISCO_ANYCONNECT: Options = Options(1 << 2);
    pub const NO_DTLSV1: Options = Options(1 << 3);
    pub const NO_DTLSV1_2: Options = Options(1 << 4);

    pub fn empty() -> Options {
        Options(0)
    }

    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Options) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Options) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Options {
    type Output = Options;
    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

#[derive(Debug, Fail)]
pub enum Error {
    /// The application's cookie generator was missing, refused, or returned
    /// more than a cookie field can carry.
    #[fail(display = "cookie generation callback failed")]
    CookieGenFailure,
    /// A client presented a cookie but no verify callback is configured.
    #[fail(display = "no cookie verify callback configured")]
    NoCookieVerifier,
    /// Too many retransmissions without any sign of life from the peer.
    #[fail(display = "read timeout expired")]
    ReadTimeoutExpired,
    #[fail(display = "unsupported protocol version")]
    UnsupportedVersion,
    #[fail(display = "peer does not accept heartbeat requests")]
    HeartbeatNotAllowed,
    #[fail(display = "heartbeat request already in flight")]
    HeartbeatPending,
    #[fail(display = "unexpected message")]
    UnexpectedMessage,
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "internal error")]
    Internal,
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        Error::Io(x)
    }
}

/// Record protection layer, owned by the embedder.
///
/// The retransmission path and heartbeats write through this so that
/// whatever keys are live get applied; the listener only seeds its write
/// sequence, since everything it sends is epoch-0 plaintext.
pub trait RecordLayer {
    /// Seed the write-side sequence number: 16-bit epoch then 48-bit
    /// sequence, big-endian.
    fn set_write_sequence(&mut self, seq: &[u8; 8]);
    /// Protect and transmit one record.
    fn write_bytes(&mut self, content_type: ContentType, buf: &[u8]) -> io::Result<usize>;
    /// Drop any buffered record state.
    fn clear(&mut self);
}

/// The handshake state machine driving this connection.
pub trait HandshakeStateMachine {
    /// The cookie exchange finished; a trusted ClientHello is pending in the
    /// transport's read queue.
    fn hello_verify_done(&mut self);
    /// Whether a handshake is currently in progress.
    fn in_handshake(&self) -> bool;
}
