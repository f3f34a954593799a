//! The datagram transport consumed by the listener and timer machinery.

use std::io;
use std::net::SocketAddr;

/// Non-blocking datagram transport.
///
/// Modeled on what the core actually needs from a UDP-ish socket: peeking
/// reads, peer bookkeeping so responses can be mirrored back, MTU hints,
/// and a wakeup hint for the host's poll loop. `read` and `write` signal
/// would-block through `io::ErrorKind::WouldBlock`; the core never blocks
/// on either.
pub trait DatagramBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&mut self) -> io::Result<()>;

    /// While set, `read` returns datagrams without consuming them.
    fn set_peek_mode(&mut self, peek: bool);

    /// Source address of the most recently read datagram.
    fn peer(&self) -> io::Result<SocketAddr>;
    /// Destination for subsequent writes.
    fn set_peer(&mut self, peer: SocketAddr);

    /// Path MTU as reported by the platform, 0 when unknown.
    fn query_mtu(&mut self) -> u32;
    /// Conservative MTU to fall back to after repeated loss.
    fn fallback_mtu(&self) -> u32;
    /// Lower-layer overhead to subtract from a link MTU.
    fn mtu_overhead(&self) -> u32;
    /// Push a clamped MTU back down to the transport.
    fn set_mtu(&mut self, mtu: u32);

    /// Transports with built-in reliable delivery (SCTP) suppress the
    /// retransmission machinery entirely.
    fn is_reliable_datagram(&self) -> bool {
        false
    }

    /// When the retransmit timer will next fire, `None` to clear. Absolute
    /// microseconds on the same clock as every `now` argument.
    fn set_next_timeout(&mut self, deadline: Option<u64>);
}
