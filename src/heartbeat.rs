//! RFC 6520 heartbeats over the datagram transport.
//!
//! Requests are answered in kind; responses double as liveness acks, so a
//! response matching the request in flight stops the retransmit timer.

use bytes::BufMut;
use rand::rngs::OsRng;
use rand::RngCore;

use coding::WireReader;
use connection::Connection;
use packet::{ContentType, MAX_PLAIN_LENGTH};
use transport::DatagramBio;
use {Error, HandshakeStateMachine, RecordLayer};

pub const HEARTBEAT_REQUEST: u8 = 1;
pub const HEARTBEAT_RESPONSE: u8 = 2;

/// Minimum random padding on every heartbeat message.
const PADDING: usize = 16;
/// Our requests carry a sequence number plus 16 random bytes.
const REQUEST_PAYLOAD: usize = 18;

/// Heartbeat negotiation and in-flight state.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Heartbeat {
    /// The peer advertised support.
    pub enabled: bool,
    /// The peer asked us not to originate requests.
    pub no_requests: bool,
    /// A request is in flight and unanswered.
    pub pending: bool,
    /// Sequence number for the next request.
    pub seq: u16,
}

impl Connection {
    /// Handle the body of an incoming heartbeat record.
    ///
    /// Malformed or oversize bodies are silently discarded per RFC 6520 §4;
    /// only a failure to write the response is an error.
    pub fn process_heartbeat<T, R>(
        &mut self,
        transport: &mut T,
        rlayer: &mut R,
        body: &[u8],
    ) -> Result<(), Error>
    where
        T: DatagramBio,
        R: RecordLayer,
    {
        if body.len() > MAX_PLAIN_LENGTH {
            return Ok(());
        }
        let mut r = WireReader::new(body);
        let hbtype = match r.take_u8() {
            Ok(t) => t,
            Err(_) => return Ok(()),
        };
        let payload_len = match r.take_u16_be() {
            Ok(n) => n as usize,
            Err(_) => return Ok(()),
        };
        // the payload must fit with room for the mandatory padding
        if payload_len + PADDING > r.remaining() {
            return Ok(());
        }
        let payload = match r.take_bytes(payload_len) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        match hbtype {
            HEARTBEAT_REQUEST => {
                let write_len = 1 + 2 + payload_len + PADDING;
                if write_len > MAX_PLAIN_LENGTH {
                    return Ok(());
                }
                trace!(self.log, "answering heartbeat request";
                       "payload_len" => payload_len);
                let mut buf = Vec::with_capacity(write_len);
                buf.put_u8(HEARTBEAT_RESPONSE);
                buf.put_u16_be(payload_len as u16);
                buf.put_slice(payload);
                let mut padding = [0; PADDING];
                let mut rng = OsRng::new().map_err(|_| Error::Internal)?;
                rng.fill_bytes(&mut padding);
                buf.put_slice(&padding);
                rlayer.write_bytes(ContentType::Heartbeat, &buf)?;
            }
            HEARTBEAT_RESPONSE => {
                // Only our own requests carry 18-byte payloads: the
                // sequence number and a nonce.
                if payload_len == REQUEST_PAYLOAD {
                    let mut p = WireReader::new(payload);
                    if p.take_u16_be() == Ok(self.heartbeat.seq) {
                        trace!(self.log, "heartbeat answered";
                               "seq" => self.heartbeat.seq);
                        self.stop_timer(transport);
                        self.heartbeat.seq = self.heartbeat.seq.wrapping_add(1);
                        self.heartbeat.pending = false;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Send a heartbeat request and arm the retransmit timer for it.
    pub fn send_heartbeat<T, H, R>(
        &mut self,
        now: u64,
        transport: &mut T,
        handshake: &H,
        rlayer: &mut R,
    ) -> Result<(), Error>
    where
        T: DatagramBio,
        H: HandshakeStateMachine,
        R: RecordLayer,
    {
        if !self.heartbeat.enabled || self.heartbeat.no_requests {
            return Err(Error::HeartbeatNotAllowed);
        }
        if self.heartbeat.pending {
            return Err(Error::HeartbeatPending);
        }
        // Heartbeats share the record layer with handshake flights; keep
        // out of the way until the handshake is done.
        if handshake.in_handshake() {
            return Err(Error::UnexpectedMessage);
        }

        let mut buf = Vec::with_capacity(1 + 2 + REQUEST_PAYLOAD + PADDING);
        buf.put_u8(HEARTBEAT_REQUEST);
        buf.put_u16_be(REQUEST_PAYLOAD as u16);
        buf.put_u16_be(self.heartbeat.seq);
        let mut random = [0; 16 + PADDING];
        let mut rng = OsRng::new().map_err(|_| Error::Internal)?;
        rng.fill_bytes(&mut random);
        buf.put_slice(&random);

        rlayer.write_bytes(ContentType::Heartbeat, &buf)?;
        trace!(self.log, "heartbeat request sent"; "seq" => self.heartbeat.seq);
        self.timer.start(transport, now);
        self.heartbeat.pending = true;
        Ok(())
    }
}
