//! Per-connection handshake transport state.

use slog::Logger;

use flight::{FlightBuffer, HandshakeFragment};
use heartbeat::Heartbeat;
use mtu::Mtu;
use packet::{
    ContentType, DTLS1_2_VERSION, DTLS1_BAD_VERSION, DTLS1_VERSION, HANDSHAKE_HEADER_LEN,
};
use timer::{RetransmitTimer, TIMEOUT_ALERT_COUNT, TIMEOUT_READ_COUNT};
use transport::DatagramBio;
use {Error, HandshakeStateMachine, MethodVersion, Options, RecordLayer, Side};

/// Session lifetime in the host's session cache. The 24 hours RFC 4347
/// suggests overfills caches under HTTP-style load.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60 * 60 * 2;

/// Running totals for the retransmission controller.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TimeoutCounters {
    /// Timer expiries without any sign of progress from the peer.
    pub num_timeouts: u32,
    /// Reads attempted since the timer was last armed, wrapped at
    /// `TIMEOUT_READ_COUNT`.
    pub num_reads_since_last_timer: u32,
}

/// Control commands that touch only connection-local state.
///
/// `HANDLE_TIMEOUT` and `LISTEN` borrow the transport and record layer, so
/// they are the methods `Connection::handle_timeout` and
/// `Connection::listen` rather than `Ctrl` variants.
#[derive(Debug, Copy, Clone)]
pub enum Ctrl {
    GetTimeout { now: u64 },
    SetLinkMtu(u32),
    GetLinkMinMtu,
    SetMtu(u32),
    CheckProtoVersion,
}

/// Handshake-transport state for one DTLS association.
///
/// The connection performs no I/O of its own: the listener, the
/// retransmission controller, and the heartbeat machinery all borrow the
/// transport and record layer from the caller for exactly as long as one
/// operation takes. The embedder serializes calls per connection.
pub struct Connection {
    pub(crate) log: Logger,
    pub side: Side,
    pub(crate) method: MethodVersion,
    pub(crate) version: u16,
    pub(crate) options: Options,

    pub(crate) handshake_read_seq: u16,
    pub(crate) handshake_write_seq: u16,
    pub(crate) next_handshake_write_seq: u16,

    /// The flight most recently sent, kept until the peer's next flight
    /// proves delivery.
    pub(crate) buffered_outgoing: FlightBuffer,
    /// Out-of-order incoming fragments awaiting reassembly.
    pub(crate) buffered_incoming: FlightBuffer,

    pub(crate) timer: RetransmitTimer,
    pub(crate) timeouts: TimeoutCounters,
    pub(crate) mtu: Mtu,
    pub(crate) heartbeat: Heartbeat,

    /// Scratch space for the listener, grown once and reused.
    pub(crate) init_buf: Vec<u8>,
}

impl Connection {
    pub fn new(log: Logger, side: Side, method: MethodVersion) -> Self {
        let mut conn = Connection {
            log,
            side,
            method,
            version: 0,
            options: Options::empty(),
            handshake_read_seq: 0,
            handshake_write_seq: 0,
            next_handshake_write_seq: 0,
            buffered_outgoing: FlightBuffer::new(),
            buffered_incoming: FlightBuffer::new(),
            timer: RetransmitTimer::new(),
            timeouts: TimeoutCounters::default(),
            mtu: Mtu::new(),
            heartbeat: Heartbeat::default(),
            init_buf: Vec::new(),
        };
        conn.clear();
        conn
    }

    /// Reset to a pristine pre-handshake state.
    ///
    /// MTU settings survive only when the application manages them itself
    /// via `NO_QUERY_MTU`; everything else is rederived from the method and
    /// options.
    pub fn clear(&mut self) {
        let mtu = self.mtu;
        self.buffered_outgoing.clear();
        self.buffered_incoming.clear();
        self.handshake_read_seq = 0;
        self.handshake_write_seq = 0;
        self.next_handshake_write_seq = 0;
        self.timer.reset();
        self.timeouts = TimeoutCounters::default();
        self.heartbeat.pending = false;
        self.mtu = if self.options.contains(Options::NO_QUERY_MTU) {
            mtu
        } else {
            Mtu::new()
        };
        self.version = if self.options.contains(Options::CISCO_ANYCONNECT) {
            DTLS1_BAD_VERSION
        } else {
            match self.method.wire() {
                Some(version) => version,
                None => DTLS1_2_VERSION,
            }
        };
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn set_version(&mut self, version: u16) {
        self.version = version;
    }

    pub fn method(&self) -> MethodVersion {
        self.method
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Options accumulate, as in the original option word.
    pub fn set_options(&mut self, options: Options) {
        self.options.insert(options);
    }

    pub fn handshake_read_seq(&self) -> u16 {
        self.handshake_read_seq
    }

    pub fn handshake_write_seq(&self) -> u16 {
        self.handshake_write_seq
    }

    pub fn next_handshake_write_seq(&self) -> u16 {
        self.next_handshake_write_seq
    }

    pub fn timeout_counters(&self) -> TimeoutCounters {
        self.timeouts
    }

    /// Effective MTU, 0 when not yet known.
    pub fn mtu(&self) -> u32 {
        self.mtu.mtu
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn heartbeat_mut(&mut self) -> &mut Heartbeat {
        &mut self.heartbeat
    }

    /// Remaining time until the retransmit timer fires, in microseconds.
    pub fn get_timeout(&self, now: u64) -> Option<u64> {
        self.timer.get_timeout(now)
    }

    /// Make sure an effective MTU is known before writing a flight.
    pub fn query_mtu<T: DatagramBio>(&mut self, transport: &mut T) -> bool {
        self.mtu
            .query(transport, self.options.contains(Options::NO_QUERY_MTU))
    }

    /// Queue an outgoing handshake message for retransmission.
    pub fn buffer_message(&mut self, fragment: HandshakeFragment) -> bool {
        self.buffered_outgoing.push(fragment)
    }

    /// Queue an out-of-order incoming fragment for later reassembly.
    pub fn buffer_incoming_fragment(&mut self, fragment: HandshakeFragment) -> bool {
        self.buffered_incoming.push(fragment)
    }

    /// Hand the earliest buffered incoming fragment to the reassembler.
    pub fn next_incoming_fragment(&mut self) -> Option<HandshakeFragment> {
        self.buffered_incoming.pop_smallest()
    }

    /// Stop retransmitting: the peer's next flight arrived or the handshake
    /// finished. Frees the buffered flight and rewinds the backoff.
    pub fn stop_timer<T: DatagramBio>(&mut self, transport: &mut T) {
        self.timer.stop(transport);
        self.timeouts = TimeoutCounters::default();
        self.buffered_outgoing.clear();
    }

    /// Dispatch a state-only control command, keeping the original
    /// 1/0/value return convention.
    pub fn ctrl(&mut self, cmd: Ctrl) -> i64 {
        match cmd {
            Ctrl::GetTimeout { now } => self.get_timeout(now).is_some() as i64,
            Ctrl::SetLinkMtu(mtu) => self.mtu.set_link_mtu(mtu) as i64,
            Ctrl::GetLinkMinMtu => i64::from(Mtu::link_min_mtu()),
            Ctrl::SetMtu(mtu) => {
                if self.mtu.set_mtu(mtu) {
                    i64::from(mtu)
                } else {
                    0
                }
            }
            Ctrl::CheckProtoVersion => self.check_proto_version() as i64,
        }
    }

    /// Whether the current protocol is the highest the configuration
    /// allows.
    pub fn check_proto_version(&self) -> bool {
        if let Some(version) = self.method.wire() {
            return self.version == version;
        }
        // Version-flexible method: compare against the highest version the
        // options leave enabled.
        if !self.options.contains(Options::NO_DTLSV1_2) {
            return self.version == DTLS1_2_VERSION;
        }
        if !self.options.contains(Options::NO_DTLSV1) {
            return self.version == DTLS1_VERSION;
        }
        // Unexpected state; fail closed.
        false
    }

    /// Drive the retransmission machinery once.
    ///
    /// The host calls this from its poll loop whenever the deadline it was
    /// last given via `set_next_timeout` arrives; spurious calls return
    /// `Ok(false)` and change nothing. Each real expiry doubles the
    /// backoff, shrinks the MTU once loss looks persistent, and re-sends
    /// the buffered flight, until the peer is declared dead.
    pub fn handle_timeout<T, H, R>(
        &mut self,
        now: u64,
        transport: &mut T,
        handshake: &H,
        rlayer: &mut R,
    ) -> Result<bool, Error>
    where
        T: DatagramBio,
        H: HandshakeStateMachine,
        R: RecordLayer,
    {
        if !self.timer.is_expired(now) {
            return Ok(false);
        }

        self.timer.double(transport, now);
        self.timeouts.num_timeouts += 1;

        // Two fruitless retransmissions suggest the path is eating large
        // datagrams; adopt the transport's conservative fallback.
        if self.timeouts.num_timeouts > 2 && !self.options.contains(Options::NO_QUERY_MTU) {
            let fallback = transport.fallback_mtu();
            if fallback < self.mtu.mtu {
                self.mtu.mtu = fallback;
            }
        }

        if self.timeouts.num_timeouts > TIMEOUT_ALERT_COUNT {
            debug!(self.log, "peer unresponsive, abandoning handshake";
                   "timeouts" => self.timeouts.num_timeouts);
            return Err(Error::ReadTimeoutExpired);
        }

        self.timeouts.num_reads_since_last_timer += 1;
        if self.timeouts.num_reads_since_last_timer > TIMEOUT_READ_COUNT {
            self.timeouts.num_reads_since_last_timer = 1;
        }

        if self.heartbeat.pending && self.heartbeat.enabled {
            self.heartbeat.pending = false;
            self.send_heartbeat(now, transport, handshake, rlayer)?;
            return Ok(true);
        }

        self.timer.start(transport, now);
        self.retransmit_buffered_messages(rlayer);
        Ok(true)
    }

    /// Re-send every buffered flight message in `(msg_seq, frag_offset)`
    /// order.
    ///
    /// Write failures here are transient by assumption; the timer is
    /// already re-armed, so the next expiry tries again.
    fn retransmit_buffered_messages<R: RecordLayer>(&self, rlayer: &mut R) {
        trace!(self.log, "retransmitting flight";
               "messages" => self.buffered_outgoing.len());
        for fragment in self.buffered_outgoing.iter() {
            let mut buf = Vec::with_capacity(HANDSHAKE_HEADER_LEN + fragment.payload.len());
            fragment.encode(&mut buf);
            if let Err(e) = rlayer.write_bytes(ContentType::Handshake, &buf) {
                debug!(self.log, "retransmit write failed"; "reason" => %e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use testing::{logger, TestRecordLayer, TestStatem, TestTransport};

    fn server() -> Connection {
        Connection::new(logger(), Side::Server, MethodVersion::Dtls12)
    }

    fn buffer_flight(conn: &mut Connection) {
        conn.buffer_message(HandshakeFragment::complete(2, 1, Bytes::from_static(b"hi")));
        conn.buffer_message(HandshakeFragment::complete(11, 2, Bytes::from_static(b"cert")));
    }

    #[test]
    fn spurious_poll_does_nothing() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        conn.timer.start(&mut transport, 0);

        let handled = conn.handle_timeout(500_000, &mut transport, &statem, &mut rlayer);
        assert_matches!(handled, Ok(false));
        assert_eq!(conn.timeout_counters(), TimeoutCounters::default());
        assert!(rlayer.written.is_empty());
    }

    #[test]
    fn expiry_doubles_and_retransmits_in_order() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        buffer_flight(&mut conn);
        conn.timer.start(&mut transport, 0);

        let handled = conn.handle_timeout(1_000_000, &mut transport, &statem, &mut rlayer);
        assert_matches!(handled, Ok(true));
        assert_eq!(conn.timer.duration(), 2);
        assert_eq!(rlayer.written.len(), 2);
        // flight goes out ordered by message sequence
        assert_eq!(rlayer.written[0].1[4..6], [0, 1]);
        assert_eq!(rlayer.written[1].1[4..6], [0, 2]);
    }

    #[test]
    fn escalation_shrinks_mtu_then_gives_up() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        buffer_flight(&mut conn);
        conn.mtu.mtu = 1400;

        let mut now = 0;
        conn.timer.start(&mut transport, now);
        for round in 1u32..13 {
            now += 61_000_000;
            let handled = conn.handle_timeout(now, &mut transport, &statem, &mut rlayer);
            assert_matches!(handled, Ok(true));
            assert_eq!(conn.timeout_counters().num_timeouts, round);
            if round <= 2 {
                assert_eq!(conn.mtu(), 1400);
            } else {
                // third round onward runs at the transport's fallback
                assert_eq!(conn.mtu(), 548);
            }
        }
        let sent_so_far = rlayer.written.len();
        assert_eq!(sent_so_far, 12 * 2);

        now += 61_000_000;
        let handled = conn.handle_timeout(now, &mut transport, &statem, &mut rlayer);
        assert_matches!(handled, Err(Error::ReadTimeoutExpired));
        // the dying call must not retransmit
        assert_eq!(rlayer.written.len(), sent_so_far);
    }

    #[test]
    fn no_query_mtu_blocks_fallback_adoption() {
        let mut conn = server();
        conn.set_options(Options::NO_QUERY_MTU);
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        conn.mtu.mtu = 1400;

        let mut now = 0;
        conn.timer.start(&mut transport, now);
        for _ in 0..5 {
            now += 61_000_000;
            conn.handle_timeout(now, &mut transport, &statem, &mut rlayer)
                .unwrap();
        }
        assert_eq!(conn.mtu(), 1400);
    }

    #[test]
    fn read_counter_wraps_to_one() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();

        let mut now = 0;
        conn.timer.start(&mut transport, now);
        let mut seen = Vec::new();
        for _ in 0..5 {
            now += 61_000_000;
            conn.handle_timeout(now, &mut transport, &statem, &mut rlayer)
                .unwrap();
            seen.push(conn.timeout_counters().num_reads_since_last_timer);
        }
        assert_eq!(seen, [1, 2, 1, 2, 1]);
    }

    #[test]
    fn pending_heartbeat_preempts_retransmit() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        buffer_flight(&mut conn);
        conn.heartbeat.enabled = true;
        conn.heartbeat.pending = true;

        conn.timer.start(&mut transport, 0);
        let handled = conn.handle_timeout(1_000_000, &mut transport, &statem, &mut rlayer);
        assert_matches!(handled, Ok(true));
        assert_eq!(rlayer.written.len(), 1);
        assert_eq!(rlayer.written[0].0, ContentType::Heartbeat);
        // the re-sent request is in flight again
        assert!(conn.heartbeat().pending);
    }

    #[test]
    fn transient_write_failure_is_not_fatal() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        rlayer.fail_writes = true;
        buffer_flight(&mut conn);

        conn.timer.start(&mut transport, 0);
        let handled = conn.handle_timeout(1_000_000, &mut transport, &statem, &mut rlayer);
        assert_matches!(handled, Ok(true));
        // timer re-armed for the next attempt
        assert!(transport.deadline.is_some());
    }

    #[test]
    fn stop_timer_frees_flight_and_counters() {
        let mut conn = server();
        let mut transport = TestTransport::new();
        let statem = TestStatem::default();
        let mut rlayer = TestRecordLayer::default();
        buffer_flight(&mut conn);

        let mut now = 0;
        conn.timer.start(&mut transport, now);
        now += 61_000_000;
        conn.handle_timeout(now, &mut transport, &statem, &mut rlayer)
            .unwrap();

        conn.stop_timer(&mut transport);
        assert_eq!(conn.get_timeout(now), None);
        assert_eq!(conn.timeout_counters(), TimeoutCounters::default());
        assert!(conn.buffered_outgoing.is_empty());
        assert_eq!(transport.deadline, None);
    }

    #[test]
    fn out_of_order_fragments_hand_off_in_order() {
        let mut conn = server();
        let late = HandshakeFragment {
            msg_type: 11,
            msg_seq: 3,
            frag_offset: 100,
            frag_len: 2,
            total_len: 200,
            payload: Bytes::from_static(b"zz"),
        };
        let early = HandshakeFragment {
            msg_type: 11,
            msg_seq: 3,
            frag_offset: 0,
            frag_len: 2,
            total_len: 200,
            payload: Bytes::from_static(b"aa"),
        };
        assert!(conn.buffer_incoming_fragment(late));
        assert!(conn.buffer_incoming_fragment(early));
        assert_eq!(conn.next_incoming_fragment().unwrap().frag_offset, 0);
        assert_eq!(conn.next_incoming_fragment().unwrap().frag_offset, 100);
        assert_matches!(conn.next_incoming_fragment(), None);
    }

    #[test]
    fn clear_preserves_mtu_only_when_app_managed() {
        let mut conn = server();
        conn.mtu.mtu = 1400;
        conn.mtu.link_mtu = 1500;
        conn.clear();
        assert_eq!(conn.mtu(), 0);

        let mut conn = server();
        conn.set_options(Options::NO_QUERY_MTU);
        conn.mtu.mtu = 1400;
        conn.clear();
        assert_eq!(conn.mtu(), 1400);
    }

    #[test]
    fn version_derivation_follows_method_and_options() {
        let conn = Connection::new(logger(), Side::Server, MethodVersion::Dtls1);
        assert_eq!(conn.version(), DTLS1_VERSION);

        let conn = Connection::new(logger(), Side::Server, MethodVersion::Any);
        assert_eq!(conn.version(), DTLS1_2_VERSION);

        let mut conn = Connection::new(logger(), Side::Client, MethodVersion::Any);
        conn.set_options(Options::CISCO_ANYCONNECT);
        conn.clear();
        assert_eq!(conn.version(), DTLS1_BAD_VERSION);
    }

    #[test]
    fn proto_version_check_honors_disabled_versions() {
        let conn = server();
        assert!(conn.check_proto_version());

        let mut conn = Connection::new(logger(), Side::Server, MethodVersion::Any);
        assert!(conn.check_proto_version());
        conn.set_options(Options::NO_DTLSV1_2);
        assert!(!conn.check_proto_version());
        conn.set_version(DTLS1_VERSION);
        assert!(conn.check_proto_version());
        conn.set_options(Options::NO_DTLSV1);
        assert!(!conn.check_proto_version());
    }

    #[test]
    fn ctrl_dispatch_keeps_original_conventions() {
        let mut conn = server();
        assert_eq!(conn.ctrl(Ctrl::GetTimeout { now: 0 }), 0);
        assert_eq!(conn.ctrl(Ctrl::GetLinkMinMtu), 256);
        assert_eq!(conn.ctrl(Ctrl::SetLinkMtu(255)), 0);
        assert_eq!(conn.ctrl(Ctrl::SetLinkMtu(1500)), 1);
        assert_eq!(conn.ctrl(Ctrl::SetMtu(207)), 0);
        assert_eq!(conn.ctrl(Ctrl::SetMtu(208)), 208);
        assert_eq!(conn.ctrl(Ctrl::CheckProtoVersion), 1);

        let mut transport = TestTransport::new();
        conn.timer.start(&mut transport, 0);
        assert_eq!(conn.ctrl(Ctrl::GetTimeout { now: 0 }), 1);
    }
}
