//! Stateless server-side cookie exchange.
//!
//! Until a client proves it can receive at its claimed source address, the
//! server commits nothing: datagrams are only peeked, every reply carries a
//! cookie the client must echo, and all bookkeeping lives in the datagram
//! itself. Anyone can make us send one small HelloVerifyRequest; nobody can
//! make us allocate a handshake.

use std::io;
use std::mem;
use std::net::SocketAddr;

use coding::WireReader;
use connection::Connection;
use cookie::CookieEngine;
use packet::{
    self, ContentType, HandshakeHeader, RecordHeader, CLIENT_HELLO, DTLS1_VERSION,
    MAX_PLAIN_LENGTH, RANDOM_LEN,
};
use transport::DatagramBio;
use {Error, HandshakeStateMachine, Options, RecordLayer};

/// What to do with the ClientHello under consideration.
enum Next {
    SendVerify,
    Success,
}

/// How one pass over the read queue ended.
enum Exit {
    /// Cookie verified; the ClientHello is still queued for the handshake.
    Accepted(u64),
    /// Nothing to accept; `consume` says whether a bad datagram still needs
    /// discarding.
    Drop { consume: bool },
    Fatal(Error),
}

struct ClientHello<'a> {
    sequence: u64,
    cookie: &'a [u8],
}

impl Connection {
    /// Wait for a cookie-verified ClientHello, answering cookieless or
    /// badly-cookied ones with HelloVerifyRequests.
    ///
    /// Returns `Ok(Some(peer))` once a verified ClientHello is pending in
    /// the transport's read queue, with the handshake sequence counters
    /// primed and the record layer's write sequence seeded from the
    /// client's record; the datagram itself is left unconsumed for the
    /// stateful handshake to read. `Ok(None)` means try again later: the
    /// read would have blocked, or a datagram was discarded (silently, as
    /// RFC 6347 requires), or a HelloVerifyRequest went out. Errors are
    /// fatal configuration or transport faults.
    pub fn listen<T, H, R>(
        &mut self,
        transport: &mut T,
        cookies: &mut CookieEngine,
        handshake: &mut H,
        rlayer: &mut R,
    ) -> Result<Option<SocketAddr>, Error>
    where
        T: DatagramBio,
        H: HandshakeStateMachine,
        R: RecordLayer,
    {
        // No state may survive a previous invocation.
        self.clear();

        // The pre-RFC version MACs its ClientHello over the first,
        // cookieless ClientHello, which a stateless listener cannot replay.
        if !packet::is_dtls_major(self.version) {
            return Err(Error::UnsupportedVersion);
        }

        if self.init_buf.len() < MAX_PLAIN_LENGTH {
            self.init_buf.resize(MAX_PLAIN_LENGTH, 0);
        }
        let mut buf = mem::replace(&mut self.init_buf, Vec::new());

        // Only peek until we know we are answering with a
        // HelloVerifyRequest; a verified ClientHello must stay readable for
        // the stateful handshake.
        transport.set_peek_mode(true);
        let exit = self.listen_loop(&mut buf, transport, cookies);
        transport.set_peek_mode(false);

        let result = match exit {
            Exit::Accepted(sequence) => {
                // The cookie exchange used up message sequence 0 on both
                // sides; the real handshake continues from 1, and the
                // record layer continues from the sequence the client last
                // used.
                self.handshake_read_seq = 1;
                self.handshake_write_seq = 1;
                self.next_handshake_write_seq = 1;
                rlayer.set_write_sequence(&packet::sequence_bytes(sequence));
                self.options.insert(Options::COOKIE_EXCHANGE);
                handshake.hello_verify_done();
                match transport.peer() {
                    Ok(peer) => {
                        trace!(self.log, "cookie verified, committing to handshake";
                               "peer" => %peer);
                        Ok(Some(peer))
                    }
                    Err(e) => Err(Error::Io(e)),
                }
            }
            Exit::Drop { consume } => {
                if consume {
                    // Dump the offending datagram; ignore the result.
                    let _ = transport.read(&mut buf[..MAX_PLAIN_LENGTH]);
                }
                Ok(None)
            }
            Exit::Fatal(e) => Err(e),
        };
        self.init_buf = buf;
        result
    }

    fn listen_loop<T: DatagramBio>(
        &mut self,
        buf: &mut Vec<u8>,
        transport: &mut T,
        cookies: &mut CookieEngine,
    ) -> Exit {
        // Whether the datagram under consideration still needs discarding
        // when we give up on it.
        let mut consume = false;
        loop {
            let n = match transport.read(&mut buf[..MAX_PLAIN_LENGTH]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Exit::Drop { consume };
                }
                Err(e) => return Exit::Fatal(Error::Io(e)),
            };
            consume = true;

            let (sequence, next) = {
                let hello = match self.parse_client_hello(&buf[..n]) {
                    Some(hello) => hello,
                    None => return Exit::Drop { consume },
                };
                let next = if hello.cookie.is_empty() {
                    trace!(self.log, "cookieless ClientHello");
                    Next::SendVerify
                } else {
                    match cookies.verify(self, hello.cookie) {
                        Ok(true) => Next::Success,
                        // RFC 6347: an invalid cookie is treated exactly
                        // like a missing one
                        Ok(false) => {
                            trace!(self.log, "stale cookie");
                            Next::SendVerify
                        }
                        Err(e) => return Exit::Fatal(e),
                    }
                };
                (hello.sequence, next)
            };

            match next {
                Next::Success => return Exit::Accepted(sequence),
                Next::SendVerify => {
                    if let Some(exit) = self.send_verify_request(transport, cookies, buf, sequence)
                    {
                        return exit;
                    }
                    // The peeked packet was consumed while answering it; a
                    // later exit must not eat whatever arrives next.
                    consume = false;
                }
            }
        }
    }

    /// Parse and vet one peeked datagram as an initial ClientHello.
    ///
    /// RFC 6347 wants invalid records silently discarded to preserve the
    /// association, so every rejection is `None` plus a log line, never an
    /// alert.
    fn parse_client_hello<'a>(&self, data: &'a [u8]) -> Option<ClientHello<'a>> {
        let mut r = WireReader::new(data);
        let record = match RecordHeader::decode(&mut r) {
            Ok(record) => record,
            Err(_) => {
                debug!(self.log, "dropping truncated record");
                return None;
            }
        };
        if record.content_type != ContentType::Handshake as u8 {
            debug!(self.log, "dropping non-handshake record";
                   "content_type" => record.content_type);
            return None;
        }
        // Only the major version is pinned down before negotiation.
        if !packet::is_dtls_major(record.version) {
            debug!(self.log, "dropping record with bad protocol version";
                   "version" => record.version);
            return None;
        }
        // An initial ClientHello is always unencrypted, so epoch 0.
        if record.epoch() != 0 {
            debug!(self.log, "dropping record with nonzero epoch";
                   "epoch" => record.epoch());
            return None;
        }
        let body = match r.take_bytes(record.length as usize) {
            Ok(body) => body,
            Err(_) => {
                debug!(self.log, "dropping record longer than its datagram");
                return None;
            }
        };
        if r.remaining() != 0 {
            debug!(self.log, "dropping record shorter than its datagram");
            return None;
        }

        let mut msg = WireReader::new(body);
        let header = match HandshakeHeader::decode(&mut msg) {
            Ok(header) => header,
            Err(_) => {
                debug!(self.log, "dropping truncated handshake header");
                return None;
            }
        };
        let payload = match msg.take_bytes(header.length as usize) {
            Ok(payload) => payload,
            Err(_) => {
                debug!(self.log, "dropping handshake message with bad length");
                return None;
            }
        };
        if msg.remaining() != 0 {
            debug!(self.log, "dropping handshake message with trailing bytes");
            return None;
        }
        if header.msg_type != CLIENT_HELLO {
            debug!(self.log, "dropping unexpected handshake message";
                   "msg_type" => header.msg_type);
            return None;
        }
        // The message sequence can only be 0 or 1 this early.
        if header.msg_seq > 2 {
            debug!(self.log, "dropping ClientHello with implausible sequence";
                   "msg_seq" => header.msg_seq);
            return None;
        }
        // A fragmented ClientHello cannot be vetted statelessly.
        if header.frag_offset != 0 || header.frag_len != header.length {
            debug!(self.log, "dropping fragmented ClientHello");
            return None;
        }

        let mut hello = WireReader::new(payload);
        let client_version = match hello.take_u16_be() {
            Ok(version) => version,
            Err(_) => {
                debug!(self.log, "dropping truncated ClientHello");
                return None;
            }
        };
        // DTLS wire versions order backwards: numerically greater is older.
        if let Some(version) = self.method.wire() {
            if client_version > version {
                debug!(self.log, "dropping ClientHello with unsupported version";
                       "client_version" => client_version);
                return None;
            }
        }
        if hello.advance(RANDOM_LEN).is_err() {
            debug!(self.log, "dropping truncated ClientHello");
            return None;
        }
        let cookie = match hello
            .take_len_prefixed_u8()
            .and_then(|_session_id| hello.take_len_prefixed_u8())
        {
            Ok(cookie) => cookie,
            Err(_) => {
                debug!(self.log, "dropping truncated ClientHello");
                return None;
            }
        };

        Some(ClientHello {
            sequence: record.sequence,
            cookie,
        })
    }

    /// Consume the peeked ClientHello and answer it with a fresh cookie.
    /// `None` means the request went out and the listener should look at
    /// the next datagram.
    fn send_verify_request<T: DatagramBio>(
        &mut self,
        transport: &mut T,
        cookies: &mut CookieEngine,
        buf: &mut Vec<u8>,
        sequence: u64,
    ) -> Option<Exit> {
        // The peeked ClientHello is answered, not handed on: discard it for
        // real before replying.
        transport.set_peek_mode(false);
        let _ = transport.read(&mut buf[..MAX_PLAIN_LENGTH]);
        transport.set_peek_mode(true);

        let cookie = match cookies.mint(self) {
            Ok(cookie) => cookie,
            Err(e) => return Some(Exit::Fatal(e)),
        };

        // A version-flexible server answers with a 1.0 header version; some
        // clients drop anything newer before negotiation.
        let wire_version = if self.method.wire().is_some() {
            self.version
        } else {
            DTLS1_VERSION
        };
        let datagram = packet::hello_verify_request(wire_version, self.version, sequence, &cookie);

        // Read and write sides may be distinct; answer to whoever we read
        // from.
        let peer = match transport.peer() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(self.log, "peer address unavailable"; "reason" => %e);
                return Some(Exit::Drop { consume: false });
            }
        };
        transport.set_peer(peer);

        trace!(self.log, "sending HelloVerifyRequest";
               "cookie_len" => cookie.len());
        match transport.write(&datagram) {
            Ok(n) if n == datagram.len() => {}
            // A partial datagram write cannot be completed later.
            Ok(_) => return Some(Exit::Fatal(Error::Internal)),
            // Stateless: nowhere to queue the response, and the client will
            // retransmit its ClientHello anyway.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Some(Exit::Drop { consume: false });
            }
            Err(e) => return Some(Exit::Fatal(Error::Io(e))),
        }
        match transport.flush() {
            Ok(()) => None,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                Some(Exit::Drop { consume: false })
            }
            Err(e) => Some(Exit::Fatal(Error::Io(e))),
        }
    }
}
