//! DTLS wire structures shared by the listener and the retransmit path.

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;

use coding::{BufMutExt, ShortRead, WireReader};

pub const DTLS1_VERSION: u16 = 0xFEFF;
pub const DTLS1_2_VERSION: u16 = 0xFEFD;
/// Pre-RFC version spoken by Cisco AnyConnect peers.
pub const DTLS1_BAD_VERSION: u16 = 0x0100;

pub const RECORD_HEADER_LEN: usize = 13;
pub const HANDSHAKE_HEADER_LEN: usize = 12;
/// Largest plaintext payload a single record may carry.
pub const MAX_PLAIN_LENGTH: usize = 16384;
/// Size of the ClientHello random field.
pub const RANDOM_LEN: usize = 32;
/// A cookie length is a single wire byte.
pub const MAX_COOKIE_LENGTH: usize = 255;

pub const CLIENT_HELLO: u8 = 1;
pub const HELLO_VERIFY_REQUEST: u8 = 3;

/// Record-layer content types.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
    Heartbeat = 24,
}

/// Both DTLS versions share the 0xFE major; only that much is checkable
/// before negotiation.
pub fn is_dtls_major(version: u16) -> bool {
    version >> 8 == DTLS1_VERSION >> 8
}

pub fn sequence_bytes(sequence: u64) -> [u8; 8] {
    let mut bytes = [0; 8];
    BigEndian::write_u64(&mut bytes, sequence);
    bytes
}

/// The 13-byte DTLS record header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    /// 16-bit epoch and 48-bit sequence number, packed big-endian.
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    pub fn decode(r: &mut WireReader) -> Result<Self, ShortRead> {
        let content_type = r.take_u8()?;
        let version = r.take_u16_be()?;
        let epoch = r.take_u16_be()?;
        let seq = r.take_u48_be()?;
        let length = r.take_u16_be()?;
        Ok(RecordHeader {
            content_type,
            version,
            sequence: u64::from(epoch) << 48 | seq,
            length,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.content_type);
        buf.put_u16_be(self.version);
        buf.put_u64_be(self.sequence);
        buf.put_u16_be(self.length);
    }

    pub fn epoch(&self) -> u16 {
        (self.sequence >> 48) as u16
    }

    pub fn sequence_bytes(&self) -> [u8; 8] {
        sequence_bytes(self.sequence)
    }
}

/// The 12-byte DTLS handshake message header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HandshakeHeader {
    pub msg_type: u8,
    pub length: u32,
    pub msg_seq: u16,
    pub frag_offset: u32,
    pub frag_len: u32,
}

impl HandshakeHeader {
    pub fn decode(r: &mut WireReader) -> Result<Self, ShortRead> {
        Ok(HandshakeHeader {
            msg_type: r.take_u8()?,
            length: r.take_u24_be()?,
            msg_seq: r.take_u16_be()?,
            frag_offset: r.take_u24_be()?,
            frag_len: r.take_u24_be()?,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.msg_type);
        buf.put_u24_be(self.length);
        buf.put_u16_be(self.msg_seq);
        buf.put_u24_be(self.frag_offset);
        buf.put_u24_be(self.frag_len);
    }
}

/// Build a complete HelloVerifyRequest datagram.
///
/// The record sequence number is echoed from the triggering ClientHello, and
/// `wire_version` may lag `server_version`: a version-flexible server
/// advertises DTLS 1.0 in the record header because some clients drop
/// anything newer before negotiation.
pub fn hello_verify_request(
    wire_version: u16,
    server_version: u16,
    sequence: u64,
    cookie: &[u8],
) -> Vec<u8> {
    debug_assert!(cookie.len() <= MAX_COOKIE_LENGTH);
    let body_len = 2 + 1 + cookie.len();
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + body_len);
    RecordHeader {
        content_type: ContentType::Handshake as u8,
        version: wire_version,
        sequence,
        length: (HANDSHAKE_HEADER_LEN + body_len) as u16,
    }.encode(&mut buf);
    // A HelloVerifyRequest is never fragmented and always carries message
    // sequence 0.
    HandshakeHeader {
        msg_type: HELLO_VERIFY_REQUEST,
        length: body_len as u32,
        msg_seq: 0,
        frag_offset: 0,
        frag_len: body_len as u32,
    }.encode(&mut buf);
    buf.put_u16_be(server_version);
    buf.put_u8(cookie.len() as u8);
    buf.put_slice(cookie);
    buf
}
