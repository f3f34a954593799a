//! Ordered buffering of handshake fragments.
//!
//! One buffer holds the flight we most recently sent, for retransmission;
//! another holds out-of-order incoming fragments until the handshake state
//! machine is ready to reassemble them. Both need the same thing: iteration
//! in `(msg_seq, frag_offset)` order that stays deterministic when late
//! fragments arrive.

use std::collections::btree_map;
use std::collections::BTreeMap;

use bytes::{BufMut, Bytes};

use packet::HandshakeHeader;

/// One handshake message fragment plus its header fields.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeFragment {
    pub msg_type: u8,
    pub msg_seq: u16,
    pub frag_offset: u32,
    pub frag_len: u32,
    /// Length of the whole message this fragment belongs to.
    pub total_len: u32,
    pub payload: Bytes,
}

impl HandshakeFragment {
    /// A whole message in one fragment, the common case for small flights.
    pub fn complete(msg_type: u8, msg_seq: u16, payload: Bytes) -> Self {
        let len = payload.len() as u32;
        HandshakeFragment {
            msg_type,
            msg_seq,
            frag_offset: 0,
            frag_len: len,
            total_len: len,
            payload,
        }
    }

    /// Fragment bounds must sit inside the message and the payload must
    /// match the advertised fragment length.
    pub fn is_consistent(&self) -> bool {
        self.frag_offset
            .checked_add(self.frag_len)
            .map_or(false, |end| end <= self.total_len)
            && self.payload.len() as u32 == self.frag_len
    }

    pub fn header(&self) -> HandshakeHeader {
        HandshakeHeader {
            msg_type: self.msg_type,
            length: self.total_len,
            msg_seq: self.msg_seq,
            frag_offset: self.frag_offset,
            frag_len: self.frag_len,
        }
    }

    /// Re-encode the fragment exactly as it was first sent.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header().encode(buf);
        buf.put_slice(&self.payload);
    }
}

/// Handshake fragments keyed and iterated by `(msg_seq, frag_offset)`.
#[derive(Debug, Default)]
pub struct FlightBuffer {
    fragments: BTreeMap<(u16, u32), HandshakeFragment>,
}

impl FlightBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Insert a fragment, replacing any previous one at the same position.
    /// Inconsistent fragments are refused.
    pub fn push(&mut self, frag: HandshakeFragment) -> bool {
        if !frag.is_consistent() {
            return false;
        }
        self.fragments.insert((frag.msg_seq, frag.frag_offset), frag);
        true
    }

    pub fn pop_smallest(&mut self) -> Option<HandshakeFragment> {
        let key = *self.fragments.keys().next()?;
        self.fragments.remove(&key)
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn iter(&self) -> btree_map::Values<(u16, u32), HandshakeFragment> {
        self.fragments.values()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
