//! Socket buffers: one owned TPDU with typed interior offsets.
//!
//! The buffer stores header positions as offsets from the start rather than
//! pointers, so it can be moved or grown safely. Stored buffers keep a zero
//! checksum field; the checksum is computed on the transmit copy, combining
//! the header sum with the payload's saved unfolded accumulator.

use crate::checksum;
use crate::packet::{self, Fragment, PacketType, TpduBuilder};
use crate::sqn::Sqn;
use crate::tsi::Tsi;
use std::time::Instant;

/// An owned TPDU held by a window.
#[derive(Debug, Clone)]
pub struct SocketBuffer {
    buf: Vec<u8>,
    data_header: usize,
    payload: usize,
    fragment_opt: Option<usize>,
    tsdu_length: u16,
    pub sequence: Sqn,
    pub tstamp: Instant,
    zero_padded: bool,
}

impl SocketBuffer {
    /// Build an ODATA TPDU for one TSDU. The sequence, trailing edge and
    /// checksum are placeholders finalised per transmission. Returns the
    /// buffer and the unfolded checksum of the payload.
    pub fn for_odata(
        tsi: &Tsi,
        dport: u16,
        fragment: Option<&Fragment>,
        payload: &[u8],
        now: Instant,
    ) -> (SocketBuffer, u32) {
        let mut b = TpduBuilder::new(tsi.sport, dport, PacketType::OData, 0, tsi.gsi);
        b.push_sqn(Sqn(0)); // data_sqn, assigned by the window
        b.push_sqn(Sqn(0)); // data_trail, stamped at transmit
        let mut fragment_opt = None;
        if let Some(fragment) = fragment {
            b.begin_options();
            fragment_opt = Some(b.len());
            b.push_fragment(fragment);
            b.end_options();
        }
        let payload_at = b.push_payload(payload);
        let unfolded = checksum::csum_partial(payload, 0);
        let skb = SocketBuffer {
            buf: b.finish_unchecksummed(),
            data_header: packet::HEADER_LEN,
            payload: payload_at,
            fragment_opt,
            tsdu_length: payload.len() as u16,
            sequence: Sqn(0),
            tstamp: now,
            zero_padded: false,
        };
        (skb, unfolded)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn tsdu_length(&self) -> u16 {
        self.tsdu_length
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload..self.payload + usize::from(self.tsdu_length)]
    }

    pub fn has_options(&self) -> bool {
        self.fragment_opt.is_some()
    }

    /// The OPT_FRAGMENT carried by this TPDU, decoded from its stored
    /// offset.
    pub fn fragment(&self) -> Option<Fragment> {
        self.fragment_opt.map(|at| {
            let b = &self.buf;
            Fragment {
                first_sqn: Sqn(u32::from_be_bytes([b[at + 3], b[at + 4], b[at + 5], b[at + 6]])),
                offset: u32::from_be_bytes([b[at + 7], b[at + 8], b[at + 9], b[at + 10]]),
                total_length: u32::from_be_bytes([b[at + 11], b[at + 12], b[at + 13], b[at + 14]]),
            }
        })
    }

    /// The 12-byte OPT_FRAGMENT body (sqn, offset, length), the region that
    /// participates in parity encoding of options.
    pub fn fragment_body(&self) -> Option<&[u8]> {
        self.fragment_opt.map(|at| &self.buf[at + 3..at + 15])
    }

    /// Produce wire bytes for this TPDU as `typ` (ODATA on first
    /// transmission, RDATA on repair) with the given trailing edge. The
    /// saved payload accumulator avoids re-summing the payload.
    pub fn transmit_bytes(&self, typ: PacketType, trail: Sqn, unfolded_payload: u32) -> Vec<u8> {
        let mut out = self.buf[..self.payload].to_vec();
        out[4] = typ as u8;
        out[self.data_header..self.data_header + 4].copy_from_slice(&self.sequence.0.to_be_bytes());
        out[self.data_header + 4..self.data_header + 8].copy_from_slice(&trail.0.to_be_bytes());
        let header_sum = checksum::csum_partial(&out, 0);
        let sum = checksum::csum_fold(checksum::csum_block_add(
            header_sum,
            unfolded_payload,
            self.payload,
        ));
        out[6..8].copy_from_slice(&sum.to_be_bytes());
        out.extend_from_slice(self.payload());
        out
    }

    /// Zero-pad the payload out to `parity_length` and append the original
    /// TSDU length, once; later parity encodes over the same group reuse the
    /// padding.
    pub fn ensure_zero_padded(&mut self, parity_length: usize) {
        if self.zero_padded {
            return;
        }
        let tsdu = usize::from(self.tsdu_length);
        self.buf.truncate(self.payload + tsdu);
        self.buf.resize(self.payload + parity_length, 0);
        self.buf.extend_from_slice(&self.tsdu_length.to_be_bytes());
        self.zero_padded = true;
    }

    /// The padded parity source block: `parity_length` payload bytes plus
    /// the two-byte appended length. Requires `ensure_zero_padded`.
    pub fn padded_block(&self, parity_length: usize) -> &[u8] {
        debug_assert!(self.zero_padded);
        &self.buf[self.payload..self.payload + parity_length + 2]
    }

    /// Payload padded with zeros to `parity_length`, without the appended
    /// length (equal-length transmission groups).
    pub fn payload_block(&self, parity_length: usize) -> &[u8] {
        debug_assert!(usize::from(self.tsdu_length) == parity_length);
        &self.buf[self.payload..self.payload + parity_length]
    }
}
