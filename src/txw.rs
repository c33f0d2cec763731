//! Transmit window: retains sent TPDUs for repair, drives the retransmit
//! queue and synthesises parity packets on demand.

use crate::checksum;
use crate::error::PgmError;
use crate::fec::GroupCodec;
use crate::packet::OP_ENCODED_NULL;
use crate::skb::SocketBuffer;
use crate::sqn::Sqn;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Per-slot control block alongside the retained TPDU.
#[derive(Debug)]
pub struct TxwSlot {
    pub skb: SocketBuffer,
    /// Unfolded checksum of the payload, saved so repair transmissions only
    /// re-sum the header.
    pub unfolded_checksum: u32,
    pub retransmit_count: u32,
    pub nak_elimination_count: u32,
    /// Parity packets requested for this transmission group; grows
    /// monotonically while queued.
    pub pkt_cnt_requested: u32,
    pub pkt_cnt_sent: u32,
    pub waiting_retransmit: bool,
}

/// Outcome of a retransmit-queue push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitPush {
    Queued,
    Suppressed,
    Rejected,
}

/// Head of the retransmit queue, ready to transmit.
#[derive(Debug)]
pub enum Retransmit {
    /// Repair of a single saved sequence.
    Selective(Sqn),
    /// Synthesised parity packet for a transmission group.
    Parity {
        sqn: Sqn,
        tsdu: Vec<u8>,
        var_pktlen: bool,
        /// Reed-Solomon encoded OPT_FRAGMENT region, when any group member
        /// carried one.
        fragment_region: Option<Vec<u8>>,
        unfolded_checksum: u32,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxwStats {
    /// Slots evicted while still live; their sequences became
    /// unrecoverable.
    pub evictions: u64,
    pub naks_suppressed: u64,
}

/// Fixed-capacity ring of sent TPDUs indexed by `sequence % capacity`.
#[derive(Debug)]
pub struct TransmitWindow {
    slots: Vec<Option<TxwSlot>>,
    capacity: u32,
    trail: Sqn,
    lead: Sqn,
    /// Selective entries and parity group leaders awaiting repair
    /// transmission. Push at head, pop at tail.
    retransmit: VecDeque<Sqn>,
    fec: Option<GroupCodec>,
    stats: TxwStats,
}

impl TransmitWindow {
    /// Window sized by sequence count. With FEC the capacity is rounded up
    /// to whole transmission groups.
    pub fn new(sqns: u32, initial: Sqn, fec: Option<GroupCodec>) -> Result<Self, PgmError> {
        if sqns == 0 {
            return Err(PgmError::InvalidConfig(
                "transmit window must hold at least one sequence".into(),
            ));
        }
        let capacity = match &fec {
            Some(codec) => {
                let k = u32::from(codec.k());
                sqns.div_ceil(k) * k
            }
            None => sqns,
        };
        let mut slots = Vec::new();
        slots.resize_with(capacity as usize, || None);
        Ok(Self {
            slots,
            capacity,
            trail: initial,
            lead: initial.prev(),
            retransmit: VecDeque::new(),
            fec,
            stats: TxwStats::default(),
        })
    }

    /// Window sized by a rate-duration product.
    pub fn with_rate(
        secs: u32,
        max_rte: u32,
        max_tpdu: u16,
        initial: Sqn,
        fec: Option<GroupCodec>,
    ) -> Result<Self, PgmError> {
        let sqns = (u64::from(secs) * u64::from(max_rte) / u64::from(max_tpdu.max(1)))
            .min(u64::from(u32::MAX >> 1)) as u32;
        Self::new(sqns.max(1), initial, fec)
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.lead.next().wrapping_sub(self.trail)
    }

    pub fn is_empty(&self) -> bool {
        self.trail == self.lead.next()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn stats(&self) -> TxwStats {
        self.stats
    }

    pub fn fec(&self) -> Option<&GroupCodec> {
        self.fec.as_ref()
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn.0 % self.capacity) as usize
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        !self.is_empty() && self.trail.lte(sqn) && sqn.lte(self.lead)
    }

    /// Append one TPDU, assigning it the next sequence number. Evicts the
    /// trailing slot first when full.
    pub fn add(&mut self, mut skb: SocketBuffer, unfolded_checksum: u32) -> Sqn {
        if self.is_full() {
            self.remove_tail();
        }
        self.lead = self.lead.next();
        skb.sequence = self.lead;
        let index = self.index(self.lead);
        self.slots[index] = Some(TxwSlot {
            skb,
            unfolded_checksum,
            retransmit_count: 0,
            nak_elimination_count: 0,
            pkt_cnt_requested: 0,
            pkt_cnt_sent: 0,
            waiting_retransmit: false,
        });
        self.lead
    }

    fn remove_tail(&mut self) {
        let index = self.index(self.trail);
        if let Some(slot) = self.slots[index].take() {
            if slot.waiting_retransmit {
                let sqn = slot.skb.sequence;
                self.retransmit.retain(|&queued| queued != sqn);
            }
            self.stats.evictions += 1;
            trace!(sqn = %slot.skb.sequence, "evicted from transmit window");
        }
        self.trail = self.trail.next();
    }

    /// Look up a retained TPDU. Out-of-window sequences and vacated slots
    /// return `None`.
    pub fn peek(&self, sqn: Sqn) -> Option<&TxwSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.slots[self.index(sqn)]
            .as_ref()
            .filter(|slot| slot.skb.sequence == sqn)
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut TxwSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        let index = self.index(sqn);
        self.slots[index]
            .as_mut()
            .filter(|slot| slot.skb.sequence == sqn)
    }

    /// Queue a repair request. Selective requests name one sequence; parity
    /// requests carry the group leader with the requested packet count in
    /// the low sequence bits.
    pub fn push_retransmit(&mut self, sqn: Sqn, is_parity: bool) -> RetransmitPush {
        if self.is_empty() {
            return RetransmitPush::Rejected;
        }
        if is_parity {
            self.push_retransmit_parity(sqn)
        } else {
            self.push_retransmit_selective(sqn)
        }
    }

    fn push_retransmit_selective(&mut self, sqn: Sqn) -> RetransmitPush {
        let Some(slot) = self.slot_mut(sqn) else {
            trace!(%sqn, "requested sequence not in window");
            return RetransmitPush::Rejected;
        };
        if slot.waiting_retransmit {
            slot.nak_elimination_count += 1;
            self.stats.naks_suppressed += 1;
            return RetransmitPush::Suppressed;
        }
        slot.waiting_retransmit = true;
        self.retransmit.push_front(sqn);
        RetransmitPush::Queued
    }

    fn push_retransmit_parity(&mut self, nak_sqn: Sqn) -> RetransmitPush {
        let Some(codec) = self.fec.as_ref() else {
            return RetransmitPush::Rejected;
        };
        let tg_sqn = codec.tg_sqn(nak_sqn);
        let pkt_cnt = codec.tg_pkt(nak_sqn).max(1);
        let Some(slot) = self.slot_mut(tg_sqn) else {
            trace!(%tg_sqn, "transmission group leader not in window");
            return RetransmitPush::Rejected;
        };
        if slot.waiting_retransmit {
            if slot.pkt_cnt_requested < pkt_cnt {
                slot.pkt_cnt_requested = pkt_cnt;
            }
            slot.nak_elimination_count += 1;
            self.stats.naks_suppressed += 1;
            return RetransmitPush::Suppressed;
        }
        slot.pkt_cnt_requested = pkt_cnt;
        slot.waiting_retransmit = true;
        self.retransmit.push_front(tg_sqn);
        RetransmitPush::Queued
    }

    pub fn retransmit_is_empty(&self) -> bool {
        self.retransmit.is_empty()
    }

    /// Peek the tail of the retransmit queue. Selective requests hand back
    /// the sequence to serve from the stored TPDU; parity requests
    /// synthesise the next parity symbol for the group.
    pub fn try_peek_retransmit(&mut self) -> Option<Retransmit> {
        let &tail = self.retransmit.back()?;
        let (requested, sent) = {
            let slot = self.peek(tail)?;
            (slot.pkt_cnt_requested, slot.pkt_cnt_sent)
        };
        if requested == 0 {
            return Some(Retransmit::Selective(tail));
        }
        match self.synthesise_parity(tail, sent) {
            Some(parity) => Some(parity),
            None => {
                // A group member was evicted under the request; drop it.
                warn!(tg_sqn = %tail, "dropping parity request, group no longer complete");
                self.retransmit.pop_back();
                if let Some(slot) = self.slot_mut(tail) {
                    slot.waiting_retransmit = false;
                    slot.pkt_cnt_requested = 0;
                }
                None
            }
        }
    }

    fn synthesise_parity(&mut self, tg_sqn: Sqn, pkt_cnt_sent: u32) -> Option<Retransmit> {
        let codec = self.fec.as_ref()?;
        let k = u32::from(codec.k());
        let h = (pkt_cnt_sent % u32::from(codec.n() - codec.k())) as u8;

        let mut parity_length: u16 = 0;
        let mut var_pktlen = false;
        let mut op_encoded = false;
        for i in 0..k {
            let slot = self.peek(tg_sqn.wrapping_add(i))?;
            let tsdu_length = slot.skb.tsdu_length();
            if parity_length == 0 && i == 0 {
                parity_length = tsdu_length;
            } else if tsdu_length != parity_length {
                var_pktlen = true;
                if tsdu_length > parity_length {
                    parity_length = tsdu_length;
                }
            }
            if slot.skb.has_options() {
                op_encoded = true;
            }
        }

        if var_pktlen {
            for i in 0..k {
                let index = self.index(tg_sqn.wrapping_add(i));
                let slot = self.slots[index].as_mut()?;
                slot.skb.ensure_zero_padded(usize::from(parity_length));
            }
        }

        let codec = self.fec.as_ref()?;
        let mut sources: Vec<&[u8]> = Vec::with_capacity(k as usize);
        let null_fragment = {
            let mut block = [0u8; 12];
            block[0] = OP_ENCODED_NULL;
            block
        };
        for i in 0..k {
            let index = (tg_sqn.wrapping_add(i).0 % self.capacity) as usize;
            let slot = self.slots[index].as_ref()?;
            sources.push(if var_pktlen {
                slot.skb.padded_block(usize::from(parity_length))
            } else {
                slot.skb.payload_block(usize::from(parity_length))
            });
        }
        let tsdu = codec.encode_parity(&sources, h).ok()?;

        let fragment_region = if op_encoded {
            let mut opt_sources: Vec<&[u8]> = Vec::with_capacity(k as usize);
            for i in 0..k {
                let index = (tg_sqn.wrapping_add(i).0 % self.capacity) as usize;
                let slot = self.slots[index].as_ref()?;
                opt_sources.push(slot.skb.fragment_body().unwrap_or(&null_fragment));
            }
            Some(codec.encode_parity(&opt_sources, h).ok()?)
        } else {
            None
        };

        let unfolded_checksum = checksum::csum_partial(&tsdu, 0);
        debug!(%tg_sqn, h, var_pktlen, "synthesised parity packet");
        Some(Retransmit::Parity {
            sqn: Sqn(tg_sqn.0 | u32::from(h)),
            tsdu,
            var_pktlen,
            fragment_region,
            unfolded_checksum,
        })
    }

    /// Retire the tail request after transmission. Selective entries unlink;
    /// parity entries stay queued until every requested packet went out.
    pub fn pop_retransmit(&mut self) -> Option<Sqn> {
        let &tail = self.retransmit.back()?;
        let slot = self.slot_mut(tail)?;
        if slot.pkt_cnt_requested > 0 {
            slot.pkt_cnt_sent += 1;
            if slot.pkt_cnt_sent >= slot.pkt_cnt_requested {
                slot.waiting_retransmit = false;
                self.retransmit.pop_back();
            }
        } else {
            slot.retransmit_count += 1;
            slot.waiting_retransmit = false;
            self.retransmit.pop_back();
        }
        Some(tail)
    }
}
