//! Receive window: a per-sender sliding window tracking packet arrival,
//! driving the NAK recovery state machines, reassembling APDUs and
//! delivering contiguous data in order.

use crate::error::PgmError;
use crate::fec::GroupCodec;
use crate::packet::{Data, Fragment, OP_ENCODED_NULL};
use crate::sqn::Sqn;
use rand::{Rng, RngCore};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// NAK state-machine timing, copied from the socket configuration.
#[derive(Debug, Clone, Copy)]
pub struct NakTiming {
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
}

/// Recovery state of one window slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Loss detected, waiting out the randomised back-off before NAKing.
    BackOff,
    /// NAK sent, waiting for the multicast NCF.
    WaitNcf,
    /// NCF seen, waiting for repair data.
    WaitData,
    HaveData,
    /// Parity received, pending group reconstruction.
    HaveParity,
    /// Recovery abandoned; skipped (and surfaced) on delivery.
    Lost,
    /// About to be handed to the caller.
    Commit,
}

#[derive(Debug)]
struct RxwSlot {
    sequence: Sqn,
    state: SlotState,
    /// Next state-machine deadline; meaning depends on `state`.
    expiry: Instant,
    nak_transmit_count: u32,
    ncf_retry_count: u32,
    data_retry_count: u32,
    payload: Vec<u8>,
    fragment: Option<Fragment>,
    /// Parity slots: Reed-Solomon symbol index `k + h`.
    parity_index: Option<u8>,
    /// Parity slots: the RS-encoded OPT_FRAGMENT region.
    encoded_fragment: Option<Vec<u8>>,
    var_pktlen: bool,
}

impl RxwSlot {
    fn placeholder(sequence: Sqn, state: SlotState, expiry: Instant) -> Self {
        Self {
            sequence,
            state,
            expiry,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            payload: Vec::new(),
            fragment: None,
            parity_index: None,
            encoded_fragment: None,
            var_pktlen: false,
        }
    }
}

/// Outcome of adding one data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxwAdd {
    /// Extended the window.
    Appended,
    /// Filled a placeholder under recovery.
    Filled,
    Duplicate,
    NotInWindow,
    /// Fragment metadata is unusable; the sequence went straight to LOST.
    Malformed,
}

/// Result of one delivery pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushResult {
    pub delivered: usize,
    /// Loss events surfaced this pass (one per APDU).
    pub lost: u32,
    /// The caller's vector filled before the window drained.
    pub buffer_full: bool,
}

/// NAK emissions due after a timer dispatch, batched for OPT_NAK_LIST.
#[derive(Debug, Default)]
pub struct TimerDispatch {
    pub naks: Vec<SmallVec<[Sqn; 16]>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RxwStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub duplicates: u64,
    pub cumulative_losses: u32,
    pub naks_sent: u64,
}

/// One NAK batch never exceeds the primary plus 62 listed sequences.
const MAX_NAK_BATCH: usize = 63;

/// Per-sender sliding receive window.
#[derive(Debug)]
pub struct ReceiveWindow {
    slots: Vec<Option<RxwSlot>>,
    capacity: u32,
    max_tsdu: u16,
    trail: Sqn,
    lead: Sqn,
    /// Sender's advertised trailing edge; nothing below it is recoverable.
    rxw_trail: Sqn,
    window_defined: bool,
    backoff: VecDeque<Sqn>,
    wait_ncf: VecDeque<Sqn>,
    wait_data: VecDeque<Sqn>,
    fec: Option<GroupCodec>,
    stats: RxwStats,
}

impl ReceiveWindow {
    pub fn new(sqns: u32, max_tsdu: u16, fec: Option<GroupCodec>) -> Result<Self, PgmError> {
        if sqns == 0 {
            return Err(PgmError::InvalidConfig(
                "receive window must hold at least one sequence".into(),
            ));
        }
        if max_tsdu == 0 {
            return Err(PgmError::InvalidConfig("max TSDU must be nonzero".into()));
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
            max_tsdu,
            trail: Sqn(0),
            lead: Sqn(0).prev(),
            rxw_trail: Sqn(0),
            window_defined: false,
            backoff: VecDeque::new(),
            wait_ncf: VecDeque::new(),
            wait_data: VecDeque::new(),
            fec,
            stats: RxwStats::default(),
        })
    }

    /// Window sized by a rate-duration product.
    pub fn with_rate(
        secs: u32,
        max_rte: u32,
        max_tpdu: u16,
        max_tsdu: u16,
        fec: Option<GroupCodec>,
    ) -> Result<Self, PgmError> {
        let sqns = (u64::from(secs) * u64::from(max_rte) / u64::from(max_tpdu.max(1)))
            .min(u64::from(u32::MAX >> 1)) as u32;
        Self::new(sqns.max(1), max_tsdu, fec)
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn rxw_trail(&self) -> Sqn {
        self.rxw_trail
    }

    pub fn len(&self) -> u32 {
        self.lead.next().wrapping_sub(self.trail)
    }

    pub fn is_empty(&self) -> bool {
        self.trail == self.lead.next()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_defined(&self) -> bool {
        self.window_defined
    }

    pub fn stats(&self) -> RxwStats {
        self.stats
    }

    pub fn cumulative_losses(&self) -> u32 {
        self.stats.cumulative_losses
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn.0 % self.capacity) as usize
    }

    fn slot(&self, sqn: Sqn) -> Option<&RxwSlot> {
        if self.is_empty() || !(self.trail.lte(sqn) && sqn.lte(self.lead)) {
            return None;
        }
        self.slots[self.index(sqn)]
            .as_ref()
            .filter(|slot| slot.sequence == sqn)
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut RxwSlot> {
        if self.is_empty() || !(self.trail.lte(sqn) && sqn.lte(self.lead)) {
            return None;
        }
        let index = self.index(sqn);
        self.slots[index]
            .as_mut()
            .filter(|slot| slot.sequence == sqn)
    }

    pub fn slot_state(&self, sqn: Sqn) -> Option<SlotState> {
        self.slot(sqn).map(|slot| slot.state)
    }

    fn unlink(&mut self, sqn: Sqn, state: SlotState) {
        match state {
            SlotState::BackOff => self.backoff.retain(|&q| q != sqn),
            SlotState::WaitNcf => self.wait_ncf.retain(|&q| q != sqn),
            SlotState::WaitData => self.wait_data.retain(|&q| q != sqn),
            _ => {}
        }
    }

    fn mark_lost(&mut self, sqn: Sqn) {
        if let Some(slot) = self.slot_mut(sqn) {
            let state = slot.state;
            if matches!(state, SlotState::HaveData | SlotState::Lost | SlotState::Commit) {
                return;
            }
            slot.state = SlotState::Lost;
            slot.payload = Vec::new();
            self.unlink(sqn, state);
            self.stats.cumulative_losses += 1;
            debug!(%sqn, "recovery abandoned");
        }
    }

    /// Evict the trailing slot to make room; undelivered data counts as
    /// loss.
    fn pop_trail(&mut self) {
        let index = self.index(self.trail);
        if let Some(slot) = self.slots[index].take() {
            let sqn = slot.sequence;
            self.unlink(sqn, slot.state);
            self.stats.cumulative_losses += 1;
            warn!(%sqn, "receive window overflow, trailing sequence dropped");
        }
        self.trail = self.trail.next();
    }

    /// Create BACK_OFF placeholders for `lead+1 ..= new_lead`.
    fn extend_lead(
        &mut self,
        new_lead: Sqn,
        now: Instant,
        rng: &mut dyn RngCore,
        timing: &NakTiming,
    ) {
        while self.lead != new_lead {
            if self.len() == self.capacity {
                self.pop_trail();
            }
            self.lead = self.lead.next();
            let expiry = now + random_backoff(rng, timing.nak_bo_ivl);
            let index = self.index(self.lead);
            self.slots[index] = Some(RxwSlot::placeholder(self.lead, SlotState::BackOff, expiry));
            self.backoff.push_back(self.lead);
        }
    }

    /// Add one ODATA/RDATA packet. An admitted packet's advertised trailing
    /// edge is applied, expiring sequences that became unrecoverable;
    /// out-of-window packets are discarded without touching the edges.
    pub fn add(
        &mut self,
        data: Data,
        now: Instant,
        rng: &mut dyn RngCore,
        timing: &NakTiming,
    ) -> RxwAdd {
        if data.is_parity {
            return self.add_parity(data, now, rng, timing);
        }
        let sqn = data.sqn;

        if !self.window_defined {
            self.trail = sqn;
            self.lead = sqn.prev();
            self.rxw_trail = sqn;
            self.window_defined = true;
        }

        // Bounds against the edge as currently known; only an admitted
        // packet gets to move it.
        if sqn.lt(self.rxw_trail) || sqn.wrapping_sub(self.rxw_trail) > self.capacity {
            trace!(%sqn, rxw_trail = %self.rxw_trail, "sequence outside the transmit window");
            return RxwAdd::NotInWindow;
        }
        self.advance_rxw_trail(data.trail);
        self.expire_below_rxw_trail();

        if sqn.lt(self.trail) {
            self.stats.duplicates += 1;
            return RxwAdd::Duplicate;
        }

        if !self.is_empty() && sqn.lte(self.lead) {
            return self.fill(sqn, data, now);
        }

        // Extend: placeholders for the gap, then install at the new lead.
        self.extend_lead(sqn.prev(), now, rng, timing);
        if self.len() == self.capacity {
            self.pop_trail();
        }
        self.lead = self.lead.next();
        debug_assert_eq!(self.lead, sqn);
        let index = self.index(sqn);
        if data
            .options
            .fragment
            .is_some_and(|f| !self.fragment_is_valid(sqn, &f, data.payload.len()))
        {
            self.slots[index] = Some(RxwSlot::placeholder(sqn, SlotState::Lost, now));
            self.stats.cumulative_losses += 1;
            debug!(%sqn, "fragment metadata invalid, sequence unrecoverable");
            return RxwAdd::Malformed;
        }
        let bytes = data.payload.len() as u64;
        let mut slot = RxwSlot::placeholder(sqn, SlotState::HaveData, now);
        slot.payload = data.payload;
        slot.fragment = data.options.fragment;
        self.slots[index] = Some(slot);
        self.stats.packets_received += 1;
        self.stats.bytes_received += bytes;
        self.try_decode_group(sqn, now);
        RxwAdd::Appended
    }

    /// A fragment whose APDU head lies ahead of its own sequence, whose head
    /// already left the window, or that falls outside its APDU's span can
    /// never reassemble.
    fn fragment_is_valid(&self, sqn: Sqn, fragment: &Fragment, tsdu_len: usize) -> bool {
        let count = fragment
            .total_length
            .div_ceil(u32::from(self.max_tsdu))
            .max(1);
        !fragment.first_sqn.gt(sqn)
            && !fragment.first_sqn.lt(self.trail)
            && sqn.wrapping_sub(fragment.first_sqn) < count
            && fragment.total_length as usize >= tsdu_len
    }

    fn fill(&mut self, sqn: Sqn, data: Data, now: Instant) -> RxwAdd {
        let Some(state) = self.slot(sqn).map(|slot| slot.state) else {
            return RxwAdd::NotInWindow;
        };
        if matches!(state, SlotState::HaveData | SlotState::Commit) {
            self.stats.duplicates += 1;
            return RxwAdd::Duplicate;
        }
        if let Some(fragment) = data.options.fragment {
            if !self.fragment_is_valid(sqn, &fragment, data.payload.len()) {
                self.mark_lost(sqn);
                debug!(%sqn, "fragment metadata invalid, sequence unrecoverable");
                return RxwAdd::Malformed;
            }
        }
        let bytes = data.payload.len() as u64;
        let slot = self.slot_mut(sqn).expect("checked above");
        slot.payload = data.payload;
        slot.fragment = data.options.fragment;
        slot.parity_index = None;
        slot.encoded_fragment = None;
        slot.state = SlotState::HaveData;
        self.unlink(sqn, state);
        self.stats.packets_received += 1;
        self.stats.bytes_received += bytes;
        self.try_decode_group(sqn, now);
        RxwAdd::Filled
    }

    fn add_parity(
        &mut self,
        data: Data,
        now: Instant,
        rng: &mut dyn RngCore,
        timing: &NakTiming,
    ) -> RxwAdd {
        let Some((tg_sqn, k, rs_index)) = self.fec.as_ref().map(|codec| {
            (
                codec.tg_sqn(data.sqn),
                u32::from(codec.k()),
                codec.k() + codec.tg_pkt(data.sqn) as u8,
            )
        }) else {
            trace!("parity packet without FEC configuration");
            return RxwAdd::NotInWindow;
        };
        if !self.window_defined {
            return RxwAdd::NotInWindow;
        }
        if tg_sqn.lt(self.rxw_trail) || tg_sqn.wrapping_sub(self.rxw_trail) > self.capacity {
            return RxwAdd::NotInWindow;
        }
        self.advance_rxw_trail(data.trail);
        self.expire_below_rxw_trail();

        // Receiving parity implies the sender finished the group.
        let group_end = tg_sqn.wrapping_add(k - 1);
        if group_end.gt(self.lead) {
            self.extend_lead(group_end, now, rng, timing);
        }

        let mut target = None;
        for i in 0..k {
            let member = tg_sqn.wrapping_add(i);
            match self.slot(member).map(|slot| slot.state) {
                Some(SlotState::HaveData) | Some(SlotState::HaveParity) | Some(SlotState::Commit) => {}
                Some(_) => {
                    target = Some(member);
                    break;
                }
                None => break,
            }
        }
        let Some(member) = target else {
            self.stats.duplicates += 1;
            return RxwAdd::Duplicate;
        };
        // On a parity TPDU the OPT_FRAGMENT body is the RS-encoded region;
        // re-serialise the decoded fields to recover the raw 12 bytes.
        let encoded_fragment = data.options.fragment.map(|f| {
            let mut block = [0u8; 12];
            block[..4].copy_from_slice(&f.first_sqn.0.to_be_bytes());
            block[4..8].copy_from_slice(&f.offset.to_be_bytes());
            block[8..].copy_from_slice(&f.total_length.to_be_bytes());
            block.to_vec()
        });
        let var_pktlen = data.is_var_pktlen;
        if let Some(slot) = self.slot_mut(member) {
            let state = slot.state;
            slot.payload = data.payload;
            slot.fragment = None;
            slot.parity_index = Some(rs_index);
            slot.encoded_fragment = encoded_fragment;
            slot.var_pktlen = var_pktlen;
            slot.state = SlotState::HaveParity;
            self.unlink(member, state);
        }
        self.stats.packets_received += 1;
        self.try_decode_group(tg_sqn, now);
        RxwAdd::Filled
    }

    /// Reconstruct a transmission group once `k` symbols are on hand.
    fn try_decode_group(&mut self, sqn: Sqn, _now: Instant) {
        let Some((tg_sqn, k, n)) = self
            .fec
            .as_ref()
            .map(|codec| (codec.tg_sqn(sqn), u32::from(codec.k()), codec.n()))
        else {
            return;
        };
        let group_end = tg_sqn.wrapping_add(k - 1);
        if self.is_empty() || group_end.gt(self.lead) || tg_sqn.lt(self.trail) {
            return;
        }

        let mut have = 0u32;
        let mut parity = 0u32;
        for i in 0..k {
            match self.slot(tg_sqn.wrapping_add(i)).map(|slot| slot.state) {
                Some(SlotState::HaveData) | Some(SlotState::Commit) => have += 1,
                Some(SlotState::HaveParity) => parity += 1,
                _ => {}
            }
        }
        if parity == 0 || have + parity < k {
            return;
        }

        // Block length and variable-length flag come from the parity
        // symbols.
        let mut block_len = 0usize;
        let mut var_pktlen = false;
        let mut options_encoded = false;
        for i in 0..k {
            if let Some(slot) = self.slot(tg_sqn.wrapping_add(i)) {
                if slot.state == SlotState::HaveParity {
                    block_len = slot.payload.len();
                    var_pktlen |= slot.var_pktlen;
                    options_encoded |= slot.encoded_fragment.is_some();
                }
            }
        }
        if block_len == 0 {
            return;
        }
        let payload_len = if var_pktlen { block_len - 2 } else { block_len };

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; usize::from(n)];
        let mut opt_shards: Vec<Option<Vec<u8>>> = vec![None; usize::from(n)];
        let null_fragment = {
            let mut block = vec![0u8; 12];
            block[0] = OP_ENCODED_NULL;
            block
        };
        for i in 0..k {
            let member = tg_sqn.wrapping_add(i);
            let Some(slot) = self.slot(member) else { return };
            match slot.state {
                SlotState::HaveData | SlotState::Commit => {
                    let mut block = slot.payload.clone();
                    block.resize(payload_len, 0);
                    if var_pktlen {
                        block.extend_from_slice(&(slot.payload.len() as u16).to_be_bytes());
                    }
                    shards[i as usize] = Some(block);
                    opt_shards[i as usize] = Some(match slot.fragment {
                        Some(f) => {
                            let mut b = vec![0u8; 12];
                            b[..4].copy_from_slice(&f.first_sqn.0.to_be_bytes());
                            b[4..8].copy_from_slice(&f.offset.to_be_bytes());
                            b[8..].copy_from_slice(&f.total_length.to_be_bytes());
                            b
                        }
                        None => null_fragment.clone(),
                    });
                }
                SlotState::HaveParity => {
                    let index = usize::from(slot.parity_index.unwrap_or(n));
                    if index >= usize::from(n) || slot.payload.len() != block_len {
                        return;
                    }
                    shards[index] = Some(slot.payload.clone());
                    opt_shards[index] =
                        Some(slot.encoded_fragment.clone().unwrap_or_else(|| null_fragment.clone()));
                }
                _ => return,
            }
        }

        let Some(codec) = self.fec.as_ref() else { return };
        if codec.reconstruct(&mut shards).is_err() {
            warn!(%tg_sqn, "transmission group reconstruction failed");
            return;
        }
        let decoded_options = if options_encoded {
            let codec = self.fec.as_ref().unwrap();
            codec.reconstruct(&mut opt_shards).ok().map(|_| opt_shards)
        } else {
            None
        };

        for i in 0..k {
            let member = tg_sqn.wrapping_add(i);
            let was_parity = matches!(
                self.slot(member).map(|slot| slot.state),
                Some(SlotState::HaveParity)
            );
            if !was_parity {
                continue;
            }
            let Some(mut block) = shards[i as usize].take() else { continue };
            if var_pktlen {
                let tail = block.split_off(payload_len);
                let true_len = usize::from(u16::from_be_bytes([tail[0], tail[1]]));
                block.truncate(true_len.min(block.len()));
            }
            let fragment = decoded_options.as_ref().and_then(|opts| {
                let b = opts[i as usize].as_ref()?;
                if b[0] & OP_ENCODED_NULL != 0 {
                    return None;
                }
                Some(Fragment {
                    first_sqn: Sqn(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    offset: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
                    total_length: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
                })
            });
            if let Some(slot) = self.slot_mut(member) {
                slot.payload = block;
                slot.fragment = fragment;
                slot.parity_index = None;
                slot.encoded_fragment = None;
                slot.state = SlotState::HaveData;
            }
        }
        debug!(%tg_sqn, "transmission group reconstructed");
    }

    fn advance_rxw_trail(&mut self, txw_trail: Sqn) {
        if txw_trail.gt(self.rxw_trail) {
            self.rxw_trail = txw_trail;
        }
    }

    fn expire_below_rxw_trail(&mut self) {
        if self.is_empty() {
            return;
        }
        let mut sqn = self.trail;
        while sqn.lt(self.rxw_trail) && sqn.lte(self.lead) {
            if let Some(state) = self.slot(sqn).map(|slot| slot.state) {
                if matches!(state, SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData | SlotState::HaveParity) {
                    self.mark_lost(sqn);
                }
            }
            sqn = sqn.next();
        }
    }

    /// Apply a sender's advertised window edges (SPM or data trail). New
    /// sequences at the lead become BACK_OFF placeholders; sequences that
    /// fell below the advertised trail are expired as lost.
    pub fn update(
        &mut self,
        txw_trail: Sqn,
        txw_lead: Sqn,
        now: Instant,
        rng: &mut dyn RngCore,
        timing: &NakTiming,
    ) {
        if !self.window_defined {
            // Late join: start an empty window at the sender's lead.
            self.lead = txw_lead;
            self.trail = txw_lead.next();
            self.rxw_trail = txw_trail;
            self.window_defined = true;
            return;
        }
        if txw_lead.gt(self.lead) {
            self.extend_lead(txw_lead, now, rng, timing);
        }
        self.advance_rxw_trail(txw_trail);
        self.expire_below_rxw_trail();
    }

    /// NCF observed for `sqn`: recovery advances to WAIT_DATA without a NAK
    /// of our own.
    pub fn confirm(
        &mut self,
        sqn: Sqn,
        now: Instant,
        rng: &mut dyn RngCore,
        timing: &NakTiming,
    ) {
        if !self.window_defined {
            return;
        }
        if !self.is_empty() && self.trail.lte(sqn) && sqn.lte(self.lead) {
            let Some(slot) = self.slot_mut(sqn) else { return };
            match slot.state {
                SlotState::BackOff | SlotState::WaitNcf => {
                    let state = slot.state;
                    slot.state = SlotState::WaitData;
                    slot.expiry = now + timing.nak_rdata_ivl;
                    self.unlink(sqn, state);
                    self.wait_data.push_back(sqn);
                }
                _ => {}
            }
            return;
        }
        if sqn.gt(self.lead) && sqn.wrapping_sub(self.rxw_trail) <= self.capacity {
            // Unknown sequence inside the sender's window: somebody else
            // lost it too. Take the shortcut straight to WAIT_DATA.
            self.extend_lead(sqn, now, rng, timing);
            if let Some(slot) = self.slot_mut(sqn) {
                slot.state = SlotState::WaitData;
                slot.expiry = now + timing.nak_rdata_ivl;
            }
            self.backoff.retain(|&q| q != sqn);
            self.wait_data.push_back(sqn);
        }
    }

    /// Fire due state-machine timers. Expired BACK_OFF slots coalesce into
    /// NAK batches; WAIT_NCF and WAIT_DATA retry or give up.
    pub fn dispatch_timers(
        &mut self,
        now: Instant,
        timing: &NakTiming,
    ) -> TimerDispatch {
        let mut dispatch = TimerDispatch::default();
        let mut batch: SmallVec<[Sqn; 16]> = SmallVec::new();

        // Back-off expiries are randomised, so the whole queue is scanned.
        let mut remaining = VecDeque::with_capacity(self.backoff.len());
        while let Some(sqn) = self.backoff.pop_front() {
            let Some(slot) = self.slots[(sqn.0 % self.capacity) as usize].as_mut() else {
                continue;
            };
            if slot.sequence != sqn || slot.state != SlotState::BackOff {
                continue;
            }
            if slot.expiry <= now {
                slot.state = SlotState::WaitNcf;
                slot.expiry = now + timing.nak_rpt_ivl;
                slot.nak_transmit_count += 1;
                self.wait_ncf.push_back(sqn);
                self.stats.naks_sent += 1;
                if batch.len() == MAX_NAK_BATCH {
                    dispatch.naks.push(std::mem::take(&mut batch));
                }
                batch.push(sqn);
            } else {
                remaining.push_back(sqn);
            }
        }
        self.backoff = remaining;

        // WAIT_NCF: constant interval, FIFO order holds.
        for _ in 0..self.wait_ncf.len() {
            let Some(&head) = self.wait_ncf.front() else { break };
            let Some(slot) = self.slots[(head.0 % self.capacity) as usize].as_mut() else {
                self.wait_ncf.pop_front();
                continue;
            };
            if slot.sequence != head || slot.state != SlotState::WaitNcf {
                self.wait_ncf.pop_front();
                continue;
            }
            if slot.expiry > now {
                break;
            }
            self.wait_ncf.pop_front();
            if slot.ncf_retry_count < timing.nak_ncf_retries {
                slot.ncf_retry_count += 1;
                slot.nak_transmit_count += 1;
                slot.expiry = now + timing.nak_rpt_ivl;
                self.wait_ncf.push_back(head);
                self.stats.naks_sent += 1;
                if batch.len() == MAX_NAK_BATCH {
                    dispatch.naks.push(std::mem::take(&mut batch));
                }
                batch.push(head);
            } else {
                slot.state = SlotState::Lost;
                slot.payload = Vec::new();
                self.stats.cumulative_losses += 1;
                debug!(sqn = %head, "NCF retries exhausted");
            }
        }

        // WAIT_DATA: same shape against the repair-data deadline.
        for _ in 0..self.wait_data.len() {
            let Some(&head) = self.wait_data.front() else { break };
            let Some(slot) = self.slots[(head.0 % self.capacity) as usize].as_mut() else {
                self.wait_data.pop_front();
                continue;
            };
            if slot.sequence != head || slot.state != SlotState::WaitData {
                self.wait_data.pop_front();
                continue;
            }
            if slot.expiry > now {
                break;
            }
            self.wait_data.pop_front();
            if slot.data_retry_count < timing.nak_data_retries {
                slot.data_retry_count += 1;
                slot.nak_transmit_count += 1;
                slot.expiry = now + timing.nak_rdata_ivl;
                self.wait_data.push_back(head);
                self.stats.naks_sent += 1;
                if batch.len() == MAX_NAK_BATCH {
                    dispatch.naks.push(std::mem::take(&mut batch));
                }
                batch.push(head);
            } else {
                slot.state = SlotState::Lost;
                slot.payload = Vec::new();
                self.stats.cumulative_losses += 1;
                debug!(sqn = %head, "repair-data retries exhausted");
            }
        }

        if !batch.is_empty() {
            dispatch.naks.push(batch);
        }
        dispatch
    }

    /// Earliest state-machine deadline, if any recovery is outstanding.
    pub fn next_expiry(&self) -> Option<Instant> {
        let mut min: Option<Instant> = None;
        let mut consider = |expiry: Instant| {
            min = Some(match min {
                Some(current) if current <= expiry => current,
                _ => expiry,
            });
        };
        for &sqn in &self.backoff {
            if let Some(slot) = self.slot(sqn) {
                if slot.state == SlotState::BackOff {
                    consider(slot.expiry);
                }
            }
        }
        for queue in [&self.wait_ncf, &self.wait_data] {
            if let Some(&head) = queue.front() {
                if let Some(slot) = self.slot(head) {
                    consider(slot.expiry);
                }
            }
        }
        min
    }

    /// Whether the trailing slot could produce a delivery or loss event.
    pub fn has_pending(&self) -> bool {
        matches!(
            self.slot(self.trail).map(|slot| slot.state),
            Some(SlotState::HaveData) | Some(SlotState::Lost)
        )
    }

    /// Deliver contiguous data in order into `msgv`, up to `max_messages`.
    /// Fragmented APDUs wait until every fragment is resolved; one lost
    /// fragment invalidates the whole APDU as a single loss event.
    pub fn flush(&mut self, msgv: &mut Vec<Vec<u8>>, max_messages: usize) -> FlushResult {
        let mut result = FlushResult::default();
        while !self.is_empty() {
            let Some(slot) = self.slot(self.trail) else { break };
            match slot.state {
                SlotState::Lost => {
                    result.lost += 1;
                    let index = self.index(self.trail);
                    self.slots[index] = None;
                    self.trail = self.trail.next();
                }
                SlotState::HaveData => {
                    match slot.fragment {
                        None => {
                            if msgv.len() >= max_messages {
                                result.buffer_full = true;
                                break;
                            }
                            let index = self.index(self.trail);
                            let slot = self.slots[index].take().unwrap();
                            msgv.push(slot.payload);
                            result.delivered += 1;
                            self.trail = self.trail.next();
                        }
                        Some(fragment) => {
                            if !self.flush_apdu(fragment, msgv, max_messages, &mut result) {
                                break;
                            }
                        }
                    }
                }
                _ => break,
            }
        }
        result
    }

    /// Returns false when the APDU is incomplete or the buffer filled.
    fn flush_apdu(
        &mut self,
        fragment: Fragment,
        msgv: &mut Vec<Vec<u8>>,
        max_messages: usize,
        result: &mut FlushResult,
    ) -> bool {
        let count = fragment
            .total_length
            .div_ceil(u32::from(self.max_tsdu))
            .max(1);
        let first = fragment.first_sqn;
        let last = first.wrapping_add(count - 1);
        if first.gt(self.trail) {
            // Metadata disagrees with the slot's own position; drop the
            // slot as one loss rather than skipping past live sequences.
            result.lost += 1;
            self.stats.cumulative_losses += 1;
            let index = self.index(self.trail);
            self.slots[index] = None;
            self.trail = self.trail.next();
            return true;
        }
        if first.lt(self.trail) || last.gt(self.lead) {
            // Head fragment of a partially expired APDU, or fragments still
            // beyond the lead.
            if first.lt(self.trail) {
                // The APDU can never complete; drop the head as one loss.
                result.lost += 1;
                self.stats.cumulative_losses += 1;
                let index = self.index(self.trail);
                self.slots[index] = None;
                self.trail = self.trail.next();
                return true;
            }
            return false;
        }

        let mut any_lost = false;
        for sqn in (0..count).map(|i| first.wrapping_add(i)) {
            match self.slot(sqn).map(|slot| slot.state) {
                Some(SlotState::HaveData) => {}
                Some(SlotState::Lost) => any_lost = true,
                _ => return false,
            }
        }

        if any_lost {
            result.lost += 1;
            for sqn in (0..count).map(|i| first.wrapping_add(i)) {
                let index = self.index(sqn);
                self.slots[index] = None;
            }
            self.trail = last.next();
            return true;
        }

        if msgv.len() >= max_messages {
            result.buffer_full = true;
            return false;
        }
        let mut apdu = Vec::with_capacity(fragment.total_length as usize);
        for sqn in (0..count).map(|i| first.wrapping_add(i)) {
            let index = self.index(sqn);
            let mut slot = self.slots[index].take().unwrap();
            slot.state = SlotState::Commit;
            apdu.extend_from_slice(&slot.payload);
        }
        apdu.truncate(fragment.total_length as usize);
        msgv.push(apdu);
        result.delivered += 1;
        self.trail = last.next();
        true
    }
}

/// Uniform draw over `(0, ivl]`, spreading NAKs across receivers.
fn random_backoff(rng: &mut dyn RngCore, ivl: Duration) -> Duration {
    let micros = ivl.as_micros().max(1) as u64;
    Duration::from_micros(rng.gen_range(1..=micros))
}
