//! PGM socket façade: owns the transmit window when sending, the peer map
//! when receiving, drives the SPM and NAK schedulers and enforces the rate
//! limits.
//!
//! The socket is sans-io: datagrams enter through [`DatagramSource`] and
//! leave through [`DatagramSink`], and timers are driven either by the
//! caller's event loop (via [`PgmSocket::next_expiry`] and
//! [`PgmSocket::dispatch_timers`]) or implicitly inside a blocking
//! [`PgmSocket::recv`].

use crate::error::{PacketError, PgmError};
use crate::fec::GroupCodec;
use crate::packet::{
    self, NakPacket, PacketType, ParityPrm, PgmMessage, Spm, TpduBuilder, OPT_FRAGMENT,
    OPT_PARITY, OPT_VAR_PKTLEN, OP_ENCODED,
};
use crate::peer::Peer;
use crate::rate::{self, RateLimiter};
use crate::rxw::{NakTiming, ReceiveWindow, RxwAdd};
use crate::skb::SocketBuffer;
use crate::sqn::Sqn;
use crate::time::Clock;
use crate::tsi::Tsi;
use crate::txw::{Retransmit, TransmitWindow};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One datagram with its network addresses.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Outbound datagram transport, one TPDU per call.
pub trait DatagramSink {
    fn send_to(&mut self, tpdu: &[u8], dst: &SocketAddr) -> io::Result<()>;
}

/// Inbound datagram transport. `Ok(None)` means the timeout elapsed.
pub trait DatagramSource {
    fn recv_from(&mut self, timeout: Option<Duration>) -> io::Result<Option<Datagram>>;
}

/// Operation status surfaced by the send/receive API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Data moved.
    Normal,
    WouldBlock,
    RateLimited,
    /// Nothing readable, but a timer is outstanding; wait on
    /// [`PgmSocket::next_expiry`].
    TimerPending,
    /// Unrecoverable loss was detected since the last call.
    Reset,
    Eof,
}

/// One delivered APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMessage {
    pub tsi: Tsi,
    pub data: Vec<u8>,
}

/// What this endpoint does on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Sender,
    Receiver,
}

/// Per-socket configuration. Field semantics follow the protocol options of
/// the same names.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Upper bound on TPDU size including the assumed network header.
    pub max_tpdu: u16,
    /// Network-header bytes accounted per packet by the rate limiters.
    pub iphdr_len: usize,
    /// Transmit window sizing: explicit sequence count, or zero to derive
    /// from `txw_secs x txw_max_rte`.
    pub txw_sqns: u32,
    pub txw_secs: u32,
    pub txw_max_rte: u64,
    /// Receive window sizing, same convention.
    pub rxw_sqns: u32,
    pub rxw_secs: u32,
    pub rxw_max_rte: u64,
    /// Repair-traffic rate cap (the minor bucket); zero leaves repairs
    /// bounded only by the aggregate rate.
    pub rdata_max_rte: u64,
    /// IP multicast TTL, applied by the platform layer.
    pub hops: u8,
    pub spm_ambient_ivl: Duration,
    /// SPM schedule after a send event, fastest first.
    pub spm_heartbeat: Vec<Duration>,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    pub use_fec: bool,
    pub rs_n: u8,
    pub rs_k: u8,
    /// Terminate the session on unrecoverable loss instead of surfacing
    /// RESET and continuing.
    pub abort_on_reset: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_tpdu: 1500,
            iphdr_len: 20,
            txw_sqns: 1024,
            txw_secs: 0,
            txw_max_rte: 0,
            rxw_sqns: 1024,
            rxw_secs: 0,
            rxw_max_rte: 0,
            rdata_max_rte: 0,
            hops: 16,
            spm_ambient_ivl: Duration::from_secs(30),
            spm_heartbeat: vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(1300),
                Duration::from_secs(7),
                Duration::from_secs(16),
                Duration::from_secs(25),
                Duration::from_secs(30),
            ],
            peer_expiry: Duration::from_secs(300),
            spmr_expiry: Duration::from_millis(250),
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_data_retries: 5,
            nak_ncf_retries: 2,
            use_fec: false,
            rs_n: 0,
            rs_k: 0,
            abort_on_reset: false,
        }
    }
}

/// PGM overhead of an unfragmented ODATA TPDU.
const DATA_OVERHEAD: usize = packet::HEADER_LEN + packet::DATA_HEADER_LEN;
/// Additional overhead of the fragment option chain.
const FRAGMENT_OVERHEAD: usize = packet::OPT_LENGTH_LEN + packet::OPT_FRAGMENT_LEN;

impl SocketConfig {
    fn validate(&self) -> Result<(), PgmError> {
        let min_tpdu = self.iphdr_len + DATA_OVERHEAD + FRAGMENT_OVERHEAD + 1;
        if usize::from(self.max_tpdu) < min_tpdu {
            return Err(PgmError::InvalidConfig(format!(
                "max TPDU {} below minimum {min_tpdu}",
                self.max_tpdu
            )));
        }
        if self.txw_sqns == 0 && (self.txw_secs == 0 || self.txw_max_rte == 0) {
            return Err(PgmError::InvalidConfig(
                "transmit window needs txw_sqns or txw_secs x txw_max_rte".into(),
            ));
        }
        if self.rxw_sqns == 0 && (self.rxw_secs == 0 || self.rxw_max_rte == 0) {
            return Err(PgmError::InvalidConfig(
                "receive window needs rxw_sqns or rxw_secs x rxw_max_rte".into(),
            ));
        }
        if self.spm_heartbeat.is_empty() {
            return Err(PgmError::InvalidConfig("empty SPM heartbeat schedule".into()));
        }
        Ok(())
    }

    /// Largest TSDU for one TPDU, with or without the fragment option.
    pub fn max_tsdu(&self, fragmented: bool) -> usize {
        let overhead = self.iphdr_len
            + DATA_OVERHEAD
            + if fragmented { FRAGMENT_OVERHEAD } else { 0 };
        usize::from(self.max_tpdu) - overhead
    }

    fn nak_timing(&self) -> NakTiming {
        NakTiming {
            nak_bo_ivl: self.nak_bo_ivl,
            nak_rpt_ivl: self.nak_rpt_ivl,
            nak_rdata_ivl: self.nak_rdata_ivl,
            nak_data_retries: self.nak_data_retries,
            nak_ncf_retries: self.nak_ncf_retries,
        }
    }

    fn fec_codec(&self) -> Result<Option<GroupCodec>, PgmError> {
        if self.use_fec {
            Ok(Some(GroupCodec::new(self.rs_n, self.rs_k)?))
        } else {
            Ok(None)
        }
    }

    fn txw_sqns(&self) -> u32 {
        if self.txw_sqns != 0 {
            self.txw_sqns
        } else {
            derived_sqns(self.txw_secs, self.txw_max_rte, self.max_tpdu)
        }
    }

    fn rxw_sqns(&self) -> u32 {
        if self.rxw_sqns != 0 {
            self.rxw_sqns
        } else {
            derived_sqns(self.rxw_secs, self.rxw_max_rte, self.max_tpdu)
        }
    }
}

fn derived_sqns(secs: u32, max_rte: u64, max_tpdu: u16) -> u32 {
    (u64::from(secs) * max_rte / u64::from(max_tpdu.max(1)))
        .clamp(1, u64::from(u32::MAX >> 1)) as u32
}

/// Cumulative per-socket counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub msgs_received: u64,
    pub checksum_failures: u64,
    pub malformed_packets: u64,
    pub dport_mismatches: u64,
    pub spms_sent: u64,
    pub spms_received: u64,
    pub spmrs_received: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub nnaks_received: u64,
    pub ncfs_sent: u64,
    pub ncfs_received: u64,
    pub rdata_sent: u64,
    pub parity_rdata_sent: u64,
}

/// A PGM endpoint on one multicast session.
pub struct PgmSocket {
    config: SocketConfig,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    tsi: Tsi,
    dport: u16,
    /// Multicast group address and encapsulation port.
    group: SocketAddr,
    /// This host's network address, advertised as the SPM path NLA.
    local_nla: IpAddr,
    role: SocketRole,
    txw: Option<TransmitWindow>,
    peers: HashMap<Tsi, Peer>,
    timing: NakTiming,
    spm_sqn: Sqn,
    next_ambient_spm: Option<Instant>,
    heartbeat_index: usize,
    next_heartbeat_spm: Option<Instant>,
    /// Suppress SPMR-triggered SPMs until this deadline.
    spmr_hold_off: Option<Instant>,
    rate_bucket: RateLimiter,
    rdata_bucket: RateLimiter,
    destroyed: bool,
    stats: SocketStats,
}

impl PgmSocket {
    /// Create a socket bound to `group`/`dport`. Senders allocate their
    /// transmit window here; receivers populate the peer map on traffic.
    pub fn new(
        config: SocketConfig,
        clock: Arc<dyn Clock>,
        rng: &mut dyn RngCore,
        tsi: Tsi,
        dport: u16,
        group: SocketAddr,
        local_nla: IpAddr,
        role: SocketRole,
    ) -> Result<Self, PgmError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(rng.next_u64());
        let now = clock.now();
        let txw = if role == SocketRole::Sender {
            let initial = Sqn(rng.next_u32());
            Some(TransmitWindow::new(
                config.txw_sqns(),
                initial,
                config.fec_codec()?,
            )?)
        } else {
            None
        };
        let rate_bucket = RateLimiter::new(config.txw_max_rte, config.iphdr_len, config.max_tpdu, now);
        let rdata_bucket =
            RateLimiter::new(config.rdata_max_rte, config.iphdr_len, config.max_tpdu, now);
        let timing = config.nak_timing();
        let next_ambient_spm = (role == SocketRole::Sender).then_some(now);
        Ok(Self {
            config,
            clock,
            rng,
            tsi,
            dport,
            group,
            local_nla,
            role,
            txw,
            peers: HashMap::new(),
            timing,
            spm_sqn: Sqn(0),
            next_ambient_spm,
            heartbeat_index: 0,
            next_heartbeat_spm: None,
            spmr_hold_off: None,
            rate_bucket,
            rdata_bucket,
            destroyed: false,
            stats: SocketStats::default(),
        })
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn dport(&self) -> u16 {
        self.dport
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn txw(&self) -> Option<&TransmitWindow> {
        self.txw.as_ref()
    }

    pub fn peer(&self, tsi: &Tsi) -> Option<&Peer> {
        self.peers.get(tsi)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Close the session; in-flight receives observe EOF.
    pub fn close(&mut self) {
        self.destroyed = true;
    }

    /// Fragment `apdu` into TPDUs, append them to the transmit window and
    /// transmit through the rate limiter. Resets the SPM heartbeat schedule
    /// to fast mode.
    pub fn send(
        &mut self,
        sink: &mut dyn DatagramSink,
        apdu: &[u8],
        nonblocking: bool,
    ) -> Result<IoStatus, PgmError> {
        if self.destroyed {
            return Err(PgmError::Destroyed);
        }
        let Some(txw_capacity) = self.txw.as_ref().map(|w| w.capacity()) else {
            return Err(PgmError::InvalidConfig("not a sending socket".into()));
        };
        if apdu.is_empty() {
            return Ok(IoStatus::Normal);
        }
        // An APDU larger than the window can retain could never be repaired.
        let max_apdu = txw_capacity as usize * self.config.max_tsdu(true);
        if apdu.len() > max_apdu {
            return Err(PgmError::MessageTooLarge);
        }

        let single = apdu.len() <= self.config.max_tsdu(false);
        let max_tsdu = self.config.max_tsdu(true);
        let fragments = if single { 1 } else { apdu.len().div_ceil(max_tsdu) };

        if nonblocking {
            // Admit or refuse the whole APDU up front.
            let total = apdu.len()
                + fragments * DATA_OVERHEAD
                + if single { 0 } else { fragments * FRAGMENT_OVERHEAD }
                + (fragments - 1) * self.config.iphdr_len;
            if !self.rate_bucket.check(&*self.clock, total, true) {
                return Ok(IoStatus::RateLimited);
            }
        }

        let now = self.clock.now();
        let txw = self.txw.as_mut().unwrap();
        let first_sqn = txw.lead().next();
        let chunks: Vec<&[u8]> = if single {
            vec![apdu]
        } else {
            apdu.chunks(max_tsdu).collect()
        };
        for (i, chunk) in chunks.iter().enumerate() {
            let fragment = (!single).then(|| packet::Fragment {
                first_sqn,
                offset: (i * max_tsdu) as u32,
                total_length: apdu.len() as u32,
            });
            let (skb, unfolded) =
                SocketBuffer::for_odata(&self.tsi, self.dport, fragment.as_ref(), chunk, now);
            let sqn = txw.add(skb, unfolded);
            let slot = txw.peek(sqn).expect("freshly appended");
            let tpdu = slot.skb.transmit_bytes(PacketType::OData, txw.trail(), unfolded);
            if !nonblocking {
                self.rate_bucket.check(&*self.clock, tpdu.len(), false);
            }
            sink.send_to(&tpdu, &self.group)?;
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += tpdu.len() as u64;
            trace!(%sqn, len = chunk.len(), "sent ODATA");
        }

        // Fast-mode SPMs so receivers observe the new lead promptly.
        self.heartbeat_index = 0;
        self.next_heartbeat_spm = Some(now + self.config.spm_heartbeat[0]);
        Ok(IoStatus::Normal)
    }

    /// Earliest pending deadline across the SPM schedule, every peer's
    /// recovery queues, peer expiry and SPMR state.
    pub fn next_expiry(&self, now: Instant) -> Instant {
        let mut next = now + self.config.spm_ambient_ivl;
        let mut consider = |deadline: Instant| {
            if deadline < next {
                next = deadline;
            }
        };
        if let Some(at) = self.next_ambient_spm {
            consider(at);
        }
        if let Some(at) = self.next_heartbeat_spm {
            consider(at);
        }
        for peer in self.peers.values() {
            if let Some(at) = peer.rxw.next_expiry() {
                consider(at);
            }
            if let Some(at) = peer.spmr_deadline {
                consider(at);
            }
            consider(peer.last_activity + self.config.peer_expiry);
        }
        if self.txw.as_ref().is_some_and(|w| !w.retransmit_is_empty()) {
            consider(now);
        }
        next
    }

    /// Fire everything due: SPM announcements, the repair queue, NAK state
    /// machines, peer expiry.
    pub fn dispatch_timers(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), PgmError> {
        if self.destroyed {
            return Ok(());
        }
        self.dispatch_spm_timers(sink, now)?;
        self.service_repairs(sink)?;
        self.dispatch_peer_timers(sink, now)?;
        Ok(())
    }

    fn dispatch_spm_timers(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), PgmError> {
        if self.txw.is_none() {
            return Ok(());
        }
        let mut due = false;
        if let Some(at) = self.next_heartbeat_spm {
            if at <= now {
                due = true;
                self.heartbeat_index += 1;
                if self.heartbeat_index >= self.config.spm_heartbeat.len() {
                    self.next_heartbeat_spm = None;
                } else {
                    self.next_heartbeat_spm =
                        Some(now + self.config.spm_heartbeat[self.heartbeat_index]);
                }
            }
        }
        if let Some(at) = self.next_ambient_spm {
            if at <= now {
                due = true;
            }
        }
        if due {
            self.send_spm(sink)?;
            self.next_ambient_spm = Some(now + self.config.spm_ambient_ivl);
        }
        Ok(())
    }

    fn send_spm(&mut self, sink: &mut dyn DatagramSink) -> Result<(), PgmError> {
        let Some(txw) = self.txw.as_ref() else {
            return Ok(());
        };
        let parity_prm = self.config.use_fec.then(|| ParityPrm {
            tg_size: u32::from(self.config.rs_k),
            proactive: false,
            on_demand: true,
        });
        self.spm_sqn = self.spm_sqn.next();
        let tpdu = packet::build_spm(
            &self.tsi,
            self.dport,
            self.spm_sqn,
            txw.trail(),
            txw.lead(),
            &self.local_nla,
            parity_prm,
        );
        sink.send_to(&tpdu, &self.group)?;
        self.stats.spms_sent += 1;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += tpdu.len() as u64;
        trace!(spm_sqn = %self.spm_sqn, "sent SPM");
        Ok(())
    }

    /// Drain the retransmit queue through the two-bucket limiter.
    fn service_repairs(&mut self, sink: &mut dyn DatagramSink) -> Result<(), PgmError> {
        loop {
            let Some(txw) = self.txw.as_mut() else { return Ok(()) };
            let Some(repair) = txw.try_peek_retransmit() else {
                return Ok(());
            };
            let tpdu = match repair {
                Retransmit::Selective(sqn) => {
                    let trail = txw.trail();
                    let slot = txw.peek(sqn).expect("queued repair in window");
                    slot.skb
                        .transmit_bytes(PacketType::RData, trail, slot.unfolded_checksum)
                }
                Retransmit::Parity {
                    sqn,
                    tsdu,
                    var_pktlen,
                    fragment_region,
                    ..
                } => {
                    let trail = txw.trail();
                    self.build_parity_rdata(sqn, trail, &tsdu, var_pktlen, fragment_region.as_deref())
                }
            };
            if !rate::check2(
                &self.rate_bucket,
                &self.rdata_bucket,
                &*self.clock,
                tpdu.len(),
                true,
            ) {
                trace!("repair transmission rate limited");
                return Ok(());
            }
            let is_parity = tpdu[5] & OPT_PARITY != 0;
            sink.send_to(&tpdu, &self.group)?;
            self.txw.as_mut().unwrap().pop_retransmit();
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += tpdu.len() as u64;
            self.stats.rdata_sent += 1;
            if is_parity {
                self.stats.parity_rdata_sent += 1;
            }
        }
    }

    fn build_parity_rdata(
        &self,
        sqn: Sqn,
        trail: Sqn,
        tsdu: &[u8],
        var_pktlen: bool,
        fragment_region: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut flags = OPT_PARITY;
        if var_pktlen {
            flags |= OPT_VAR_PKTLEN;
        }
        let mut b = TpduBuilder::new(self.tsi.sport, self.dport, PacketType::RData, flags, self.tsi.gsi);
        b.push_sqn(sqn).push_sqn(trail);
        if let Some(region) = fragment_region {
            b.begin_options();
            b.push_option(OPT_FRAGMENT, OP_ENCODED, region);
            b.end_options();
        }
        b.set_tsdu_length(tsdu.len() as u16);
        b.extend(tsdu);
        b.finish()
    }

    fn dispatch_peer_timers(
        &mut self,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), PgmError> {
        let timing = self.timing;
        let dport = self.dport;
        let udp_port = self.group.port();
        let mut naks_sent = 0u64;
        let mut spmrs: Vec<(Tsi, SocketAddr)> = Vec::new();
        let mut io_error: Option<io::Error> = None;

        for peer in self.peers.values_mut() {
            // NAK state machines.
            let dispatch = peer.rxw.dispatch_timers(now, &timing);
            if !dispatch.naks.is_empty() {
                let target = peer.nak_target(udp_port);
                for batch in dispatch.naks {
                    let (&primary, rest) = batch.split_first().expect("nonempty batch");
                    let tpdu = packet::build_nak(
                        &peer.tsi,
                        dport,
                        primary,
                        &peer.src_nla(),
                        &peer.group_nla,
                        rest,
                        false,
                    );
                    if let Err(e) = sink.send_to(&tpdu, &target) {
                        io_error = Some(e);
                        break;
                    }
                    naks_sent += 1;
                    debug!(tsi = %peer.tsi, %primary, listed = rest.len(), "sent NAK");
                }
            }
            // SPM solicitation while no SPM has been seen.
            if let Some(at) = peer.spmr_deadline {
                if at <= now {
                    peer.spmr_deadline = None;
                    spmrs.push((peer.tsi, peer.nak_target(udp_port)));
                }
            }
        }
        if let Some(e) = io_error {
            return Err(e.into());
        }
        self.stats.naks_sent += naks_sent;

        for (tsi, target) in spmrs {
            let tpdu = packet::build_spmr(&tsi, dport);
            // Multicast copy lets other receivers suppress their own.
            sink.send_to(&tpdu, &self.group)?;
            sink.send_to(&tpdu, &target)?;
        }

        let peer_expiry = self.config.peer_expiry;
        self.peers.retain(|tsi, peer| {
            let keep = !peer.is_expired(now, peer_expiry);
            if !keep {
                debug!(%tsi, "peer expired");
            }
            keep
        });
        Ok(())
    }

    /// Parse and dispatch one incoming datagram.
    pub fn handle_datagram(
        &mut self,
        dgram: &Datagram,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), PgmError> {
        let (header, message) = match packet::parse_tpdu(&dgram.data) {
            Ok(parsed) => parsed,
            Err(PacketError::Checksum) => {
                self.stats.checksum_failures += 1;
                warn!(src = %dgram.src, "bad checksum");
                return Ok(());
            }
            Err(e) => {
                self.stats.malformed_packets += 1;
                trace!(src = %dgram.src, error = %e, "dropping malformed TPDU");
                return Ok(());
            }
        };
        self.stats.packets_received += 1;
        self.stats.bytes_received += dgram.data.len() as u64;

        match message {
            // Upstream direction: addressed to our TSI.
            PgmMessage::Nak(nak) => self.on_nak(&header, nak, sink),
            PgmMessage::NNak(_) => {
                if header.gsi == self.tsi.gsi && header.dport == self.tsi.sport {
                    self.stats.nnaks_received += 1;
                }
                Ok(())
            }
            PgmMessage::Spmr(_) => self.on_spmr(&header, sink, now),
            // Downstream direction: must match the session dport.
            PgmMessage::Spm(spm) => {
                if header.dport != self.dport {
                    self.stats.dport_mismatches += 1;
                    return Ok(());
                }
                self.on_spm(&header, spm, dgram.src, now)
            }
            PgmMessage::OData(data) | PgmMessage::RData(data) => {
                if header.dport != self.dport {
                    self.stats.dport_mismatches += 1;
                    return Ok(());
                }
                self.on_data(&header, data, dgram.src, now)
            }
            PgmMessage::Ncf(ncf) => {
                if header.dport != self.dport {
                    self.stats.dport_mismatches += 1;
                    return Ok(());
                }
                self.on_ncf(&header, ncf, now)
            }
            // PGMCC and polling are framing-reserved only.
            PgmMessage::Ack | PgmMessage::Poll | PgmMessage::Polr => Ok(()),
        }
    }

    fn on_nak(
        &mut self,
        header: &packet::PgmHeader,
        nak: NakPacket,
        sink: &mut dyn DatagramSink,
    ) -> Result<(), PgmError> {
        if header.gsi != self.tsi.gsi || header.dport != self.tsi.sport {
            return Ok(());
        }
        let Some(txw) = self.txw.as_mut() else {
            return Ok(());
        };
        self.stats.naks_received += 1;
        let mut confirmed: Vec<Sqn> = Vec::new();
        for sqn in nak.sequences() {
            match txw.push_retransmit(sqn, nak.is_parity) {
                crate::txw::RetransmitPush::Queued | crate::txw::RetransmitPush::Suppressed => {
                    confirmed.push(sqn);
                }
                crate::txw::RetransmitPush::Rejected => {
                    trace!(%sqn, "NAK for sequence outside transmit window");
                }
            }
        }
        if let Some((&primary, rest)) = confirmed.split_first() {
            let tpdu = packet::build_ncf(
                &self.tsi,
                self.dport,
                primary,
                &nak.src_nla,
                &nak.grp_nla,
                rest,
                nak.is_parity,
            );
            sink.send_to(&tpdu, &self.group)?;
            self.stats.ncfs_sent += 1;
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += tpdu.len() as u64;
        }
        Ok(())
    }

    fn on_spmr(
        &mut self,
        header: &packet::PgmHeader,
        sink: &mut dyn DatagramSink,
        now: Instant,
    ) -> Result<(), PgmError> {
        if header.gsi == self.tsi.gsi && header.dport == self.tsi.sport {
            // Addressed to us: answer promptly, with a hold-off against
            // request storms.
            self.stats.spmrs_received += 1;
            if self.spmr_hold_off.is_none_or(|until| until <= now) {
                self.send_spm(sink)?;
                self.spmr_hold_off = Some(now + self.config.spmr_expiry);
            }
            return Ok(());
        }
        // A fellow receiver asked the same source; suppress our own request.
        let source = Tsi::new(header.gsi, header.dport);
        if let Some(peer) = self.peers.get_mut(&source) {
            peer.spmr_deadline = None;
        }
        Ok(())
    }

    fn ensure_peer(&mut self, tsi: Tsi, src: SocketAddr, now: Instant) -> Result<(), PgmError> {
        if !self.peers.contains_key(&tsi) {
            let fec = self.config.fec_codec()?;
            let rxw = ReceiveWindow::new(
                self.config.rxw_sqns(),
                self.config.max_tsdu(true) as u16,
                fec,
            )?;
            let peer = Peer::new(tsi, rxw, self.group.ip(), now, self.config.spmr_expiry);
            debug!(%tsi, "new peer");
            self.peers.insert(tsi, peer);
        }
        let peer = self.peers.get_mut(&tsi).unwrap();
        peer.touch(now);
        if peer.source_addr.is_none() {
            peer.source_addr = Some(src);
        }
        Ok(())
    }

    fn on_spm(
        &mut self,
        header: &packet::PgmHeader,
        spm: Spm,
        src: SocketAddr,
        now: Instant,
    ) -> Result<(), PgmError> {
        if self.role != SocketRole::Receiver {
            return Ok(());
        }
        self.stats.spms_received += 1;
        let timing = self.timing;
        let tsi = header.tsi();
        self.ensure_peer(tsi, src, now)?;
        let peer = self.peers.get_mut(&tsi).unwrap();
        if peer.spm_sqn.is_some_and(|last| !spm.spm_sqn.gt(last)) {
            trace!(%tsi, spm_sqn = %spm.spm_sqn, "out-of-order SPM");
            return Ok(());
        }
        peer.spm_sqn = Some(spm.spm_sqn);
        peer.nla = Some(spm.path);
        peer.spmr_deadline = None;
        peer.rxw.update(spm.trail, spm.lead, now, &mut self.rng, &timing);
        Ok(())
    }

    fn on_data(
        &mut self,
        header: &packet::PgmHeader,
        data: packet::Data,
        src: SocketAddr,
        now: Instant,
    ) -> Result<(), PgmError> {
        if self.role != SocketRole::Receiver {
            return Ok(());
        }
        let timing = self.timing;
        let tsi = header.tsi();
        self.ensure_peer(tsi, src, now)?;
        let peer = self.peers.get_mut(&tsi).unwrap();
        match peer.rxw.add(data, now, &mut self.rng, &timing) {
            RxwAdd::Appended | RxwAdd::Filled => {}
            RxwAdd::Duplicate => trace!(%tsi, "duplicate data"),
            RxwAdd::NotInWindow => trace!(%tsi, "data outside window"),
            RxwAdd::Malformed => {
                self.stats.malformed_packets += 1;
                trace!(%tsi, "unusable fragment metadata");
            }
        }
        Ok(())
    }

    fn on_ncf(
        &mut self,
        header: &packet::PgmHeader,
        ncf: NakPacket,
        now: Instant,
    ) -> Result<(), PgmError> {
        if self.role != SocketRole::Receiver {
            return Ok(());
        }
        self.stats.ncfs_received += 1;
        let timing = self.timing;
        let tsi = header.tsi();
        let Some(peer) = self.peers.get_mut(&tsi) else {
            return Ok(());
        };
        peer.touch(now);
        for sqn in ncf.sequences() {
            peer.rxw.confirm(sqn, now, &mut self.rng, &timing);
        }
        Ok(())
    }

    /// Drain deliverable APDUs into `msgv`. Returns messages delivered.
    fn flush_peers(&mut self, msgv: &mut Vec<RxMessage>, max_messages: usize) -> usize {
        let mut delivered = 0;
        for peer in self.peers.values_mut() {
            if msgv.len() >= max_messages {
                break;
            }
            let budget = max_messages - msgv.len();
            let mut payloads = Vec::new();
            let result = peer.rxw.flush(&mut payloads, budget);
            for data in payloads {
                self.stats.msgs_received += 1;
                msgv.push(RxMessage {
                    tsi: peer.tsi,
                    data,
                });
            }
            delivered += result.delivered;
        }
        delivered
    }

    /// A peer with losses not yet surfaced as RESET, if any.
    fn reset_pending(&self) -> Option<Tsi> {
        self.peers
            .values()
            .find(|peer| peer.unreported_losses() > 0)
            .map(|peer| peer.tsi)
    }

    /// Receive into `msgv`, up to `max_messages` APDUs. The explicit state
    /// loop drains pending windows, reads the socket dry, dispatches due
    /// timers, then either returns (nonblocking) or waits for readiness
    /// with a timeout equal to the next expiry.
    pub fn recv_msgv(
        &mut self,
        source: &mut dyn DatagramSource,
        sink: &mut dyn DatagramSink,
        msgv: &mut Vec<RxMessage>,
        max_messages: usize,
        nonblocking: bool,
    ) -> Result<IoStatus, PgmError> {
        let mut timers_fired = false;
        loop {
            if self.destroyed {
                return Ok(IoStatus::Eof);
            }
            // DRAIN_PENDING
            if let Some(tsi) = self.reset_pending() {
                let abort = self.config.abort_on_reset;
                if let Some(peer) = self.peers.get_mut(&tsi) {
                    peer.reported_losses = peer.rxw.cumulative_losses();
                }
                warn!(%tsi, "unrecoverable loss");
                if abort {
                    self.destroyed = true;
                }
                return Ok(IoStatus::Reset);
            }
            if self.flush_peers(msgv, max_messages) > 0 {
                return Ok(IoStatus::Normal);
            }

            // READ_SOCKET: drain whatever is queued without sleeping.
            let mut drained_any = false;
            while let Some(dgram) = source.recv_from(Some(Duration::ZERO))? {
                let now = self.clock.now();
                self.handle_datagram(&dgram, sink, now)?;
                drained_any = true;
            }
            if drained_any {
                timers_fired = false;
                continue;
            }

            // DISPATCH_TIMERS, at most once per quiet spell so a backed-off
            // repair queue cannot spin the loop.
            let now = self.clock.now();
            let next = self.next_expiry(now);
            if next <= now && !timers_fired {
                self.dispatch_timers(sink, now)?;
                timers_fired = true;
                continue;
            }

            // WAIT_READINESS
            if nonblocking {
                let recovery_pending = self
                    .peers
                    .values()
                    .any(|peer| peer.rxw.next_expiry().is_some());
                return Ok(if recovery_pending {
                    IoStatus::TimerPending
                } else {
                    IoStatus::WouldBlock
                });
            }
            let timeout = next
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));
            match source.recv_from(Some(timeout))? {
                Some(dgram) => {
                    let now = self.clock.now();
                    self.handle_datagram(&dgram, sink, now)?;
                    timers_fired = false;
                }
                None => {
                    let now = self.clock.now();
                    self.dispatch_timers(sink, now)?;
                }
            }
        }
    }

    /// Receive one APDU.
    pub fn recv(
        &mut self,
        source: &mut dyn DatagramSource,
        sink: &mut dyn DatagramSink,
        nonblocking: bool,
    ) -> Result<(IoStatus, Option<RxMessage>), PgmError> {
        let mut msgv = Vec::with_capacity(1);
        let status = self.recv_msgv(source, sink, &mut msgv, 1, nonblocking)?;
        Ok((status, msgv.pop()))
    }
}
