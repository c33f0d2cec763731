//! Per-sender state on the receive path.

use crate::rxw::ReceiveWindow;
use crate::sqn::Sqn;
use crate::tsi::Tsi;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// One upstream source, keyed by TSI in the socket's peer map.
#[derive(Debug)]
pub struct Peer {
    pub tsi: Tsi,
    /// Source path NLA learned from SPMs.
    pub nla: Option<IpAddr>,
    /// Network address the source's datagrams arrive from; NAK target until
    /// an SPM names the path NLA.
    pub source_addr: Option<SocketAddr>,
    pub group_nla: IpAddr,
    pub rxw: ReceiveWindow,
    /// Highest accepted SPM sequence; SPMs must advance it.
    pub spm_sqn: Option<Sqn>,
    pub last_activity: Instant,
    /// Pending SPM-request deadline while no SPM has been seen; cleared by
    /// an SPM or a multicast SPMR from another receiver.
    pub spmr_deadline: Option<Instant>,
    /// Losses already surfaced to the caller as a RESET indication.
    pub reported_losses: u32,
}

impl Peer {
    pub fn new(
        tsi: Tsi,
        rxw: ReceiveWindow,
        group_nla: IpAddr,
        now: Instant,
        spmr_expiry: Duration,
    ) -> Self {
        Self {
            tsi,
            nla: None,
            source_addr: None,
            group_nla,
            rxw,
            spm_sqn: None,
            last_activity: now,
            spmr_deadline: Some(now + spmr_expiry),
            reported_losses: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_expired(&self, now: Instant, peer_expiry: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= peer_expiry
    }

    /// Where NAKs for this source go.
    pub fn nak_target(&self, udp_port: u16) -> SocketAddr {
        match (self.nla, self.source_addr) {
            (Some(nla), _) => SocketAddr::new(nla, udp_port),
            (None, Some(addr)) => addr,
            (None, None) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), udp_port),
        }
    }

    pub fn src_nla(&self) -> IpAddr {
        self.nla
            .or(self.source_addr.map(|a| a.ip()))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Losses not yet surfaced as a RESET indication.
    pub fn unreported_losses(&self) -> u32 {
        self.rxw.cumulative_losses().saturating_sub(self.reported_losses)
    }
}
