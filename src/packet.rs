//! PGM wire-format codec.
//!
//! Serialises and deserialises PGM TPDUs: the 16-byte common header, the
//! type-specific bodies, and the option chain. All multi-byte fields are
//! network byte order. Incoming TPDUs are parsed into the [`PgmMessage`]
//! tagged sum the socket dispatches on.

use crate::checksum;
use crate::error::PacketError;
use crate::sqn::Sqn;
use crate::tsi::{Gsi, Tsi};
use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Common PGM header length.
pub const HEADER_LEN: usize = 16;
/// ODATA/RDATA type-specific header length (data_sqn + data_trail).
pub const DATA_HEADER_LEN: usize = 8;
/// OPT_LENGTH is fixed at four bytes including the 16-bit total length.
pub const OPT_LENGTH_LEN: usize = 4;
/// OPT_FRAGMENT: 3-byte option prefix plus sqn, offset and total length.
pub const OPT_FRAGMENT_LEN: usize = 15;
/// Maximum extra sequence numbers in an OPT_NAK_LIST.
pub const MAX_NAK_LIST: usize = 62;
/// Cap on option-chain iteration.
const MAX_OPTIONS: usize = 16;

// Header option flag bits.
pub const OPT_PRESENT: u8 = 0x80;
pub const OPT_NETWORK: u8 = 0x40;
pub const OPT_VAR_PKTLEN: u8 = 0x02;
pub const OPT_PARITY: u8 = 0x01;

// Option types.
pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_JOIN: u8 = 0x03;
pub const OPT_PARITY_PRM: u8 = 0x08;
pub const OPT_CURR_TGSIZE: u8 = 0x0a;
pub const OPT_SYN: u8 = 0x0d;
pub const OPT_FIN: u8 = 0x0e;
pub const OPT_RST: u8 = 0x0f;
/// Terminator bit on the option type byte.
pub const OPT_END: u8 = 0x80;
/// Network-significant bit on the option reserved byte.
pub const OPX_NETWORK: u8 = 0x40;
/// Reserved-byte marker: option body is Reed-Solomon encoded.
pub const OP_ENCODED: u8 = 0x08;
/// First byte of the null fragment block used when a transmission-group
/// member carries no OPT_FRAGMENT.
pub const OP_ENCODED_NULL: u8 = 0x80;

// OPT_PARITY_PRM reserved-byte flags.
pub const PARITY_PRM_PRO: u8 = 0x01;
pub const PARITY_PRM_OND: u8 = 0x02;

/// PGM packet types, low four bits of the header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    OData = 0x04,
    RData = 0x05,
    Nak = 0x08,
    NNak = 0x09,
    Ncf = 0x0a,
    Spmr = 0x0c,
    Ack = 0x0d,
}

impl PacketType {
    pub fn from_wire(byte: u8) -> Option<PacketType> {
        match byte & 0x0f {
            0x00 => Some(PacketType::Spm),
            0x01 => Some(PacketType::Poll),
            0x02 => Some(PacketType::Polr),
            0x04 => Some(PacketType::OData),
            0x05 => Some(PacketType::RData),
            0x08 => Some(PacketType::Nak),
            0x09 => Some(PacketType::NNak),
            0x0a => Some(PacketType::Ncf),
            0x0c => Some(PacketType::Spmr),
            0x0d => Some(PacketType::Ack),
            _ => None,
        }
    }
}

/// The common 16-byte header in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub typ: PacketType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.sport)
    }
}

/// OPT_FRAGMENT contents: where a TSDU sits within its APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub first_sqn: Sqn,
    pub offset: u32,
    pub total_length: u32,
}

/// OPT_PARITY_PRM contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityPrm {
    pub tg_size: u32,
    pub proactive: bool,
    pub on_demand: bool,
}

/// Decoded option chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketOptions {
    pub total_length: u16,
    pub fragment: Option<Fragment>,
    /// Byte offset of the OPT_FRAGMENT option within the TPDU.
    pub fragment_offset: Option<usize>,
    pub nak_list: SmallVec<[Sqn; 62]>,
    pub parity_prm: Option<ParityPrm>,
    pub curr_tgsize: Option<u32>,
    pub join: Option<Sqn>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// ODATA/RDATA in host representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub sqn: Sqn,
    pub trail: Sqn,
    pub options: PacketOptions,
    pub payload: Vec<u8>,
    pub is_parity: bool,
    pub is_var_pktlen: bool,
}

/// SPM in host representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Spm {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub path: IpAddr,
    pub options: PacketOptions,
}

/// NAK, NNAK and NCF share one body.
#[derive(Debug, Clone, PartialEq)]
pub struct NakPacket {
    pub sqn: Sqn,
    pub src_nla: IpAddr,
    pub grp_nla: IpAddr,
    pub is_parity: bool,
    pub list: SmallVec<[Sqn; 62]>,
}

impl NakPacket {
    /// Primary sequence followed by the OPT_NAK_LIST entries.
    pub fn sequences(&self) -> impl Iterator<Item = Sqn> + '_ {
        std::iter::once(self.sqn).chain(self.list.iter().copied())
    }
}

/// A parsed TPDU, dispatched on by the socket layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PgmMessage {
    Spm(Spm),
    OData(Data),
    RData(Data),
    Nak(NakPacket),
    NNak(NakPacket),
    Ncf(NakPacket),
    Spmr(PacketOptions),
    Poll,
    Polr,
    Ack,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse and validate the common header. The checksum is verified here:
/// ODATA and RDATA must carry one, other types may leave the field zero.
pub fn parse_header(tpdu: &[u8]) -> Result<PgmHeader, PacketError> {
    if tpdu.len() < HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let typ = PacketType::from_wire(tpdu[4]).ok_or(PacketError::UnknownType)?;
    let checksum = read_u16(tpdu, 6);
    let is_data = matches!(typ, PacketType::OData | PacketType::RData);
    if checksum == 0 {
        if is_data {
            return Err(PacketError::MissingChecksum);
        }
    } else if checksum::csum_tpdu(tpdu, 0) != checksum {
        return Err(PacketError::Checksum);
    }
    Ok(PgmHeader {
        sport: read_u16(tpdu, 0),
        dport: read_u16(tpdu, 2),
        typ,
        options: tpdu[5],
        checksum,
        gsi: Gsi([tpdu[8], tpdu[9], tpdu[10], tpdu[11], tpdu[12], tpdu[13]]),
        tsdu_length: read_u16(tpdu, 14),
    })
}

/// Parse one full TPDU into its header and message.
pub fn parse_tpdu(tpdu: &[u8]) -> Result<(PgmHeader, PgmMessage), PacketError> {
    let header = parse_header(tpdu)?;
    let message = match header.typ {
        PacketType::OData | PacketType::RData => {
            let data = parse_data(&header, tpdu)?;
            if header.typ == PacketType::OData {
                PgmMessage::OData(data)
            } else {
                PgmMessage::RData(data)
            }
        }
        PacketType::Spm => PgmMessage::Spm(parse_spm(&header, tpdu)?),
        PacketType::Nak | PacketType::NNak | PacketType::Ncf => {
            let nak = parse_nak(&header, tpdu)?;
            match header.typ {
                PacketType::Nak => PgmMessage::Nak(nak),
                PacketType::NNak => PgmMessage::NNak(nak),
                _ => PgmMessage::Ncf(nak),
            }
        }
        PacketType::Spmr => {
            let options = if header.options & OPT_PRESENT != 0 {
                parse_options(tpdu, HEADER_LEN)?.0
            } else {
                PacketOptions::default()
            };
            PgmMessage::Spmr(options)
        }
        PacketType::Poll => PgmMessage::Poll,
        PacketType::Polr => PgmMessage::Polr,
        PacketType::Ack => PgmMessage::Ack,
    };
    Ok((header, message))
}

fn parse_data(header: &PgmHeader, tpdu: &[u8]) -> Result<Data, PacketError> {
    if tpdu.len() < HEADER_LEN + DATA_HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let sqn = Sqn(read_u32(tpdu, HEADER_LEN));
    let trail = Sqn(read_u32(tpdu, HEADER_LEN + 4));
    let mut at = HEADER_LEN + DATA_HEADER_LEN;
    let options = if header.options & OPT_PRESENT != 0 {
        let (options, next) = parse_options(tpdu, at)?;
        at = next;
        options
    } else {
        PacketOptions::default()
    };
    let tsdu_length = usize::from(header.tsdu_length);
    if tpdu.len() < at + tsdu_length {
        return Err(PacketError::Truncated);
    }
    Ok(Data {
        sqn,
        trail,
        options,
        payload: tpdu[at..at + tsdu_length].to_vec(),
        is_parity: header.options & OPT_PARITY != 0,
        is_var_pktlen: header.options & OPT_VAR_PKTLEN != 0,
    })
}

fn parse_spm(header: &PgmHeader, tpdu: &[u8]) -> Result<Spm, PacketError> {
    if tpdu.len() < HEADER_LEN + 16 {
        return Err(PacketError::Truncated);
    }
    let spm_sqn = Sqn(read_u32(tpdu, HEADER_LEN));
    let trail = Sqn(read_u32(tpdu, HEADER_LEN + 4));
    let lead = Sqn(read_u32(tpdu, HEADER_LEN + 8));
    let (path, at) = parse_nla(tpdu, HEADER_LEN + 12)?;
    let options = if header.options & OPT_PRESENT != 0 {
        parse_options(tpdu, at)?.0
    } else {
        PacketOptions::default()
    };
    Ok(Spm {
        spm_sqn,
        trail,
        lead,
        path,
        options,
    })
}

fn parse_nak(header: &PgmHeader, tpdu: &[u8]) -> Result<NakPacket, PacketError> {
    if tpdu.len() < HEADER_LEN + 4 {
        return Err(PacketError::Truncated);
    }
    let sqn = Sqn(read_u32(tpdu, HEADER_LEN));
    let (src_nla, at) = parse_nla(tpdu, HEADER_LEN + 4)?;
    let (grp_nla, at) = parse_nla(tpdu, at)?;
    let options = if header.options & OPT_PRESENT != 0 {
        parse_options(tpdu, at)?.0
    } else {
        PacketOptions::default()
    };
    Ok(NakPacket {
        sqn,
        src_nla,
        grp_nla,
        is_parity: header.options & OPT_PARITY != 0,
        list: options.nak_list,
    })
}

/// Decode an `{afi:16, reserved:16, nla}` block. AFI 1 is IPv4, 2 is IPv6;
/// anything else discards the packet.
fn parse_nla(tpdu: &[u8], at: usize) -> Result<(IpAddr, usize), PacketError> {
    if tpdu.len() < at + 4 {
        return Err(PacketError::Truncated);
    }
    match read_u16(tpdu, at) {
        1 => {
            if tpdu.len() < at + 8 {
                return Err(PacketError::Truncated);
            }
            let octets: [u8; 4] = tpdu[at + 4..at + 8].try_into().unwrap();
            Ok((IpAddr::V4(Ipv4Addr::from(octets)), at + 8))
        }
        2 => {
            if tpdu.len() < at + 20 {
                return Err(PacketError::Truncated);
            }
            let octets: [u8; 16] = tpdu[at + 4..at + 20].try_into().unwrap();
            Ok((IpAddr::V6(Ipv6Addr::from(octets)), at + 20))
        }
        _ => Err(PacketError::BadAfi),
    }
}

/// Walk the option chain starting at `at`. Returns the decoded options and
/// the offset of the first byte after the chain.
fn parse_options(tpdu: &[u8], at: usize) -> Result<(PacketOptions, usize), PacketError> {
    // Mandatory OPT_LENGTH first, fixed four bytes.
    if tpdu.len() < at + OPT_LENGTH_LEN {
        return Err(PacketError::BadOptions);
    }
    if tpdu[at] & !OPT_END != OPT_LENGTH || tpdu[at + 1] as usize != OPT_LENGTH_LEN {
        return Err(PacketError::BadOptions);
    }
    let total_length = read_u16(tpdu, at + 2);
    let end = at + usize::from(total_length);
    if usize::from(total_length) < OPT_LENGTH_LEN || end > tpdu.len() {
        return Err(PacketError::BadOptions);
    }

    let mut options = PacketOptions {
        total_length,
        ..PacketOptions::default()
    };
    let mut seen: u32 = 1 << OPT_LENGTH;
    let mut pos = at + OPT_LENGTH_LEN;
    let mut terminated = tpdu[at] & OPT_END != 0;

    for _ in 0..MAX_OPTIONS {
        if terminated || pos >= end {
            break;
        }
        if pos + 3 > end {
            return Err(PacketError::BadOptions);
        }
        let opt_type = tpdu[pos] & !OPT_END;
        terminated = tpdu[pos] & OPT_END != 0;
        let opt_len = usize::from(tpdu[pos + 1]);
        let reserved = tpdu[pos + 2];
        if opt_len < 3 || pos + opt_len > end {
            return Err(PacketError::BadOptions);
        }
        if opt_type < 32 {
            if seen & (1 << opt_type) != 0 {
                return Err(PacketError::BadOptions);
            }
            seen |= 1 << opt_type;
        }
        match opt_type {
            OPT_FRAGMENT => {
                if opt_len != OPT_FRAGMENT_LEN {
                    return Err(PacketError::BadOptions);
                }
                options.fragment = Some(Fragment {
                    first_sqn: Sqn(read_u32(tpdu, pos + 3)),
                    offset: read_u32(tpdu, pos + 7),
                    total_length: read_u32(tpdu, pos + 11),
                });
                options.fragment_offset = Some(pos);
            }
            OPT_NAK_LIST => {
                let count = (opt_len - 3) / 4;
                if opt_len != 3 + count * 4 || count > MAX_NAK_LIST {
                    return Err(PacketError::BadOptions);
                }
                for i in 0..count {
                    options.nak_list.push(Sqn(read_u32(tpdu, pos + 3 + i * 4)));
                }
            }
            OPT_PARITY_PRM => {
                if opt_len != 7 {
                    return Err(PacketError::BadOptions);
                }
                options.parity_prm = Some(ParityPrm {
                    tg_size: read_u32(tpdu, pos + 3),
                    proactive: reserved & PARITY_PRM_PRO != 0,
                    on_demand: reserved & PARITY_PRM_OND != 0,
                });
            }
            OPT_CURR_TGSIZE => {
                if opt_len != 7 {
                    return Err(PacketError::BadOptions);
                }
                options.curr_tgsize = Some(read_u32(tpdu, pos + 3));
            }
            OPT_JOIN => {
                if opt_len != 7 {
                    return Err(PacketError::BadOptions);
                }
                options.join = Some(Sqn(read_u32(tpdu, pos + 3)));
            }
            OPT_SYN => options.syn = true,
            OPT_FIN => options.fin = true,
            OPT_RST => options.rst = true,
            other => {
                if reserved & OPX_NETWORK != 0 {
                    return Err(PacketError::UnknownNetworkOption);
                }
                trace!(opt_type = other, "skipping unknown option");
            }
        }
        pos += opt_len;
    }
    if pos > end || (!terminated && pos < end) {
        return Err(PacketError::BadOptions);
    }
    Ok((options, end))
}

/// Incremental TPDU builder. Options are appended between `begin_options`
/// and `end_options`; the checksum is filled by `finish`.
pub struct TpduBuilder {
    buf: Vec<u8>,
    opt_length_at: Option<usize>,
    last_opt_at: Option<usize>,
}

impl TpduBuilder {
    pub fn new(sport: u16, dport: u16, typ: PacketType, opt_flags: u8, gsi: Gsi) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN + 32);
        buf.extend_from_slice(&sport.to_be_bytes());
        buf.extend_from_slice(&dport.to_be_bytes());
        buf.push(typ as u8);
        buf.push(opt_flags);
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.extend_from_slice(gsi.as_bytes());
        buf.extend_from_slice(&[0, 0]); // tsdu_length
        Self {
            buf,
            opt_length_at: None,
            last_opt_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn push_u16(&mut self, val: u16) -> &mut Self {
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn push_u32(&mut self, val: u32) -> &mut Self {
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn push_sqn(&mut self, sqn: Sqn) -> &mut Self {
        self.push_u32(sqn.0)
    }

    pub fn push_nla(&mut self, addr: &IpAddr) -> &mut Self {
        match addr {
            IpAddr::V4(v4) => {
                self.push_u16(1).push_u16(0);
                self.buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.push_u16(2).push_u16(0);
                self.buf.extend_from_slice(&v6.octets());
            }
        }
        self
    }

    pub fn begin_options(&mut self) -> &mut Self {
        debug_assert!(self.opt_length_at.is_none());
        self.buf[5] |= OPT_PRESENT;
        self.opt_length_at = Some(self.buf.len());
        self.buf.push(OPT_LENGTH);
        self.buf.push(OPT_LENGTH_LEN as u8);
        self.buf.extend_from_slice(&[0, 0]); // total length placeholder
        self
    }

    /// Append one option `{type, length, reserved, body}`.
    pub fn push_option(&mut self, opt_type: u8, reserved: u8, body: &[u8]) -> &mut Self {
        debug_assert!(self.opt_length_at.is_some());
        self.last_opt_at = Some(self.buf.len());
        self.buf.push(opt_type);
        self.buf.push((3 + body.len()) as u8);
        self.buf.push(reserved);
        self.buf.extend_from_slice(body);
        self
    }

    pub fn push_fragment(&mut self, fragment: &Fragment) -> &mut Self {
        let mut body = [0u8; 12];
        body[..4].copy_from_slice(&fragment.first_sqn.0.to_be_bytes());
        body[4..8].copy_from_slice(&fragment.offset.to_be_bytes());
        body[8..].copy_from_slice(&fragment.total_length.to_be_bytes());
        self.push_option(OPT_FRAGMENT, 0, &body)
    }

    /// Close the option chain: set the terminator bit on the final option
    /// and fill in OPT_LENGTH's total.
    pub fn end_options(&mut self) -> &mut Self {
        let at = self.opt_length_at.expect("open option chain");
        let total = (self.buf.len() - at) as u16;
        self.buf[at + 2..at + 4].copy_from_slice(&total.to_be_bytes());
        let last = self.last_opt_at.unwrap_or(at);
        self.buf[last] |= OPT_END;
        self
    }

    /// Append the TSDU payload and record its length in the header.
    pub fn push_payload(&mut self, payload: &[u8]) -> usize {
        let at = self.buf.len();
        let tsdu_length = payload.len() as u16;
        self.buf[14..16].copy_from_slice(&tsdu_length.to_be_bytes());
        self.buf.extend_from_slice(payload);
        at
    }

    /// Record a TSDU length without appending the bytes (parity synthesis
    /// writes the payload itself).
    pub fn set_tsdu_length(&mut self, tsdu_length: u16) -> &mut Self {
        self.buf[14..16].copy_from_slice(&tsdu_length.to_be_bytes());
        self
    }

    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let at = self.buf.len();
        self.buf.extend_from_slice(bytes);
        at
    }

    /// Compute the checksum over the whole TPDU and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let sum = checksum::csum_tpdu(&self.buf, 0);
        self.buf[6..8].copy_from_slice(&sum.to_be_bytes());
        self.buf
    }

    /// Return the bytes with the checksum field left zero (types that may
    /// omit it).
    pub fn finish_unchecksummed(self) -> Vec<u8> {
        self.buf
    }
}

/// Build an SPM announcing the window edges, with OPT_PARITY_PRM when FEC
/// is in use.
pub fn build_spm(
    tsi: &Tsi,
    dport: u16,
    spm_sqn: Sqn,
    trail: Sqn,
    lead: Sqn,
    path: &IpAddr,
    parity_prm: Option<ParityPrm>,
) -> Vec<u8> {
    let mut b = TpduBuilder::new(tsi.sport, dport, PacketType::Spm, OPT_NETWORK, tsi.gsi);
    b.push_sqn(spm_sqn)
        .push_sqn(trail)
        .push_sqn(lead)
        .push_nla(path);
    if let Some(prm) = parity_prm {
        let mut reserved = 0u8;
        if prm.proactive {
            reserved |= PARITY_PRM_PRO;
        }
        if prm.on_demand {
            reserved |= PARITY_PRM_OND;
        }
        b.begin_options();
        b.push_option(OPT_PARITY_PRM, reserved, &prm.tg_size.to_be_bytes());
        b.end_options();
    }
    b.finish()
}

/// Build a NAK (receiver to source; ports are swapped relative to the data
/// direction). `list` carries up to [`MAX_NAK_LIST`] additional sequences.
pub fn build_nak(
    source: &Tsi,
    dport: u16,
    sqn: Sqn,
    src_nla: &IpAddr,
    grp_nla: &IpAddr,
    list: &[Sqn],
    is_parity: bool,
) -> Vec<u8> {
    debug_assert!(list.len() <= MAX_NAK_LIST);
    let flags = if is_parity { OPT_PARITY } else { 0 };
    let mut b = TpduBuilder::new(dport, source.sport, PacketType::Nak, flags, source.gsi);
    b.push_sqn(sqn).push_nla(src_nla).push_nla(grp_nla);
    if !list.is_empty() {
        let mut body = Vec::with_capacity(list.len() * 4);
        for sqn in list {
            body.extend_from_slice(&sqn.0.to_be_bytes());
        }
        b.begin_options();
        b.push_option(OPT_NAK_LIST, 0, &body);
        b.end_options();
    }
    b.finish()
}

/// Build an NCF (source to group, confirming a NAK).
pub fn build_ncf(
    tsi: &Tsi,
    dport: u16,
    sqn: Sqn,
    src_nla: &IpAddr,
    grp_nla: &IpAddr,
    list: &[Sqn],
    is_parity: bool,
) -> Vec<u8> {
    debug_assert!(list.len() <= MAX_NAK_LIST);
    let flags = OPT_NETWORK | if is_parity { OPT_PARITY } else { 0 };
    let mut b = TpduBuilder::new(tsi.sport, dport, PacketType::Ncf, flags, tsi.gsi);
    b.push_sqn(sqn).push_nla(src_nla).push_nla(grp_nla);
    if !list.is_empty() {
        let mut body = Vec::with_capacity(list.len() * 4);
        for sqn in list {
            body.extend_from_slice(&sqn.0.to_be_bytes());
        }
        b.begin_options();
        b.push_option(OPT_NAK_LIST, 0, &body);
        b.end_options();
    }
    b.finish()
}

/// Build an SPMR (receiver to source, requesting a prompt SPM).
pub fn build_spmr(source: &Tsi, dport: u16) -> Vec<u8> {
    TpduBuilder::new(dport, source.sport, PacketType::Spmr, 0, source.gsi).finish()
}
