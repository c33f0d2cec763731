//! # PGM Transport
//!
//! Endpoint core of the Pragmatic General Multicast reliable transport
//! protocol (RFC 3208): reliable, ordered, duplicate-free delivery from one
//! source to many receivers over IP multicast, with NAK-based loss recovery
//! and optional Reed-Solomon forward error correction.
//!
//! ## Architecture
//!
//! - **Framing**: wire codec for PGM TPDUs with the 1's-complement checksum
//!   and 32-bit circular sequence arithmetic.
//! - **Windows**: a transmit window retaining sent TPDUs for repair and a
//!   per-sender receive window driving the NAK state machines and in-order
//!   APDU delivery.
//! - **Socket**: a sans-io façade multiplexing peers, scheduling SPM
//!   announcements and regulating output through leaky-bucket rate limits.
//!
//! The core performs no I/O and reads no clocks of its own: datagrams move
//! through the [`DatagramSink`]/[`DatagramSource`] traits and time comes
//! from an injected [`Clock`], so sessions are fully deterministic under
//! test.

pub mod checksum;
pub mod error;
pub mod fec;
pub mod packet;
pub mod peer;
pub mod rate;
pub mod rxw;
pub mod skb;
pub mod socket;
pub mod sqn;
pub mod time;
pub mod tsi;
pub mod txw;

pub use error::{PacketError, PgmError};
pub use fec::GroupCodec;
pub use packet::{Fragment, PacketType, PgmMessage};
pub use rate::RateLimiter;
pub use rxw::{NakTiming, ReceiveWindow, RxwAdd, SlotState};
pub use skb::SocketBuffer;
pub use socket::{
    Datagram, DatagramSink, DatagramSource, IoStatus, PgmSocket, RxMessage, SocketConfig,
    SocketRole, SocketStats,
};
pub use sqn::Sqn;
pub use time::{Clock, ManualClock, MonotonicClock};
pub use tsi::{Gsi, Tsi};
pub use txw::{Retransmit, RetransmitPush, TransmitWindow};
