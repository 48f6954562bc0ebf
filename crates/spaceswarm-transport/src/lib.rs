//! # Spaceswarm Transport
//!
//! Network transport layer for Spaceswarm.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) datagram seam and its UDP backend
//! - [`UdpMux`](mux::UdpMux): one bound UDP socket carrying DHT datagrams,
//!   holepunch probes and any number of reliable ordered message streams
//! - The [`RawStream`](raw::RawStream) trait that encrypted connections are
//!   written against, with an in-process loopback implementation
//!
//! ## Datagram channels
//!
//! Every datagram on a mux socket starts with a one-byte channel tag:
//!
//! | Tag | Channel |
//! |-----|---------|
//! | `0x01` | DHT message |
//! | `0x02` | Stream packet |
//! | `0x03` | Holepunch probe |
//! | `0x04` | NAT probe |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mux;
pub mod packet;
pub mod raw;
pub mod stream;
pub mod transport;
pub mod udp;

pub use mux::{Datagram, UdpMux};
pub use raw::{LoopbackStream, RawStream, loopback_pair};
pub use stream::{MuxStream, StreamRegistry};
pub use transport::{Transport, TransportError, TransportResult};
pub use udp::UdpTransport;

/// Channel tag for DHT messages
pub const CHANNEL_DHT: u8 = 0x01;
/// Channel tag for stream packets
pub const CHANNEL_STREAM: u8 = 0x02;
/// Channel tag for holepunch probes
pub const CHANNEL_HOLEPUNCH: u8 = 0x03;
/// Channel tag for unsolicited NAT probes
pub const CHANNEL_NAT_PROBE: u8 = 0x04;

/// Largest datagram the mux sends
pub const MAX_DATAGRAM: usize = 1200;

/// Largest stream message payload (datagram minus channel tag and stream header)
pub const MAX_STREAM_PAYLOAD: usize = MAX_DATAGRAM - 1 - packet::HEADER_LEN;
