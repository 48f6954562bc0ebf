//! Stream packet framing.
//!
//! ```text
//! +------+-----------+-----------+-----------+---------+
//! | type | stream id |    seq    |    ack    | payload |
//! |  u8  |  u32 BE   |  u32 BE   |  u32 BE   |   ...   |
//! +------+-----------+-----------+-----------+---------+
//! ```
//!
//! `stream id` names the receiver's stream. `ack` is the sender's cumulative
//! receive point: every sequence number below it has been delivered.

use crate::CHANNEL_STREAM;

/// Stream header length in bytes
pub const HEADER_LEN: usize = 13;

/// Stream packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Reliable message
    Data = 1,
    /// Selective acknowledgement of `seq`
    Ack = 2,
    /// Reliable half-close
    End = 3,
    /// Abort the stream
    Reset = 4,
    /// Keep-alive request
    Ping = 5,
    /// Keep-alive reply
    Pong = 6,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            3 => Some(Self::End),
            4 => Some(Self::Reset),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Kinds that consume a sequence number and need acknowledgement
    #[must_use]
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Data | Self::End)
    }
}

/// Parsed stream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Packet kind
    pub kind: PacketKind,
    /// Destination stream id
    pub stream_id: u32,
    /// Sequence number
    pub seq: u32,
    /// Cumulative acknowledgement
    pub ack: u32,
}

impl StreamHeader {
    /// Build a full datagram, channel tag included.
    #[must_use]
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + HEADER_LEN + payload.len());
        buf.push(CHANNEL_STREAM);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a stream packet with the channel tag already stripped.
    ///
    /// Returns `None` for short or unknown packets.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let kind = PacketKind::from_u8(buf[0])?;
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let header = Self {
            kind,
            stream_id: word(1),
            seq: word(5),
            ack: word(9),
        };
        Some((header, &buf[HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let header = StreamHeader {
            kind: PacketKind::Data,
            stream_id: 0x0102_0304,
            seq: 7,
            ack: 9,
        };
        let buf = header.encode(b"xy");
        assert_eq!(buf[0], CHANNEL_STREAM);
        assert_eq!(buf[1], 1);
        assert_eq!(&buf[2..6], &[1, 2, 3, 4]);
        assert_eq!(buf.len(), 1 + HEADER_LEN + 2);
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert!(StreamHeader::decode(&[1, 0, 0]).is_none());
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 99;
        assert!(StreamHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_reliable_kinds() {
        assert!(PacketKind::Data.is_reliable());
        assert!(PacketKind::End.is_reliable());
        assert!(!PacketKind::Ack.is_reliable());
        assert!(!PacketKind::Ping.is_reliable());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = StreamHeader::decode(&data);
        }
    }
}
