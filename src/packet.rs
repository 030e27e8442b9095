use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt};
use crate::crypto::MAC_SIZE;
use crate::MAX_DATAGRAM_SIZE;

/// First bytes 32..128 are application info packets, surfaced verbatim.
pub const FIRST_INFO_PACKET_BYTE: u8 = 32;
/// First bytes with the high bit set are connected-protocol packets.
pub const CONNECTED_PACKET_BIT: u8 = 0x80;

/// Handshake packet types, the first byte of every non-connected datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeType {
    ConnectChallengeRequest = 0,
    ConnectChallengeResponse = 1,
    ConnectRequest = 2,
    ConnectReject = 3,
    ConnectAccept = 4,
    Disconnect = 5,
    Punch = 6,
    ArrangedConnectRequest = 7,
    IntroductionRequest = 8,
    SendPunchPacket = 9,
}

impl HandshakeType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use self::HandshakeType::*;
        Some(match b {
            0 => ConnectChallengeRequest,
            1 => ConnectChallengeResponse,
            2 => ConnectRequest,
            3 => ConnectReject,
            4 => ConnectAccept,
            5 => Disconnect,
            6 => Punch,
            7 => ArrangedConnectRequest,
            8 => IntroductionRequest,
            9 => SendPunchPacket,
            _ => {
                return None;
            }
        })
    }
}

/// Payload class of a connected-protocol packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketKind {
    /// Application payload; surfaced as a packet event and notified on ack.
    Data = 0,
    /// Empty payload sent to carry the acknowledgement window to the peer.
    Ack = 1,
    /// Empty keep-alive that solicits an acknowledgement.
    Ping = 2,
}

impl PacketKind {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => PacketKind::Data,
            1 => PacketKind::Ack,
            2 => PacketKind::Ping,
            _ => {
                return None;
            }
        })
    }
}

/// Bits of the send sequence carried on the wire: two in the first byte and
/// sixteen trailing.
pub const SEQUENCE_WIRE_BITS: u32 = 18;
const SEQUENCE_WIRE_MASK: u32 = (1 << SEQUENCE_WIRE_BITS) - 1;

/// Clear header of a connected-protocol packet.
///
/// Layout: first byte `1kk000ss` (kind, sequence bits 17..16), sequence bits
/// 15..0, the 32-bit ack base, and the 31-bit ack bitmap. The 40-bit MAC and
/// the encrypted payload follow.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DataHeader {
    pub kind: PacketKind,
    pub sequence: u32,
    pub ack_base: u32,
    pub ack_bits: u32,
}

pub const DATA_HEADER_SIZE: usize = 11;
/// Largest application payload that fits a maximum datagram after the header
/// and signature.
pub const MAX_PACKET_PAYLOAD: usize = MAX_DATAGRAM_SIZE - DATA_HEADER_SIZE - MAC_SIZE;

impl DataHeader {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let first = CONNECTED_PACKET_BIT
            | (self.kind as u8) << 5
            | ((self.sequence >> 16) & 0x3) as u8;
        buf.put_u8(first);
        buf.put_u16_le(self.sequence as u16);
        buf.write(self.ack_base);
        buf.write(self.ack_bits & 0x7fff_ffff);
    }

    /// Decodes the clear header, expanding the truncated sequence against the
    /// next sequence the receiver expects.
    pub fn decode<B: Buf>(buf: &mut B, expected_sequence: u32) -> coding::Result<Self> {
        let first = buf.get::<u8>()?;
        let kind = match PacketKind::from_bits((first >> 5) & 0x3) {
            Some(kind) => kind,
            None => {
                return Err(coding::UnexpectedEnd);
            }
        };
        let wire = u32::from(buf.get::<u16>()?) | u32::from(first & 0x3) << 16;
        Ok(Self {
            kind,
            sequence: expand_sequence(expected_sequence, wire),
            ack_base: buf.get()?,
            ack_bits: buf.get::<u32>()? & 0x7fff_ffff,
        })
    }
}

/// Picks the 32-bit sequence closest to `expected` whose low bits match the
/// wire value, so the full sequence survives truncation and rollover.
pub fn expand_sequence(expected: u32, wire: u32) -> u32 {
    let delta = wire.wrapping_sub(expected) & SEQUENCE_WIRE_MASK;
    if delta < 1 << (SEQUENCE_WIRE_BITS - 1) {
        expected.wrapping_add(delta)
    } else {
        expected.wrapping_add(delta).wrapping_sub(1 << SEQUENCE_WIRE_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(header: DataHeader) -> DataHeader {
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_SIZE);
        let mut r = &buf[..];
        DataHeader::decode(&mut r, header.sequence).unwrap()
    }

    #[test]
    fn header_round_trip() {
        let header = DataHeader {
            kind: PacketKind::Data,
            sequence: 0x0003_4567,
            ack_base: 0xdead_beef,
            ack_bits: 0x7555_5555,
        };
        assert_eq!(round_trip(header), header);
    }

    #[test]
    fn header_round_trip_ack() {
        let header = DataHeader {
            kind: PacketKind::Ack,
            sequence: 3,
            ack_base: 0,
            ack_bits: 0,
        };
        assert_eq!(round_trip(header), header);
    }

    #[test]
    fn top_ack_bit_is_reserved() {
        let header = DataHeader {
            kind: PacketKind::Ping,
            sequence: 9,
            ack_base: 1,
            ack_bits: 0xffff_ffff,
        };
        assert_eq!(round_trip(header).ack_bits, 0x7fff_ffff);
    }

    #[test]
    fn sequence_expansion() {
        assert_eq!(expand_sequence(100, 100), 100);
        assert_eq!(expand_sequence(100, 131), 131);
        // A slightly stale packet resolves backwards, not 2^18 forward.
        assert_eq!(expand_sequence(0x2_0005, 0x2_0001 & 0x3_ffff), 0x2_0005 - 4);
        // High bits are recovered across the truncation boundary.
        assert_eq!(expand_sequence(0x4_0000, 0x3_ffff), 0x3_ffff);
        assert_eq!(expand_sequence(0x3_ffff, 0), 0x4_0000);
    }

    #[test]
    fn sequence_expansion_rollover() {
        assert_eq!(expand_sequence(0xffff_fffe, 0), 0);
        assert_eq!(expand_sequence(1, 0x3_ffff), 0xffff_ffff);
    }

    #[test]
    fn invalid_kind_rejected() {
        let mut buf = Vec::new();
        DataHeader {
            kind: PacketKind::Ping,
            sequence: 0,
            ack_base: 0,
            ack_bits: 0,
        }
        .encode(&mut buf);
        buf[0] |= 0x3 << 5;
        let mut r = &buf[..];
        assert!(DataHeader::decode(&mut r, 0).is_err());
    }
}
