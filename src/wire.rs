//! On-wire message formats shared by every node.
//!
//! Every datagram starts with a 4-byte little-endian `pipe_id`. A `pipe_id`
//! of zero means "control message for the multiplexer itself"; anything else
//! means "data packet for this pipe". Control and data messages are decoded
//! by reading that leading field first and branching — never by
//! reinterpreting one struct's bytes as another's.

use std::convert::TryInto;

/// Maximum payload carried by a single data packet, chosen to fit inside one
/// non-fragmenting UDP datagram.
pub const MAX_PACKET_SIZE: usize = 1472;

/// Size in bytes of the `pipe_id` + `stream_pos` data-packet header.
pub const DATA_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlaveMessageId {
    Connection = 0,
    Ping = 1,
    CreatePipe = 2,
    Acknowledgment = 3,
    PacketLoss = 4,
    Barrier = 5,
    Gather = 6,
}

impl SlaveMessageId {
    fn from_u8(b: u8) -> Option<Self> {
        use SlaveMessageId::*;
        Some(match b {
            0 => Connection,
            1 => Ping,
            2 => CreatePipe,
            3 => Acknowledgment,
            4 => PacketLoss,
            5 => Barrier,
            6 => Gather,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterMessageId {
    Connection = 0,
    Ping = 1,
    CreatePipe = 2,
    Barrier = 3,
    Gather = 4,
}

impl MasterMessageId {
    fn from_u8(b: u8) -> Option<Self> {
        use MasterMessageId::*;
        Some(match b {
            0 => Connection,
            1 => Ping,
            2 => CreatePipe,
            3 => Barrier,
            4 => Gather,
            _ => return None,
        })
    }
}

/// Slave -> master control message. Fixed size, always sent unicast to the
/// master's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveMessage {
    pub node_index: u32,
    pub pipe_id: u32,
    pub message_id: SlaveMessageId,
    pub barrier_id: u32,
    pub stream_pos: u32,
    pub packet_pos: u32,
    pub slave_value: u32,
}

impl SlaveMessage {
    pub const WIRE_SIZE: usize = 4 * 7;

    pub fn new(node_index: u32, message_id: SlaveMessageId) -> Self {
        SlaveMessage {
            node_index,
            pipe_id: 0,
            message_id,
            barrier_id: 0,
            stream_pos: 0,
            packet_pos: 0,
            slave_value: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.node_index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.pipe_id.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.message_id as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.barrier_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_pos.to_le_bytes());
        buf[20..24].copy_from_slice(&self.packet_pos.to_le_bytes());
        buf[24..28].copy_from_slice(&self.slave_value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let word = |r: std::ops::Range<usize>| -> u32 {
            u32::from_le_bytes(buf[r].try_into().unwrap())
        };
        Some(SlaveMessage {
            node_index: word(0..4),
            pipe_id: word(4..8),
            message_id: SlaveMessageId::from_u8(word(8..12) as u8)?,
            barrier_id: word(12..16),
            stream_pos: word(16..20),
            packet_pos: word(20..24),
            slave_value: word(24..28),
        })
    }
}

/// Master -> slaves control message, always sent multicast/broadcast.
///
/// `pipe_id` is always encoded as 0; it overlays the same leading 4 bytes a
/// data packet uses for its (nonzero) target pipe, which is what lets a
/// slave tell the two apart by reading only that field first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterMessage {
    pub pipe_id: u32,
    pub message_id: MasterMessageId,
    pub target_pipe_id: u32,
    pub barrier_id: u32,
    pub master_value: u32,
}

impl MasterMessage {
    pub const WIRE_SIZE: usize = 4 * 5;

    pub fn new(message_id: MasterMessageId) -> Self {
        MasterMessage {
            pipe_id: 0,
            message_id,
            target_pipe_id: 0,
            barrier_id: 0,
            master_value: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&0u32.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.message_id as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.target_pipe_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.barrier_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.master_value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let word = |r: std::ops::Range<usize>| -> u32 {
            u32::from_le_bytes(buf[r].try_into().unwrap())
        };
        Some(MasterMessage {
            pipe_id: word(0..4),
            message_id: MasterMessageId::from_u8(word(4..8) as u8)?,
            target_pipe_id: word(8..12),
            barrier_id: word(12..16),
            master_value: word(16..20),
        })
    }
}

/// Reads the leading 4-byte `pipe_id` of any datagram without committing to
/// an interpretation of the rest of it. Zero means control message
/// (`MasterMessage`); nonzero means data packet for that pipe.
pub fn decode_pipe_id(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
}

/// Encodes a data-packet header: a nonzero `pipe_id` followed by the
/// packet's `stream_pos`. The payload follows immediately after in the full
/// datagram, up to `MAX_PACKET_SIZE` bytes.
pub fn encode_data_header(pipe_id: u32, stream_pos: u32) -> [u8; DATA_HEADER_SIZE] {
    let mut buf = [0u8; DATA_HEADER_SIZE];
    buf[0..4].copy_from_slice(&pipe_id.to_le_bytes());
    buf[4..8].copy_from_slice(&stream_pos.to_le_bytes());
    buf
}

/// Decodes a data-packet header, returning `(pipe_id, stream_pos)`. Returns
/// `None` if the datagram is too short or its leading `pipe_id` is zero
/// (that's a `MasterMessage`, not a data packet).
pub fn decode_data_header(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < DATA_HEADER_SIZE {
        return None;
    }
    let pipe_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if pipe_id == 0 {
        return None;
    }
    let stream_pos = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    Some((pipe_id, stream_pos))
}

/// Reduction operator for `Multiplexer::gather`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOp {
    And,
    Or,
    Min,
    Max,
    Sum,
    Product,
}

impl GatherOp {
    /// Applies the operator to fold `next` into the running `acc`, matching
    /// the source's definitions exactly: `And`/`Or` are logical
    /// (nonzero-as-true), not bitwise.
    pub fn apply(self, acc: u32, next: u32) -> u32 {
        match self {
            GatherOp::And => ((acc != 0) && (next != 0)) as u32,
            GatherOp::Or => ((acc != 0) || (next != 0)) as u32,
            GatherOp::Min => acc.min(next),
            GatherOp::Max => acc.max(next),
            GatherOp::Sum => acc.wrapping_add(next),
            GatherOp::Product => acc.wrapping_mul(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_message_roundtrips() {
        let msg = SlaveMessage {
            node_index: 2,
            pipe_id: 7,
            message_id: SlaveMessageId::PacketLoss,
            barrier_id: 3,
            stream_pos: 1000,
            packet_pos: 1500,
            slave_value: 42,
        };
        let encoded = msg.encode();
        let decoded = SlaveMessage::decode(&encoded).expect("valid message");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn master_message_roundtrips() {
        let msg = MasterMessage {
            pipe_id: 0,
            message_id: MasterMessageId::Gather,
            target_pipe_id: 1,
            barrier_id: 5,
            master_value: 60,
        };
        let encoded = msg.encode();
        let decoded = MasterMessage::decode(&encoded).expect("valid message");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn master_message_always_decodes_as_pipe_zero() {
        let msg = MasterMessage::new(MasterMessageId::Ping);
        let encoded = msg.encode();
        assert_eq!(decode_pipe_id(&encoded), Some(0));
    }

    #[test]
    fn unknown_message_id_fails_to_decode() {
        let mut buf = [0u8; SlaveMessage::WIRE_SIZE];
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(SlaveMessage::decode(&buf).is_none());
    }

    #[test]
    fn data_header_roundtrips() {
        let header = encode_data_header(7, 1000);
        assert_eq!(decode_data_header(&header), Some((7, 1000)));
    }

    #[test]
    fn zero_pipe_id_is_not_a_data_header() {
        let header = encode_data_header(0, 1000);
        assert_eq!(decode_data_header(&header), None);
    }

    #[test]
    fn gather_op_matches_logical_semantics() {
        assert_eq!(GatherOp::And.apply(1, 0), 0);
        assert_eq!(GatherOp::Or.apply(0, 5), 1);
        assert_eq!(GatherOp::Sum.apply(10, 32), 42);
        assert_eq!(GatherOp::Product.apply(6, 7), 42);
        assert_eq!(GatherOp::Min.apply(10, 3), 3);
        assert_eq!(GatherOp::Max.apply(10, 3), 10);
    }
}
