//! Stream frames: the plaintext carried inside encrypted data packets.
//!
//! The reliable transport consumes decrypted frames and produces frames for
//! encryption. Layouts (big-endian):
//!
//! ```text
//! Data: [0x00][seq: 4][cumulative ack: 4][payload: n]
//! Ack:  [0x01][cumulative ack: 4][sack count: 1][count x seq: 4]
//! Kill: [0x02]
//! ```
//!
//! A data frame piggybacks the receiver's cumulative ack; standalone ack
//! frames additionally report selectively received out-of-order segments.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packet::PacketError;

const FRAME_DATA: u8 = 0x00;
const FRAME_ACK: u8 = 0x01;
const FRAME_KILL: u8 = 0x02;

/// Maximum selective-ack entries in one ack frame.
pub const MAX_SACK_ENTRIES: usize = 32;

/// A stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data segment with a piggybacked cumulative ack.
    Data {
        /// Segment sequence number
        seq: u32,
        /// Highest contiguous sequence received by the sender of this frame
        cumulative_ack: u32,
        /// Segment payload
        payload: Vec<u8>,
    },
    /// A standalone selective acknowledgment.
    Ack {
        /// Highest contiguous sequence received plus one
        cumulative_ack: u32,
        /// Sequences received beyond the contiguous run
        sacks: Vec<u32>,
    },
    /// End-of-stream signal.
    Kill,
}

impl Frame {
    /// Serializes the frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Data {
                seq,
                cumulative_ack,
                payload,
            } => {
                buf.put_u8(FRAME_DATA);
                buf.put_u32(*seq);
                buf.put_u32(*cumulative_ack);
                buf.put_slice(payload);
            }
            Frame::Ack {
                cumulative_ack,
                sacks,
            } => {
                buf.put_u8(FRAME_ACK);
                buf.put_u32(*cumulative_ack);
                let count = sacks.len().min(MAX_SACK_ENTRIES);
                buf.put_u8(count as u8);
                for seq in sacks.iter().take(count) {
                    buf.put_u32(*seq);
                }
            }
            Frame::Kill => {
                buf.put_u8(FRAME_KILL);
            }
        }
        buf.freeze()
    }

    /// Deserializes a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }

        match buf.get_u8() {
            FRAME_DATA => {
                if buf.remaining() < 8 {
                    return Err(PacketError::Truncated {
                        expected: 8,
                        available: buf.remaining(),
                    });
                }
                let seq = buf.get_u32();
                let cumulative_ack = buf.get_u32();
                Ok(Frame::Data {
                    seq,
                    cumulative_ack,
                    payload: buf.to_vec(),
                })
            }
            FRAME_ACK => {
                if buf.remaining() < 5 {
                    return Err(PacketError::Truncated {
                        expected: 5,
                        available: buf.remaining(),
                    });
                }
                let cumulative_ack = buf.get_u32();
                let count = buf.get_u8() as usize;
                if count > MAX_SACK_ENTRIES {
                    return Err(PacketError::TooManyNodes(count));
                }
                if buf.remaining() < count * 4 {
                    return Err(PacketError::Truncated {
                        expected: count * 4,
                        available: buf.remaining(),
                    });
                }
                let mut sacks = Vec::with_capacity(count);
                for _ in 0..count {
                    sacks.push(buf.get_u32());
                }
                Ok(Frame::Ack {
                    cumulative_ack,
                    sacks,
                })
            }
            FRAME_KILL => Ok(Frame::Kill),
            other => Err(PacketError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame::Data {
            seq: 7,
            cumulative_ack: 3,
            payload: b"hello".to_vec(),
        };
        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_empty_payload_data_frame() {
        let frame = Frame::Data {
            seq: 0,
            cumulative_ack: 0,
            payload: Vec::new(),
        };
        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_ack_frame_roundtrip() {
        let frame = Frame::Ack {
            cumulative_ack: 10,
            sacks: vec![12, 14, 15],
        };
        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_ack_sacks_clamped_on_encode() {
        let frame = Frame::Ack {
            cumulative_ack: 0,
            sacks: (0..100).collect(),
        };
        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        match decoded {
            Frame::Ack { sacks, .. } => assert_eq!(sacks.len(), MAX_SACK_ENTRIES),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_kill_frame_roundtrip() {
        let decoded = Frame::from_bytes(&Frame::Kill.to_bytes()).unwrap();
        assert_eq!(decoded, Frame::Kill);
    }

    #[test]
    fn test_unknown_frame_kind() {
        assert!(Frame::from_bytes(&[0x99]).is_err());
    }

    #[test]
    fn test_truncated_frames() {
        assert!(Frame::from_bytes(&[]).is_err());
        assert!(Frame::from_bytes(&[FRAME_DATA, 0, 0]).is_err());
        assert!(Frame::from_bytes(&[FRAME_ACK, 0]).is_err());
    }
}
