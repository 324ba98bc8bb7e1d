use std::{
    fmt::Display,
    io::{Read, Write},
};

use anyhow::{anyhow, ensure, Context};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::BitField,
    piece::{Block, DataBlock},
};

/// The 68 byte connection preamble, sent once in each direction.
#[derive(Debug, Clone)]
pub struct HandShake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl HandShake {
    pub const SIZE: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0_u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let length = bytes.first().context("length byte is not set")?;
        ensure!(*length == 19, "unexpected protocol string length");

        ensure!(bytes.len() == Self::SIZE, "handshake must be 68 bytes");
        ensure!(&bytes[1..20] == b"BitTorrent protocol");
        let mut bytes = &bytes[20..];

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        bytes.read_exact(&mut reserved).context("reserved bytes")?;
        bytes.read_exact(&mut info_hash).context("hash bytes")?;
        bytes.read_exact(&mut peer_id).context("peer_id bytes")?;
        debug_assert!(bytes.is_empty());

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn as_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        let mut slice = &mut out[..];

        slice.write_all(&[19]).unwrap();
        slice.write_all(b"BitTorrent protocol").unwrap();
        slice.write_all(&self.reserved).unwrap();
        slice.write_all(&self.info_hash).unwrap();
        slice.write_all(&self.peer_id).unwrap();
        debug_assert!(slice.is_empty());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        payload: BitField,
    },
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {}", index),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.0.len())
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => write!(
                f,
                "Request for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => write!(
                f,
                "Cancel for piece {index} with offset {begin} and length {length}",
            ),
        }
    }
}

impl PeerMessage {
    pub fn from_frame(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let request_payload = |mut b: &[u8]| -> anyhow::Result<_> {
            let mut index_buffer = [0; 4];
            let mut begin_buffer = [0; 4];
            let mut length_buffer = [0; 4];
            b.read_exact(&mut index_buffer).context("index buffer")?;
            b.read_exact(&mut begin_buffer).context("begin buffer")?;
            b.read_exact(&mut length_buffer).context("length buffer")?;
            Ok((
                u32::from_be_bytes(index_buffer),
                u32::from_be_bytes(begin_buffer),
                u32::from_be_bytes(length_buffer),
            ))
        };
        let tag = frame[0];
        let payload = &frame[1..];
        match tag {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                let index_buffer = payload.get(0..4).context("have payload")?.try_into()?;

                Ok(PeerMessage::Have {
                    index: u32::from_be_bytes(index_buffer),
                })
            }
            5 => {
                let payload = BitField::new(payload);
                Ok(PeerMessage::Bitfield { payload })
            }
            6 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                let index_buffer: [u8; 4] = payload.get(0..4).context("piece index")?.try_into()?;
                let begin_buffer: [u8; 4] = payload.get(4..8).context("piece begin")?.try_into()?;
                let index = u32::from_be_bytes(index_buffer);
                let begin = u32::from_be_bytes(begin_buffer);
                let block = frame.slice(9..);
                Ok(PeerMessage::Piece {
                    index,
                    begin,
                    block,
                })
            }
            8 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            t => Err(anyhow!("unsupported tag: {}", t)),
        }
    }

    /// Tag and payload without the length prefix. Empty for keepalives.
    pub fn as_bytes(&self) -> Bytes {
        let request_to_bytes = |tag: u8, index: u32, begin: u32, length: u32| {
            let mut bytes = BytesMut::with_capacity(13);
            bytes.extend_from_slice(&[tag]);
            bytes.extend_from_slice(&index.to_be_bytes());
            bytes.extend_from_slice(&begin.to_be_bytes());
            bytes.extend_from_slice(&length.to_be_bytes());
            bytes
        };
        match self {
            PeerMessage::KeepAlive => Bytes::from_static(&[]),
            PeerMessage::Choke => Bytes::from_static(&[0]),
            PeerMessage::Unchoke => Bytes::from_static(&[1]),
            PeerMessage::Interested => Bytes::from_static(&[2]),
            PeerMessage::NotInterested => Bytes::from_static(&[3]),
            PeerMessage::Have { index } => {
                let mut bytes = BytesMut::with_capacity(5);
                bytes.extend_from_slice(&[4]);
                bytes.extend_from_slice(&index.to_be_bytes());
                bytes.into()
            }
            PeerMessage::Bitfield { payload } => {
                let mut bytes = BytesMut::with_capacity(1 + payload.0.len());
                bytes.extend_from_slice(&[5]);
                bytes.extend_from_slice(&payload.0);
                bytes.into()
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => request_to_bytes(6, *index, *begin, *length).into(),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                let mut bytes = BytesMut::with_capacity(9 + block.len());
                bytes.extend_from_slice(&[7]);
                bytes.extend_from_slice(&index.to_be_bytes());
                bytes.extend_from_slice(&begin.to_be_bytes());
                bytes.extend_from_slice(block);
                bytes.into()
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => request_to_bytes(8, *index, *begin, *length).into(),
        }
    }

    pub fn request(block: Block) -> Self {
        Self::Request {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn piece(data: DataBlock) -> Self {
        Self::Piece {
            index: data.piece,
            begin: data.offset,
            block: data.block,
        }
    }
}

#[derive(Debug)]
pub struct MessageFramer;

pub const MAX_FRAME_LENGTH: usize = 1 << 16;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read length marker.
            return Ok(None);
        }

        // Read length marker.
        let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        // Check that the length is not too large to avoid a denial of
        // service attack where the server runs out of memory.
        if length > MAX_FRAME_LENGTH {
            return Err(anyhow!(
                "length({}) is higher than allowed({})",
                length,
                MAX_FRAME_LENGTH
            ));
        }

        if src.len() < 4 + length {
            // We reserve more space in the buffer. This is not strictly
            // necessary, but is a good idea performance-wise.
            src.reserve(4 + length - src.len());

            // We inform the Framed that we need more bytes to form the next
            // frame.
            return Ok(None);
        }

        let mut frame = src.split_to(4 + length);
        // skip length bytes
        frame.advance(4);
        let frame = frame.freeze();
        let message = PeerMessage::from_frame(frame)
            .map_err(|e| anyhow!("failed to construct peer message: {}", e))?;

        Ok(Some(message))
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.as_bytes();
        let length = bytes.len();
        if length > MAX_FRAME_LENGTH {
            return Err(anyhow!(
                "length({}) is higher than allowed({})",
                length,
                MAX_FRAME_LENGTH
            ));
        }

        // The cast to u32 cannot overflow due to the length check above.
        let len_slice = u32::to_be_bytes(length as u32);

        dst.reserve(4 + length);
        dst.extend_from_slice(&len_slice);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::bitfield::BitField;

    use super::{HandShake, MessageFramer, PeerMessage};

    fn re_encode_message(msg: PeerMessage) {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        framer.encode(msg.clone(), &mut buffer).unwrap();
        let result = framer.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, result);
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_peer_message() {
        re_encode_message(PeerMessage::KeepAlive);
        re_encode_message(PeerMessage::Choke);
        re_encode_message(PeerMessage::Unchoke);
        re_encode_message(PeerMessage::Interested);
        re_encode_message(PeerMessage::NotInterested);
        re_encode_message(PeerMessage::Have { index: 123 });
        re_encode_message(PeerMessage::Bitfield {
            payload: BitField::empty(300),
        });
        re_encode_message(PeerMessage::Request {
            index: 22,
            begin: 100,
            length: 200,
        });
        re_encode_message(PeerMessage::Piece {
            index: 22,
            begin: 100,
            block: Bytes::from_static(&[23, 222, 32]),
        });
        re_encode_message(PeerMessage::Cancel {
            index: 22,
            begin: 100,
            length: 200,
        });
    }

    #[test]
    fn request_wire_bytes() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        framer
            .encode(
                PeerMessage::Request {
                    index: 42,
                    begin: 16384,
                    length: 16384,
                },
                &mut buffer,
            )
            .unwrap();
        assert_eq!(
            &buffer[..],
            &[
                0x00, 0x00, 0x00, 0x0D, 0x06, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x40, 0x00,
                0x00, 0x00, 0x40, 0x00
            ]
        );
    }

    #[test]
    fn frame_length_accounting() {
        let mut framer = MessageFramer;
        for (msg, expected) in [
            (PeerMessage::KeepAlive, 4),
            (PeerMessage::Choke, 5),
            (PeerMessage::Have { index: 0 }, 9),
            (
                PeerMessage::Piece {
                    index: 0,
                    begin: 0,
                    block: Bytes::from_static(b"abc"),
                },
                16,
            ),
        ] {
            let mut buffer = BytesMut::new();
            framer.encode(msg, &mut buffer).unwrap();
            assert_eq!(buffer.len(), expected);
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        framer.encode(PeerMessage::Have { index: 7 }, &mut buffer).unwrap();
        let mut partial = BytesMut::from(&buffer[..6]);
        assert!(framer.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&buffer[6..]);
        assert_eq!(
            framer.decode(&mut partial).unwrap().unwrap(),
            PeerMessage::Have { index: 7 }
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&u32::to_be_bytes(1 << 20));
        buffer.extend_from_slice(&[6; 32]);
        assert!(framer.decode(&mut buffer).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&u32::to_be_bytes(1));
        buffer.extend_from_slice(&[42]);
        assert!(framer.decode(&mut buffer).is_err());
    }

    #[test]
    fn handshake_round_trip() {
        let handshake = HandShake::new([7; 20], *b"OceanC12345678901234");
        let bytes = handshake.as_bytes();
        assert_eq!(bytes.len(), HandShake::SIZE);
        assert_eq!(bytes[0], 0x13);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[20..28], [0; 8]);

        let parsed = HandShake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.info_hash, [7; 20]);
        assert_eq!(&parsed.peer_id, b"OceanC12345678901234");
        assert_eq!(parsed.as_bytes(), bytes);
    }

    #[test]
    fn handshake_rejects_wrong_preamble() {
        let handshake = HandShake::new([7; 20], [1; 20]);
        let mut bytes = handshake.as_bytes();
        bytes[3] = b'X';
        assert!(HandShake::from_bytes(&bytes).is_err());
        assert!(HandShake::from_bytes(&bytes[..60]).is_err());
    }
}
