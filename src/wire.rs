use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, Result};

/// A peer wire protocol message. The frame layout is
/// `<u32 length big-endian><u8 kind><payload>`; a zero length is a
/// keep-alive carrying neither kind nor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece: u32,
    },
    Bitfield(Vec<u8>),
    Request {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece: u32,
        begin: u32,
        length: u32,
    },
}

const KIND_CHOKE: u8 = 0;
const KIND_UNCHOKE: u8 = 1;
const KIND_INTERESTED: u8 = 2;
const KIND_NOT_INTERESTED: u8 = 3;
const KIND_HAVE: u8 = 4;
const KIND_BITFIELD: u8 = 5;
const KIND_REQUEST: u8 = 6;
const KIND_PIECE: u8 = 7;
const KIND_CANCEL: u8 = 8;

impl WireMessage {
    /// Serializes the full frame, length prefix included.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            WireMessage::KeepAlive => vec![0, 0, 0, 0],
            WireMessage::Choke => frame(KIND_CHOKE, &[]),
            WireMessage::Unchoke => frame(KIND_UNCHOKE, &[]),
            WireMessage::Interested => frame(KIND_INTERESTED, &[]),
            WireMessage::NotInterested => frame(KIND_NOT_INTERESTED, &[]),
            WireMessage::Have { piece } => frame(KIND_HAVE, &piece.to_be_bytes()),
            WireMessage::Bitfield(bits) => frame(KIND_BITFIELD, bits),
            WireMessage::Request {
                piece,
                begin,
                length,
            } => frame(KIND_REQUEST, &block_descriptor(*piece, *begin, *length)),
            WireMessage::Piece {
                piece,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&piece.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(KIND_PIECE, &payload)
            }
            WireMessage::Cancel {
                piece,
                begin,
                length,
            } => frame(KIND_CANCEL, &block_descriptor(*piece, *begin, *length)),
        }
    }

    /// Parses a message from its kind byte and payload (everything in
    /// the frame after the kind).
    pub fn parse(kind: u8, payload: &[u8]) -> Result<Self> {
        match kind {
            KIND_CHOKE => Ok(WireMessage::Choke),
            KIND_UNCHOKE => Ok(WireMessage::Unchoke),
            KIND_INTERESTED => Ok(WireMessage::Interested),
            KIND_NOT_INTERESTED => Ok(WireMessage::NotInterested),
            KIND_HAVE => {
                if payload.len() < 4 {
                    return Err(CodecError::PayloadTooShort {
                        kind: "have",
                        len: payload.len(),
                    }
                    .into());
                }
                let mut cursor = Cursor::new(payload);
                Ok(WireMessage::Have {
                    piece: cursor.read_u32::<BigEndian>()?,
                })
            }
            KIND_BITFIELD => Ok(WireMessage::Bitfield(payload.to_vec())),
            KIND_REQUEST | KIND_CANCEL => {
                if payload.len() < 12 {
                    return Err(CodecError::PayloadTooShort {
                        kind: if kind == KIND_REQUEST { "request" } else { "cancel" },
                        len: payload.len(),
                    }
                    .into());
                }
                let mut cursor = Cursor::new(payload);
                let piece = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let length = cursor.read_u32::<BigEndian>()?;
                if kind == KIND_REQUEST {
                    Ok(WireMessage::Request {
                        piece,
                        begin,
                        length,
                    })
                } else {
                    Ok(WireMessage::Cancel {
                        piece,
                        begin,
                        length,
                    })
                }
            }
            KIND_PIECE => {
                if payload.len() < 8 {
                    return Err(CodecError::PayloadTooShort {
                        kind: "piece",
                        len: payload.len(),
                    }
                    .into());
                }
                let mut cursor = Cursor::new(payload);
                let piece = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                Ok(WireMessage::Piece {
                    piece,
                    begin,
                    block: payload[8..].to_vec(),
                })
            }
            other => Err(CodecError::InvalidKind(other).into()),
        }
    }
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let length = 1 + payload.len();
    let mut bytes = Vec::with_capacity(4 + length);
    bytes.extend_from_slice(&(length as u32).to_be_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(payload);
    bytes
}

fn block_descriptor(piece: u32, begin: u32, length: u32) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&piece.to_be_bytes());
    bytes[4..8].copy_from_slice(&begin.to_be_bytes());
    bytes[8..12].copy_from_slice(&length.to_be_bytes());
    bytes
}

/// Frame decoder for the peer wire protocol. Keep-alive frames are
/// consumed without yielding a message; an out-of-range kind byte is a
/// protocol error and poisons the stream.
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = WireMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let mut length_bytes = [0u8; 4];
            length_bytes.copy_from_slice(&src[0..4]);
            let length = u32::from_be_bytes(length_bytes) as usize;

            if length == 0 {
                src.advance(4);
                continue;
            }
            if src.len() < 4 + length {
                src.reserve(4 + length - src.len());
                return Ok(None);
            }

            let frame = src.split_to(4 + length);
            let kind = frame[4];
            return Ok(Some(WireMessage::parse(kind, &frame[5..])?));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => {
                let needed = if src.len() >= 4 {
                    let mut length_bytes = [0u8; 4];
                    length_bytes.copy_from_slice(&src[0..4]);
                    4 + u32::from_be_bytes(length_bytes) as usize
                } else {
                    4
                };
                Err(CodecError::IncompleteFrame {
                    needed,
                    available: src.len(),
                }
                .into())
            }
        }
    }
}

pub struct FrameEncoder;

impl Encoder<WireMessage> for FrameEncoder {
    type Error = anyhow::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}
