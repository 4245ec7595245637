use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::Packet;

const HEADER_LEN: usize = 4;
/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FF_FF;

/// Frames packets as a 3-byte little-endian length, a sequence id and the
/// payload. Payloads split across several maximum-size frames are rejected.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], 0]) as usize;
        if len == MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "multi-frame packets are not supported",
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let sequence_id = src[3];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Packet::new(sequence_id, payload)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = item.payload.len();
        if len >= MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet payload of {} bytes is too large", len),
            ));
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_uint_le(len as u64, 3);
        dst.put_u8(item.sequence_id);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
