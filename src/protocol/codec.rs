use std::io::Write as _;

use bytes::{Buf, BufMut, BytesMut};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Payloads below this size are sent uncompressed even in compressed mode.
/// Compressing tiny packets costs more than it saves.
const MIN_COMPRESS_LENGTH: usize = 50;

/// MySQL packet codec for use with tokio Framed
///
/// Reassembles logical payloads split across max-size frames on decode and
/// splits them on encode (see `Packet::encode`).
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Accumulated frames of a split payload not yet complete
    partial: Option<BytesMut>,
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(frame) = Packet::decode(src) {
            let splitting = frame.is_partial();

            if self.partial.is_none() && !splitting {
                return Ok(Some(frame));
            }

            let acc = self.partial.get_or_insert_with(BytesMut::new);
            acc.extend_from_slice(&frame.payload);

            if !splitting {
                let payload = self.partial.take().unwrap_or_default().freeze();
                return Ok(Some(Packet {
                    sequence_id: frame.sequence_id,
                    payload,
                }));
            }
        }
        Ok(None)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Codec for the compressed protocol.
///
/// Wraps logical packets in the 7-byte compressed header: 3 bytes compressed
/// length, 1 byte compressed sequence id, 3 bytes uncompressed length (zero
/// when the body is stored raw). The inner body is one or more ordinary
/// framed packets.
#[derive(Debug, Default)]
pub struct CompressedCodec {
    inner: PacketCodec,
    /// Decompressed-but-unparsed inner bytes
    inflated: BytesMut,
    comp_seq: u8,
}

impl CompressedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the compressed sequence counter (per command, like the packet
    /// sequence itself).
    pub fn reset_sequence(&mut self) {
        self.comp_seq = 0;
    }
}

impl Decoder for CompressedCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Drain any packet already inflated
            if let Some(packet) = self.inner.decode(&mut self.inflated)? {
                return Ok(Some(packet));
            }

            if src.len() < 7 {
                return Ok(None);
            }

            let comp_len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
            if src.len() < 7 + comp_len {
                return Ok(None);
            }

            let uncomp_len =
                src[4] as usize | ((src[5] as usize) << 8) | ((src[6] as usize) << 16);
            self.comp_seq = src[3].wrapping_add(1);
            src.advance(7);
            let body = src.split_to(comp_len);

            if uncomp_len == 0 {
                // Stored raw
                self.inflated.extend_from_slice(&body);
            } else {
                let mut decoder = ZlibDecoder::new(Vec::with_capacity(uncomp_len));
                decoder.write_all(&body)?;
                let out = decoder.finish()?;
                if out.len() != uncomp_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "compressed frame length mismatch",
                    ));
                }
                self.inflated.extend_from_slice(&out);
            }
        }
    }
}

impl Encoder<Packet> for CompressedCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut plain = BytesMut::new();
        self.inner.encode(item, &mut plain)?;

        // One compressed frame can carry at most MAX_PACKET_SIZE bytes
        while !plain.is_empty() {
            let take = plain.len().min(MAX_PACKET_SIZE);
            let chunk = plain.split_to(take);

            let (body, uncomp_len) = if chunk.len() >= MIN_COMPRESS_LENGTH {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&chunk)?;
                (encoder.finish()?, chunk.len())
            } else {
                (chunk.to_vec(), 0)
            };

            dst.put_u8((body.len() & 0xFF) as u8);
            dst.put_u8(((body.len() >> 8) & 0xFF) as u8);
            dst.put_u8(((body.len() >> 16) & 0xFF) as u8);
            dst.put_u8(self.comp_seq);
            dst.put_u8((uncomp_len & 0xFF) as u8);
            dst.put_u8(((uncomp_len >> 8) & 0xFF) as u8);
            dst.put_u8(((uncomp_len >> 16) & 0xFF) as u8);
            dst.extend_from_slice(&body);

            self.comp_seq = self.comp_seq.wrapping_add(1);
        }
        Ok(())
    }
}

/// Total wire size of a payload after framing (headers included).
pub fn framed_size(payload_len: usize) -> usize {
    Packet::frame_count(payload_len) * PACKET_HEADER_SIZE + payload_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_reassembles_split_payload() {
        let payload = vec![0x11u8; MAX_PACKET_SIZE + 123];
        let mut wire = BytesMut::new();
        Packet::new(0, payload.clone()).encode(&mut wire);

        let mut codec = PacketCodec::default();
        let packet = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(packet.payload.len(), payload.len());
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn decoder_passes_small_packets_through() {
        let mut wire = BytesMut::new();
        Packet::new(1, vec![0xAAu8; 16]).encode(&mut wire);
        Packet::new(2, vec![0xBBu8; 8]).encode(&mut wire);

        let mut codec = PacketCodec::default();
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().payload.len(), 16);
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().payload.len(), 8);
    }

    #[test]
    fn compressed_roundtrip_small_is_stored_raw() {
        let mut codec = CompressedCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Packet::new(0, vec![0x0eu8]), &mut wire).unwrap();

        // Stored raw: uncompressed length field is zero
        assert_eq!(wire[4], 0);
        assert_eq!(wire[5], 0);
        assert_eq!(wire[6], 0);

        let mut decoder = CompressedCodec::new();
        let packet = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&packet.payload[..], &[0x0e]);
    }

    #[test]
    fn compressed_roundtrip_large_is_deflated() {
        let body = vec![b'x'; 4096];
        let mut codec = CompressedCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Packet::new(0, body.clone()), &mut wire).unwrap();

        // Highly repetitive body must actually shrink
        assert!(wire.len() < body.len());

        let mut decoder = CompressedCodec::new();
        let packet = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&packet.payload[..], &body[..]);
    }

    #[test]
    fn framed_size_counts_headers() {
        assert_eq!(framed_size(10), 14);
        assert_eq!(framed_size(MAX_PACKET_SIZE), MAX_PACKET_SIZE + 8);
    }
}
