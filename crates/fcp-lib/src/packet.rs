//! FCP packet codec: fixed 16-byte little-endian header plus payload.
//!
//! Layout: `[opcode:u32][size:u16][seq:u16][error:u32][pad:u32][payload...]`.
//! Encoding only; whether a response *makes sense* is the transaction
//! engine's call.

use crate::protocol::HEADER_SIZE;

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub opcode: u32,
    /// Payload length in bytes.
    pub size: u16,
    pub seq: u16,
    pub error: u32,
    pub pad: u32,
}

impl PacketHeader {
    /// Header for an outgoing request.
    pub fn request(opcode: u32, seq: u16, size: u16) -> Self {
        PacketHeader {
            opcode,
            size,
            seq,
            error: 0,
            pad: 0,
        }
    }

    /// Append the 16 header bytes to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.error.to_le_bytes());
        out.extend_from_slice(&self.pad.to_le_bytes());
    }

    /// Decode the header at the start of `buf`. `None` if `buf` is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let hdr: &[u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(PacketHeader {
            opcode: u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]),
            size: u16::from_le_bytes([hdr[4], hdr[5]]),
            seq: u16::from_le_bytes([hdr[6], hdr[7]]),
            error: u32::from_le_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]),
            pad: u32::from_le_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]),
        })
    }
}

/// Build a complete request packet. `payload` must fit the 16-bit size field;
/// the caller checks that before getting here.
pub fn build_request(opcode: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_SIZE + payload.len());
    PacketHeader::request(opcode, seq, payload.len() as u16).encode(&mut pkt);
    pkt.extend_from_slice(payload);
    pkt
}

/// Split a received packet into its header and whatever follows it.
pub fn split_response(buf: &[u8]) -> Option<(PacketHeader, &[u8])> {
    let header = PacketHeader::decode(buf)?;
    Some((header, &buf[HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_no_payload() {
        let pkt = build_request(0x0080_0000, 5, &[]);
        assert_eq!(pkt.len(), 16);
        // opcode
        assert_eq!(&pkt[0..4], &[0x00, 0x00, 0x80, 0x00]);
        // size
        assert_eq!(&pkt[4..6], &[0, 0]);
        // seq
        assert_eq!(&pkt[6..8], &[5, 0]);
        // error + pad
        assert!(pkt[8..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn build_request_with_payload() {
        let payload = [0x01, 0x02, 0x03, 0x04];
        let pkt = build_request(0x0000_1001, 0x1234, &payload);
        assert_eq!(pkt.len(), 20);
        assert_eq!(u16::from_le_bytes([pkt[4], pkt[5]]), 4);
        assert_eq!(&pkt[6..8], &[0x34, 0x12]);
        assert_eq!(&pkt[16..], &payload);
    }

    #[test]
    fn decode_reads_every_field() {
        let mut buf = Vec::new();
        PacketHeader {
            opcode: 0xDEAD_BEEF,
            size: 84,
            seq: 7,
            error: 3,
            pad: 9,
        }
        .encode(&mut buf);
        let hdr = PacketHeader::decode(&buf).unwrap();
        assert_eq!(hdr.opcode, 0xDEAD_BEEF);
        assert_eq!(hdr.size, 84);
        assert_eq!(hdr.seq, 7);
        assert_eq!(hdr.error, 3);
        assert_eq!(hdr.pad, 9);
    }

    #[test]
    fn decode_short_buffer_is_none() {
        assert!(PacketHeader::decode(&[0u8; 15]).is_none());
        assert!(PacketHeader::decode(&[]).is_none());
    }

    #[test]
    fn split_response_returns_trailing_payload() {
        let pkt = build_request(2, 1, &[9, 8, 7]);
        let (hdr, payload) = split_response(&pkt).unwrap();
        assert_eq!(hdr.opcode, 2);
        assert_eq!(payload, &[9, 8, 7]);
    }

    #[test]
    fn split_response_header_only() {
        let pkt = build_request(2, 1, &[]);
        let (_, payload) = split_response(&pkt).unwrap();
        assert!(payload.is_empty());
    }
}
