//! Ethernet II frame construction and parsing
//!
//! Headers are assembled byte-by-byte; all multi-byte fields are
//! big-endian on the wire.

use alloc::vec::Vec;

use super::MacAddress;
use crate::error::NetError;

/// dst(6) + src(6) + ethertype(2)
pub const HEADER_SIZE: usize = 14;

/// Maximum payload carried in one frame (standard MTU).
pub const MTU: usize = 1500;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// A parsed frame borrowing the receive buffer.
#[derive(Debug)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Build a complete frame ready for the NIC.
pub fn build_frame(
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload: &[u8],
) -> Result<Vec<u8>, NetError> {
    if payload.len() > MTU {
        return Err(NetError::PacketTooLarge);
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a received frame.
pub fn parse_frame(data: &[u8]) -> Result<EthernetFrame<'_>, NetError> {
    if data.len() < HEADER_SIZE {
        return Err(NetError::MalformedPacket);
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);

    Ok(EthernetFrame {
        dst: MacAddress(dst),
        src: MacAddress(src),
        ethertype: u16::from_be_bytes([data[12], data[13]]),
        payload: &data[HEADER_SIZE..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_round_trip() {
        let dst = MacAddress::BROADCAST;
        let src = MacAddress::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let frame = build_frame(dst, src, ETHERTYPE_IPV4, b"payload").unwrap();

        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.ethertype, ETHERTYPE_IPV4);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn rejects_short_frames_and_oversize_payloads() {
        assert!(parse_frame(&[0u8; 10]).is_err());
        let big = alloc::vec![0u8; MTU + 1];
        assert!(build_frame(MacAddress::ZERO, MacAddress::ZERO, ETHERTYPE_IPV4, &big).is_err());
    }
}
