//! IPv4 send/receive and the Internet checksum
//!
//! The send path picks the next hop (on-link destination or the
//! configured gateway), consults the ARP cache, and returns
//! [`NetError::ArpUnresolved`] after firing off an ARP request when the
//! hop's MAC is unknown -- callers poll and retry.

use alloc::vec::Vec;

use super::ethernet::{self, ETHERTYPE_IPV4};
use super::{Ipv4Address, NetDevice, NetStack};
use crate::error::{KernelResult, NetError};

/// IPv4 header size without options.
pub const IPV4_HEADER_SIZE: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const DEFAULT_TTL: u8 = 64;

/// Standard Internet checksum: one's-complement sum of big-endian
/// 16-bit words with end-around carry, complemented. An odd trailing
/// byte is padded with zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parsed IPv4 header fields the receive path cares about.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub total_len: u16,
    pub protocol: u8,
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
}

/// Parse and sanity-check a header. Returns `None` for anything that is
/// not well-formed IPv4.
pub fn parse_header(pkt: &[u8]) -> Option<Ipv4Header> {
    if pkt.len() < IPV4_HEADER_SIZE {
        return None;
    }
    let version = pkt[0] >> 4;
    let ihl = pkt[0] & 0x0F;
    if version != 4 || ihl < 5 {
        return None;
    }
    let total_len = u16::from_be_bytes([pkt[2], pkt[3]]);
    if (ihl as usize) * 4 > total_len as usize || total_len as usize > pkt.len() {
        return None;
    }

    Some(Ipv4Header {
        ihl,
        total_len,
        protocol: pkt[9],
        src: Ipv4Address([pkt[12], pkt[13], pkt[14], pkt[15]]),
        dst: Ipv4Address([pkt[16], pkt[17], pkt[18], pkt[19]]),
    })
}

/// Build a 20-byte header with a computed checksum.
fn build_header(src: Ipv4Address, dst: Ipv4Address, protocol: u8, payload_len: usize) -> [u8; IPV4_HEADER_SIZE] {
    let mut hdr = [0u8; IPV4_HEADER_SIZE];
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[1] = 0; // TOS
    let total = (IPV4_HEADER_SIZE + payload_len) as u16;
    hdr[2..4].copy_from_slice(&total.to_be_bytes());
    // id = 0, flags/frag = 0
    hdr[8] = DEFAULT_TTL;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);

    let sum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
    hdr
}

impl<D: NetDevice> NetStack<D> {
    /// The MAC-addressable neighbour a packet for `dst` is actually
    /// transmitted to.
    pub fn next_hop(&self, dst: Ipv4Address) -> Ipv4Address {
        if dst.same_subnet(self.ip(), self.config().netmask) {
            dst
        } else {
            self.config().gateway
        }
    }

    /// Send an IPv4 packet. When the next hop's MAC is not cached the
    /// call broadcasts an ARP request and fails with `ArpUnresolved`;
    /// the caller is expected to poll and retry.
    pub fn ip_send(&mut self, dst: Ipv4Address, protocol: u8, payload: &[u8]) -> KernelResult<()> {
        if payload.len() > ethernet::MTU - IPV4_HEADER_SIZE {
            return Err(NetError::PacketTooLarge.into());
        }

        let hop = self.next_hop(dst);
        let hop_mac = match self.arp_lookup(hop) {
            Some(mac) => mac,
            None => {
                log::debug!(target: "ip", "no ARP entry for {}, requesting", hop);
                self.arp_request(hop);
                return Err(NetError::ArpUnresolved.into());
            }
        };

        let hdr = build_header(self.ip(), dst, protocol, payload.len());
        let mut packet = Vec::with_capacity(IPV4_HEADER_SIZE + payload.len());
        packet.extend_from_slice(&hdr);
        packet.extend_from_slice(payload);

        self.eth_send(hop_mac, ETHERTYPE_IPV4, &packet)
    }

    /// Receive path: validate, accept only our address or broadcast,
    /// dispatch by protocol. TCP/UDP fall through to the kapi hook layer
    /// (none installed by default).
    pub(crate) fn handle_ip(&mut self, pkt: &[u8]) {
        let hdr = match parse_header(pkt) {
            Some(h) => h,
            None => return,
        };
        if hdr.dst != self.ip() && hdr.dst != Ipv4Address::BROADCAST {
            return;
        }

        let header_len = hdr.ihl as usize * 4;
        let payload = &pkt[header_len..hdr.total_len as usize];

        match hdr.protocol {
            PROTO_ICMP => self.handle_icmp(payload, hdr.src),
            PROTO_TCP | PROTO_UDP => {
                log::debug!(
                    target: "ip",
                    "proto {} from {} has no handler installed",
                    hdr.protocol,
                    hdr.src
                );
            }
            other => {
                log::debug!(target: "ip", "unknown protocol {} from {}", other, hdr.src);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ethernet, Loopback, MacAddress, NetConfig, NetStack};
    use super::*;
    use crate::error::KernelError;

    fn stack_over(dev: Loopback) -> NetStack<Loopback> {
        NetStack::new(dev, NetConfig::default(), |_| {})
    }

    #[test]
    fn checksum_is_permutation_invariant() {
        let data: [u8; 12] = [0x45, 0x00, 0x00, 0x54, 0x12, 0x34, 0x40, 0x00, 0x40, 0x01, 0xAB, 0xCD];
        // Swap 16-bit words around; the one's-complement sum is
        // commutative so the checksum must not change.
        let permuted: [u8; 12] = [0xAB, 0xCD, 0x40, 0x01, 0x12, 0x34, 0x40, 0x00, 0x45, 0x00, 0x00, 0x54];
        assert_eq!(checksum(&data), checksum(&permuted));
    }

    #[test]
    fn checksum_of_self_checksummed_header_is_zero() {
        let hdr = build_header(
            Ipv4Address::new(10, 0, 2, 15),
            Ipv4Address::new(10, 0, 2, 2),
            PROTO_ICMP,
            56,
        );
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn checksum_handles_odd_length() {
        let data = [0x01u8, 0x02, 0x03];
        // Trailing byte is padded with zero on the right.
        let padded = [0x01u8, 0x02, 0x03, 0x00];
        assert_eq!(checksum(&data), checksum(&padded));
    }

    #[test]
    fn unresolved_next_hop_would_block_and_broadcasts_arp() {
        let mut stack = stack_over(Loopback::silent());
        let gw = stack.config().gateway;

        // Off-subnet destination routes via the gateway.
        let dst = Ipv4Address::new(1, 1, 1, 1);
        assert_eq!(stack.next_hop(dst), gw);

        let err = stack.ip_send(dst, PROTO_ICMP, b"x").unwrap_err();
        assert_eq!(err, KernelError::NetError(NetError::ArpUnresolved));

        // Exactly one broadcast ARP request for the gateway went out.
        assert_eq!(stack.device_mut().sent.len(), 1);
        let frame = stack.device_mut().sent[0].clone();
        let parsed = ethernet::parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, MacAddress::BROADCAST);
        assert_eq!(parsed.ethertype, ethernet::ETHERTYPE_ARP);
        assert_eq!(&parsed.payload[24..28], &gw.0);
    }

    #[test]
    fn arp_miss_then_hit_transmits_ipv4() {
        let mut stack = stack_over(Loopback::silent());
        let gw = stack.config().gateway;
        let gw_mac = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
        let dst = Ipv4Address::new(93, 184, 216, 34);

        assert!(stack.ip_send(dst, PROTO_UDP, b"hello").is_err());

        // Inject the gateway's ARP reply and retry.
        let mut reply = [0u8; 28];
        reply[0..2].copy_from_slice(&1u16.to_be_bytes());
        reply[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        reply[4] = 6;
        reply[5] = 4;
        reply[6..8].copy_from_slice(&2u16.to_be_bytes());
        reply[8..14].copy_from_slice(&gw_mac.0);
        reply[14..18].copy_from_slice(&gw.0);
        reply[18..24].copy_from_slice(&stack.mac().0);
        reply[24..28].copy_from_slice(&stack.ip().0);
        let frame =
            ethernet::build_frame(stack.mac(), gw_mac, ethernet::ETHERTYPE_ARP, &reply).unwrap();
        stack.device_mut().inject(frame);
        stack.poll();

        stack.ip_send(dst, PROTO_UDP, b"hello").unwrap();

        // Frame 0 was the ARP request; frame 1 is our packet.
        let frame = stack.device_mut().sent[1].clone();
        let parsed = ethernet::parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, gw_mac);
        assert_eq!(parsed.ethertype, ETHERTYPE_IPV4);

        let hdr = parse_header(parsed.payload).unwrap();
        assert_eq!(hdr.protocol, PROTO_UDP);
        assert_eq!(hdr.src, stack.ip());
        assert_eq!(hdr.dst, dst);
        assert_eq!(hdr.total_len as usize, IPV4_HEADER_SIZE + 5);
        // The transmitted header verifies.
        assert_eq!(checksum(&parsed.payload[..IPV4_HEADER_SIZE]), 0);
    }

    #[test]
    fn receive_ignores_foreign_destinations() {
        let mut stack = stack_over(Loopback::silent());
        let mut pkt = alloc::vec![0u8; IPV4_HEADER_SIZE + 8];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&((IPV4_HEADER_SIZE + 8) as u16).to_be_bytes());
        pkt[9] = PROTO_ICMP;
        pkt[16..20].copy_from_slice(&[10, 0, 2, 77]); // not us
        stack.handle_ip(&pkt);
        assert!(stack.device_mut().sent.is_empty());
    }

    #[test]
    fn parse_rejects_bad_version_and_short_ihl() {
        let mut pkt = [0u8; IPV4_HEADER_SIZE];
        pkt[0] = 0x65; // IPv6 version nibble
        pkt[2..4].copy_from_slice(&20u16.to_be_bytes());
        assert!(parse_header(&pkt).is_none());

        pkt[0] = 0x44; // IHL 4 < 5
        assert!(parse_header(&pkt).is_none());
    }
}
