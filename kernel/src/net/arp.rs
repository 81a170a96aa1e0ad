//! ARP (IPv4 over Ethernet)
//!
//! A fixed 16-entry cache and the request/reply state machine. Every
//! incoming ARP packet teaches us the sender's mapping; requests for our
//! address get a unicast reply.

use super::ethernet::ETHERTYPE_ARP;
use super::{Ipv4Address, MacAddress, NetDevice, NetStack};

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// Wire size of an Ethernet/IPv4 ARP packet.
pub const ARP_PACKET_SIZE: usize = 28;

/// Cache capacity. Tiny but sufficient for a single-LAN host.
const ARP_TABLE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    valid: bool,
}

/// The ARP cache. Insertion updates an existing entry, else takes the
/// first free slot, else overwrites slot 0 -- the original's primitive
/// eviction, kept deliberately (documented design decision).
pub struct ArpTable {
    entries: [ArpEntry; ARP_TABLE_SIZE],
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            entries: [ArpEntry {
                ip: Ipv4Address::ANY,
                mac: MacAddress::ZERO,
                valid: false,
            }; ARP_TABLE_SIZE],
        }
    }

    /// Find the MAC for an IP, if cached.
    pub fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Learn or refresh a mapping.
    pub fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.valid && e.ip == ip) {
            entry.mac = mac;
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| !e.valid) {
            *entry = ArpEntry {
                ip,
                mac,
                valid: true,
            };
            log::debug!(target: "arp", "learned {} -> {}", ip, mac);
            return;
        }
        // Table full: overwrite slot 0.
        self.entries[0] = ArpEntry {
            ip,
            mac,
            valid: true,
        };
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a raw 28-byte ARP packet.
fn build_packet(
    op: u16,
    sender_mac: MacAddress,
    sender_ip: Ipv4Address,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> [u8; ARP_PACKET_SIZE] {
    let mut pkt = [0u8; ARP_PACKET_SIZE];
    pkt[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    pkt[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    pkt[4] = 6;
    pkt[5] = 4;
    pkt[6..8].copy_from_slice(&op.to_be_bytes());
    pkt[8..14].copy_from_slice(&sender_mac.0);
    pkt[14..18].copy_from_slice(&sender_ip.0);
    pkt[18..24].copy_from_slice(&target_mac.0);
    pkt[24..28].copy_from_slice(&target_ip.0);
    pkt
}

impl<D: NetDevice> NetStack<D> {
    /// Cached next-hop lookup.
    pub fn arp_lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.arp.lookup(ip)
    }

    /// Broadcast a request for `ip`'s MAC.
    pub fn arp_request(&mut self, ip: Ipv4Address) {
        let pkt = build_packet(
            ARP_OP_REQUEST,
            self.mac(),
            self.ip(),
            MacAddress::ZERO,
            ip,
        );
        log::debug!(target: "arp", "requesting {}", ip);
        let _ = self.eth_send(MacAddress::BROADCAST, ETHERTYPE_ARP, &pkt);
    }

    /// Handle an incoming ARP packet: learn the sender, answer requests
    /// for our address.
    pub(crate) fn handle_arp(&mut self, pkt: &[u8]) {
        if pkt.len() < ARP_PACKET_SIZE {
            return;
        }
        let htype = u16::from_be_bytes([pkt[0], pkt[1]]);
        let ptype = u16::from_be_bytes([pkt[2], pkt[3]]);
        if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || pkt[4] != 6 || pkt[5] != 4 {
            return;
        }

        let op = u16::from_be_bytes([pkt[6], pkt[7]]);
        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&pkt[8..14]);
        let sender_mac = MacAddress(sender_mac);
        let sender_ip = Ipv4Address([pkt[14], pkt[15], pkt[16], pkt[17]]);
        let target_ip = Ipv4Address([pkt[24], pkt[25], pkt[26], pkt[27]]);

        // Learn the sender's mapping regardless of the operation.
        self.arp.insert(sender_ip, sender_mac);

        if op == ARP_OP_REQUEST && target_ip == self.ip() {
            let reply = build_packet(ARP_OP_REPLY, self.mac(), self.ip(), sender_mac, sender_ip);
            let _ = self.eth_send(sender_mac, ETHERTYPE_ARP, &reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ethernet, Loopback, NetConfig, NetStack};
    use super::*;

    fn stack_over(dev: Loopback) -> NetStack<Loopback> {
        NetStack::new(dev, NetConfig::default(), |_| {})
    }

    #[test]
    fn cache_update_and_lookup() {
        let mut table = ArpTable::new();
        let ip = Ipv4Address::new(10, 0, 2, 2);
        let mac = MacAddress::new([0xAA; 6]);

        assert!(table.lookup(ip).is_none());
        table.insert(ip, mac);
        assert_eq!(table.lookup(ip), Some(mac));

        // Refresh replaces in place.
        let mac2 = MacAddress::new([0xBB; 6]);
        table.insert(ip, mac2);
        assert_eq!(table.lookup(ip), Some(mac2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_table_overwrites_slot_zero() {
        let mut table = ArpTable::new();
        for i in 0..16u8 {
            table.insert(Ipv4Address::new(10, 0, 2, i), MacAddress::new([i; 6]));
        }
        assert_eq!(table.len(), 16);

        // The 17th mapping evicts the first.
        table.insert(Ipv4Address::new(10, 0, 3, 1), MacAddress::new([0x99; 6]));
        assert_eq!(table.len(), 16);
        assert!(table.lookup(Ipv4Address::new(10, 0, 2, 0)).is_none());
        assert_eq!(
            table.lookup(Ipv4Address::new(10, 0, 3, 1)),
            Some(MacAddress::new([0x99; 6]))
        );
    }

    #[test]
    fn request_for_our_ip_draws_one_reply() {
        let mut stack = stack_over(Loopback::silent());
        let asker_mac = MacAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        let asker_ip = Ipv4Address::new(10, 0, 2, 99);

        let request = build_packet(
            ARP_OP_REQUEST,
            asker_mac,
            asker_ip,
            MacAddress::ZERO,
            stack.ip(),
        );
        stack.handle_arp(&request);

        // The sender was learned and exactly one reply went out.
        assert_eq!(stack.arp_lookup(asker_ip), Some(asker_mac));
        assert_eq!(stack.device_mut().sent.len(), 1);

        let frame = stack.device_mut().sent[0].clone();
        let parsed = ethernet::parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, asker_mac);
        assert_eq!(parsed.ethertype, ETHERTYPE_ARP);
        let op = u16::from_be_bytes([parsed.payload[6], parsed.payload[7]]);
        assert_eq!(op, ARP_OP_REPLY);
        assert_eq!(&parsed.payload[8..14], &stack.mac().0);
        assert_eq!(&parsed.payload[14..18], &stack.ip().0);
        assert_eq!(&parsed.payload[18..24], &asker_mac.0);
        assert_eq!(&parsed.payload[24..28], &asker_ip.0);
    }

    #[test]
    fn request_for_other_ip_is_learned_but_unanswered() {
        let mut stack = stack_over(Loopback::silent());
        let request = build_packet(
            ARP_OP_REQUEST,
            MacAddress::new([1; 6]),
            Ipv4Address::new(10, 0, 2, 50),
            MacAddress::ZERO,
            Ipv4Address::new(10, 0, 2, 51),
        );
        stack.handle_arp(&request);

        assert!(stack.arp_lookup(Ipv4Address::new(10, 0, 2, 50)).is_some());
        assert!(stack.device_mut().sent.is_empty());
    }
}
