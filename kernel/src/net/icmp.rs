//! ICMP echo (ping)
//!
//! Echo requests are answered with the payload mirrored back; echo
//! replies are matched against the single outstanding ping. One ping in
//! flight is all the core supports -- a fuller stack would key a map by
//! (id, seq).

use alloc::vec::Vec;

use super::ip::{checksum, PROTO_ICMP};
use super::{Ipv4Address, NetDevice, NetStack};
use crate::error::{KernelResult, NetError};

pub const ICMP_HEADER_SIZE: usize = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// The id every ping carries (the original's fixed marker).
const PING_ID: u16 = 0x1234;
/// Pattern byte filling the 56-byte echo payload.
const PING_PATTERN: u8 = 0xAB;
const PING_PAYLOAD_LEN: usize = 56;
/// Poll quantum while waiting for replies.
const POLL_STEP_MS: u32 = 10;
/// Grace period for ARP resolution before a ping gives up.
const ARP_GRACE_MS: u32 = 1000;

/// Tracks the one in-flight echo request.
pub struct PingTracker {
    id: u16,
    seq: u16,
    received: bool,
    active: bool,
}

impl PingTracker {
    pub fn new() -> Self {
        Self {
            id: 0,
            seq: 0,
            received: false,
            active: false,
        }
    }

    fn arm(&mut self, id: u16, seq: u16) {
        self.id = id;
        self.seq = seq;
        self.received = false;
        self.active = true;
    }

    fn matches(&self, id: u16, seq: u16) -> bool {
        self.active && self.id == id && self.seq == seq
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn build_echo(kind: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ICMP_HEADER_SIZE + payload.len());
    pkt.push(kind);
    pkt.push(0); // code
    pkt.extend_from_slice(&[0, 0]); // checksum placeholder
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(payload);

    let sum = checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

impl<D: NetDevice> NetStack<D> {
    /// Send one ICMP echo request.
    pub fn send_echo_request(
        &mut self,
        dst: Ipv4Address,
        id: u16,
        seq: u16,
        payload: &[u8],
    ) -> KernelResult<()> {
        let pkt = build_echo(ICMP_ECHO_REQUEST, id, seq, payload);
        self.ip_send(dst, PROTO_ICMP, &pkt)
    }

    /// Handle an incoming ICMP packet (already validated as ours).
    pub(crate) fn handle_icmp(&mut self, pkt: &[u8], src: Ipv4Address) {
        if pkt.len() < ICMP_HEADER_SIZE {
            return;
        }
        let id = u16::from_be_bytes([pkt[4], pkt[5]]);
        let seq = u16::from_be_bytes([pkt[6], pkt[7]]);

        match pkt[0] {
            ICMP_ECHO_REQUEST => {
                let reply = build_echo(ICMP_ECHO_REPLY, id, seq, &pkt[ICMP_HEADER_SIZE..]);
                let _ = self.ip_send(src, PROTO_ICMP, &reply);
            }
            ICMP_ECHO_REPLY => {
                if self.ping.matches(id, seq) {
                    self.ping.received = true;
                }
            }
            _ => {}
        }
    }

    /// Blocking ping: resolve ARP (with a grace period), send one echo
    /// request with the 56-byte pattern payload, and poll for the reply
    /// in ~10 ms steps until `timeout_ms` runs out.
    pub fn ping(&mut self, dst: Ipv4Address, seq: u16, timeout_ms: u32) -> KernelResult<()> {
        let hop = self.next_hop(dst);
        if self.arp_lookup(hop).is_none() {
            self.arp_request(hop);
            for _ in 0..ARP_GRACE_MS / POLL_STEP_MS {
                self.poll();
                if self.arp_lookup(hop).is_some() {
                    break;
                }
                self.sleep(POLL_STEP_MS);
            }
            if self.arp_lookup(hop).is_none() {
                log::warn!(target: "ping", "ARP timeout for {}", hop);
                return Err(NetError::Timeout.into());
            }
        }

        self.ping.arm(PING_ID, seq);
        let payload = [PING_PATTERN; PING_PAYLOAD_LEN];
        self.send_echo_request(dst, PING_ID, seq, &payload)?;

        for _ in 0..timeout_ms.div_ceil(POLL_STEP_MS) {
            self.poll();
            if self.ping.received {
                return Ok(());
            }
            self.sleep(POLL_STEP_MS);
        }
        self.poll();
        if self.ping.received {
            Ok(())
        } else {
            Err(NetError::Timeout.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ethernet, ip, Loopback, NetConfig, NetStack};
    use super::*;

    fn stack_over(dev: Loopback) -> NetStack<Loopback> {
        NetStack::new(dev, NetConfig::default(), |_| {})
    }

    #[test]
    fn ping_our_own_address_over_loopback() {
        let mut stack = stack_over(Loopback::new());
        let our_ip = stack.ip();
        stack.ping(our_ip, 1, 100).unwrap();

        // The echoed request carried the 56-byte pattern payload.
        let sent = &stack.device_mut().sent;
        let echo_frame = sent
            .iter()
            .map(|f| ethernet::parse_frame(f).unwrap())
            .find(|p| p.ethertype == ethernet::ETHERTYPE_IPV4)
            .expect("no IPv4 frame transmitted");
        let hdr = ip::parse_header(echo_frame.payload).unwrap();
        assert_eq!(hdr.protocol, PROTO_ICMP);
        let icmp = &echo_frame.payload[20..];
        assert_eq!(icmp[0], ICMP_ECHO_REQUEST);
        assert_eq!(&icmp[ICMP_HEADER_SIZE..], &[PING_PATTERN; 56]);
    }

    #[test]
    fn ping_times_out_without_peer() {
        let mut stack = stack_over(Loopback::silent());
        let err = stack.ping(Ipv4Address::new(10, 0, 2, 2), 7, 50).unwrap_err();
        assert_eq!(err, crate::error::KernelError::NetError(NetError::Timeout));
    }

    #[test]
    fn echo_request_is_mirrored_with_same_id_seq() {
        let mut stack = stack_over(Loopback::silent());
        // Teach the stack the sender's MAC so the reply can route.
        let peer_ip = Ipv4Address::new(10, 0, 2, 9);
        let peer_mac = super::super::MacAddress::new([9; 6]);
        stack.arp.insert(peer_ip, peer_mac);

        let request = build_echo(ICMP_ECHO_REQUEST, 0x4242, 3, b"abcdefgh");
        stack.handle_icmp(&request, peer_ip);

        let frame = stack.device_mut().sent.last().unwrap().clone();
        let parsed = ethernet::parse_frame(&frame).unwrap();
        let icmp = &parsed.payload[20..];
        assert_eq!(icmp[0], ICMP_ECHO_REPLY);
        assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x4242);
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 3);
        assert_eq!(&icmp[ICMP_HEADER_SIZE..], b"abcdefgh");
        // Reply checksum self-verifies.
        assert_eq!(checksum(icmp), 0);
    }

    #[test]
    fn stray_replies_do_not_satisfy_the_tracker() {
        let mut stack = stack_over(Loopback::silent());
        stack.ping.arm(PING_ID, 5);

        let wrong_seq = build_echo(ICMP_ECHO_REPLY, PING_ID, 6, &[]);
        stack.handle_icmp(&wrong_seq, Ipv4Address::new(10, 0, 2, 2));
        assert!(!stack.ping.received);

        let matching = build_echo(ICMP_ECHO_REPLY, PING_ID, 5, &[]);
        stack.handle_icmp(&matching, Ipv4Address::new(10, 0, 2, 2));
        assert!(stack.ping.received);
    }
}
