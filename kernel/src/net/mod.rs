//! Network stack core
//!
//! Ethernet frame I/O, ARP, IPv4 and ICMP echo over a [`NetDevice`].
//! The whole state -- ARP cache, ping tracker, interface config -- lives
//! in one [`NetStack`] value, so the kernel owns a single instance over
//! the NIC driver while tests run isolated instances over [`Loopback`].
//!
//! TCP, UDP and DNS are not handled here; the kapi surface advertises
//! hook slots for them that stay null until a collaborator installs one.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ip;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::KernelResult;
use arp::ArpTable;
use icmp::PingTracker;

/// MAC address (6 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// IPv4 address (network byte order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    pub const ANY: Self = Self([0, 0, 0, 0]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_u32(addr: u32) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Whether `self` and `other` share a subnet under `netmask`.
    pub fn same_subnet(self, other: Ipv4Address, netmask: Ipv4Address) -> bool {
        self.to_u32() & netmask.to_u32() == other.to_u32() & netmask.to_u32()
    }
}

impl core::fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Static interface configuration. The defaults match QEMU's user-mode
/// NAT, which is what the virt board boots under.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Address::new(10, 0, 2, 15),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(10, 0, 2, 2),
            dns: Ipv4Address::new(10, 0, 2, 3),
        }
    }
}

/// NIC driver contract (collaborator). The virtio-net glue on QEMU and
/// any future Pi driver implement this; [`Loopback`] covers tests.
pub trait NetDevice: Send {
    /// The device's MAC address.
    fn mac(&self) -> MacAddress;

    /// Transmit one complete Ethernet frame.
    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()>;

    /// Pop the next received frame, if any. Never blocks.
    fn receive(&mut self) -> Option<Vec<u8>>;
}

impl<T: NetDevice + ?Sized> NetDevice for Box<T> {
    fn mac(&self) -> MacAddress {
        (**self).mac()
    }

    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()> {
        (**self).transmit(frame)
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        (**self).receive()
    }
}

/// A NIC that echoes every transmitted frame back into its own receive
/// queue, with a transmit log for assertions.
pub struct Loopback {
    mac: MacAddress,
    echo: bool,
    rx: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            mac: MacAddress::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
            echo: true,
            rx: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// A loopback that only records transmits without echoing them.
    pub fn silent() -> Self {
        Self {
            echo: false,
            ..Self::new()
        }
    }

    /// Queue a frame as if the wire delivered it.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.rx.push_back(frame);
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDevice for Loopback {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()> {
        self.sent.push(frame.to_vec());
        if self.echo {
            self.rx.push_back(frame.to_vec());
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx.pop_front()
    }
}

/// The network stack state over one device.
pub struct NetStack<D: NetDevice> {
    dev: D,
    mac: MacAddress,
    config: NetConfig,
    pub(crate) arp: ArpTable,
    pub(crate) ping: PingTracker,
    delay_ms: fn(u32),
}

impl<D: NetDevice> NetStack<D> {
    /// Build a stack over a device. `delay_ms` is the poll-quantum
    /// sleep used by blocking waits (the kernel passes the HAL sleep,
    /// tests a no-op).
    pub fn new(dev: D, config: NetConfig, delay_ms: fn(u32)) -> Self {
        let mac = dev.mac();
        println!("[NET] Stack initialized, IP={} MAC={}", config.ip, mac);
        Self {
            dev,
            mac,
            config,
            arp: ArpTable::new(),
            ping: PingTracker::new(),
            delay_ms,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn ip(&self) -> Ipv4Address {
        self.config.ip
    }

    pub fn config(&self) -> NetConfig {
        self.config
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub(crate) fn sleep(&self, ms: u32) {
        (self.delay_ms)(ms)
    }

    /// Compose and transmit an Ethernet frame.
    pub fn eth_send(
        &mut self,
        dst: MacAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> KernelResult<()> {
        let frame = ethernet::build_frame(dst, self.mac, ethertype, payload)?;
        self.dev.transmit(&frame)
    }

    /// Drain and dispatch every pending received frame.
    pub fn poll(&mut self) {
        while let Some(frame) = self.dev.receive() {
            let parsed = match ethernet::parse_frame(&frame) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match parsed.ethertype {
                ethernet::ETHERTYPE_ARP => self.handle_arp(parsed.payload),
                ethernet::ETHERTYPE_IPV4 => self.handle_ip(parsed.payload),
                _ => {}
            }
        }
    }
}

/// The kernel's stack over the registered NIC.
static NET: Mutex<Option<NetStack<Box<dyn NetDevice>>>> = Mutex::new(None);

/// Bring up the global stack over `dev` with the default static config.
pub fn init(dev: Box<dyn NetDevice>, delay_ms: fn(u32)) {
    let stack = NetStack::new(dev, NetConfig::default(), delay_ms);
    *NET.lock() = Some(stack);
}

/// Run `f` against the global stack. `None` when no NIC registered.
pub fn with_stack<R>(f: impl FnOnce(&mut NetStack<Box<dyn NetDevice>>) -> R) -> Option<R> {
    NET.lock().as_mut().map(f)
}

/// Pump the receive path; called from `yield` and the timer tick.
pub fn poll() {
    let _ = with_stack(|stack| stack.poll());
}
