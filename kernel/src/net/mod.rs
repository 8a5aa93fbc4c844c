//! Tiny IP stack: static-IP ARP/ICMP responder over one network device.
//!
//! Address configuration is compile-time (no DHCP): 10.0.2.15/24 with the
//! gateway at 10.0.2.2 -- QEMU user networking's defaults. The stack
//! answers ARP requests for its address, learns the gateway's MAC, and
//! answers ICMP echo; outbound ping with RTT measurement lives in
//! [`icmp`]. Everything on the wire is network byte order; the explicit
//! [`htons`]/[`htonl`] helpers mark each conversion point.

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ip;

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::KernelResult;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_u32(addr: u32) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// Our static address.
pub const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 15);
/// Default gateway.
pub const GATEWAY_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 2);
/// /24 network.
pub const NETMASK_BITS: u32 = 24;

/// Host-to-network for 16-bit values.
#[inline]
pub fn htons(value: u16) -> u16 {
    value.to_be()
}

/// Host-to-network for 32-bit values.
#[inline]
pub fn htonl(value: u32) -> u32 {
    value.to_be()
}

/// Network-to-host for 16-bit values.
#[inline]
pub fn ntohs(value: u16) -> u16 {
    u16::from_be(value)
}

/// RFC 1071 checksum: 16-bit ones-complement sum with end-around carry,
/// inverted. An odd trailing byte is padded with zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Network statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

static STATS: Mutex<NetworkStats> = Mutex::new(NetworkStats {
    packets_sent: 0,
    packets_received: 0,
    bytes_sent: 0,
    bytes_received: 0,
    errors: 0,
});

pub fn update_stats_tx(bytes: usize) {
    let mut stats = STATS.lock();
    stats.packets_sent += 1;
    stats.bytes_sent += bytes as u64;
}

pub fn update_stats_rx(bytes: usize) {
    let mut stats = STATS.lock();
    stats.packets_received += 1;
    stats.bytes_received += bytes as u64;
}

pub fn get_stats() -> NetworkStats {
    *STATS.lock()
}

/// Handle one received Ethernet frame: dispatch by ethertype, transmit
/// whatever reply the protocol layer produces.
pub fn handle_frame(frame: &[u8]) {
    update_stats_rx(frame.len());

    let parsed = match ethernet::parse_frame(frame) {
        Ok(parsed) => parsed,
        Err(_) => {
            STATS.lock().errors += 1;
            return;
        }
    };

    let our_mac = match device::mac_address() {
        Ok(mac) => mac,
        Err(_) => return,
    };

    match parsed.ethertype {
        ethernet::ETHERTYPE_ARP => {
            if let Some(reply) = arp::handle_packet(parsed.payload, our_mac) {
                send_frame(&reply);
            }
        }
        ethernet::ETHERTYPE_IPV4 => {
            if let Some(reply_packet) = ip::handle_packet(parsed.payload) {
                let reply = ethernet::construct_frame(
                    parsed.src,
                    our_mac,
                    ethernet::ETHERTYPE_IPV4,
                    &reply_packet,
                );
                send_frame(&reply);
            }
        }
        _ => {
            // Not ours (IPv6 and friends); drop silently.
        }
    }
}

/// Transmit one frame, counting it.
pub fn send_frame(frame: &[u8]) {
    match device::transmit(frame) {
        Ok(()) => update_stats_tx(frame.len()),
        Err(e) => {
            STATS.lock().errors += 1;
            println!("[NET] Transmit failed: {}", e);
        }
    }
}

/// Drain the device and run the protocol handlers.
///
/// Frames are collected first and handled after the device lock drops, so
/// protocol replies can transmit without re-entering the device.
pub fn poll() {
    if !device::is_registered() {
        return;
    }
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let _ = device::with_device(|d| {
        d.poll_receive(&mut |frame| frames.push(frame.to_vec()))
    });
    for frame in frames {
        handle_frame(&frame);
    }
}

/// Announce ourselves: broadcast an ARP request for the gateway so its
/// MAC is learned (and the gateway learns ours).
pub fn init() -> KernelResult<()> {
    if !device::is_registered() {
        println!("[NET] No network device; stack disabled");
        return Ok(());
    }
    println!(
        "[NET] Static config {}.{}.{}.{}/{} gateway {}.{}.{}.{}",
        OUR_IP.0[0], OUR_IP.0[1], OUR_IP.0[2], OUR_IP.0[3], NETMASK_BITS,
        GATEWAY_IP.0[0], GATEWAY_IP.0[1], GATEWAY_IP.0[2], GATEWAY_IP.0[3]
    );
    arp::send_gateway_request()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // Classic RFC 1071 example data.
        let data = [0x00u8, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7];
        assert_eq!(checksum(&data), !0xDDF2u16);
    }

    #[test]
    fn test_checksum_is_self_inverse() {
        // A header checksummed with its own checksum field sums to zero.
        let mut header = [
            0x45u8, 0x00, 0x00, 0x3C, 0x00, 0x00, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 10, 0, 2,
            15, 10, 0, 2, 2,
        ];
        let csum = checksum(&header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xFF]), !0xFF00u16);
    }

    #[test]
    fn test_byte_order_helpers() {
        assert_eq!(htons(0x1234).to_le_bytes(), [0x12, 0x34]);
        assert_eq!(htonl(0x0A000202).to_le_bytes(), [0x0A, 0x00, 0x02, 0x02]);
        assert_eq!(ntohs(htons(0xBEEF)), 0xBEEF);
    }

    #[test]
    fn test_ipv4_address_roundtrip() {
        let addr = Ipv4Address::new(10, 0, 2, 15);
        assert_eq!(Ipv4Address::from_u32(addr.to_u32()), addr);
    }
}
