//! ARP: one-entry resolver for the gateway.
//!
//! The stack keeps exactly one learned mapping -- the gateway's -- because
//! every off-host conversation goes through it. Requests for our own IP
//! get answered regardless of sender; replies are only believed when they
//! come from the gateway's IP (anything else is silently ignored).

use alloc::vec::Vec;

use spin::Mutex;

use super::{device, ethernet, Ipv4Address, MacAddress, GATEWAY_IP, OUR_IP};
use crate::error::{KernelResult, NetError};

/// ARP hardware type: Ethernet
const ARP_HTYPE_ETHERNET: u16 = 1;
/// ARP protocol type: IPv4
const ARP_PTYPE_IPV4: u16 = 0x0800;
/// ARP operation: Request
const ARP_OP_REQUEST: u16 = 1;
/// ARP operation: Reply
const ARP_OP_REPLY: u16 = 2;
/// ARP packet size for Ethernet/IPv4: 28 bytes
const ARP_PACKET_SIZE: usize = 28;

/// The single cache slot: the gateway's MAC once learned.
static GATEWAY_MAC: Mutex<Option<MacAddress>> = Mutex::new(None);

/// The gateway's MAC, when known.
pub fn gateway_mac() -> Option<MacAddress> {
    *GATEWAY_MAC.lock()
}

/// Forget the learned gateway (diagnostics / tests).
pub fn flush_cache() {
    *GATEWAY_MAC.lock() = None;
}

/// Build a raw ARP packet (28 bytes).
fn build_packet(
    op: u16,
    sender_mac: MacAddress,
    sender_ip: Ipv4Address,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ARP_PACKET_SIZE);
    pkt.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    pkt.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    pkt.push(6); // hardware address length
    pkt.push(4); // protocol address length
    pkt.extend_from_slice(&op.to_be_bytes());
    pkt.extend_from_slice(&sender_mac.0);
    pkt.extend_from_slice(&sender_ip.0);
    pkt.extend_from_slice(&target_mac.0);
    pkt.extend_from_slice(&target_ip.0);
    pkt
}

/// Broadcast ARP request asking for `target_ip`.
pub fn build_request(sender_mac: MacAddress, target_ip: Ipv4Address) -> Vec<u8> {
    build_packet(
        ARP_OP_REQUEST,
        sender_mac,
        OUR_IP,
        MacAddress::ZERO,
        target_ip,
    )
}

/// Directed ARP reply.
pub fn build_reply(
    sender_mac: MacAddress,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    build_packet(ARP_OP_REPLY, sender_mac, OUR_IP, target_mac, target_ip)
}

/// Parse fields out of a 28-byte ARP payload.
fn parse(data: &[u8]) -> Result<(u16, MacAddress, Ipv4Address, Ipv4Address), NetError> {
    if data.len() < ARP_PACKET_SIZE {
        return Err(NetError::FrameTooShort);
    }
    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || data[4] != 6 || data[5] != 4 {
        return Err(NetError::UnsupportedProtocol);
    }
    let op = u16::from_be_bytes([data[6], data[7]]);
    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&data[8..14]);
    let sender_ip = Ipv4Address([data[14], data[15], data[16], data[17]]);
    let target_ip = Ipv4Address([data[24], data[25], data[26], data[27]]);
    Ok((op, MacAddress(sender_mac), sender_ip, target_ip))
}

/// Process an incoming ARP payload.
///
/// Returns the complete Ethernet frame to transmit when the packet was a
/// request for our address; learns the gateway MAC from matching replies.
pub fn handle_packet(data: &[u8], our_mac: MacAddress) -> Option<Vec<u8>> {
    let (op, sender_mac, sender_ip, target_ip) = parse(data).ok()?;

    match op {
        ARP_OP_REQUEST if target_ip == OUR_IP => {
            // Also a learning opportunity when the gateway probes us.
            if sender_ip == GATEWAY_IP {
                *GATEWAY_MAC.lock() = Some(sender_mac);
            }
            let reply = build_reply(our_mac, sender_mac, sender_ip);
            Some(ethernet::construct_frame(
                sender_mac,
                our_mac,
                ethernet::ETHERTYPE_ARP,
                &reply,
            ))
        }
        ARP_OP_REPLY if sender_ip == GATEWAY_IP => {
            *GATEWAY_MAC.lock() = Some(sender_mac);
            println!(
                "[ARP] Gateway is {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                sender_mac.0[0],
                sender_mac.0[1],
                sender_mac.0[2],
                sender_mac.0[3],
                sender_mac.0[4],
                sender_mac.0[5]
            );
            None
        }
        // Replies for addresses we never asked about are ignored.
        _ => None,
    }
}

/// Broadcast a request for the gateway's MAC.
pub fn send_gateway_request() -> KernelResult<()> {
    let our_mac = device::mac_address()?;
    let request = build_request(our_mac, GATEWAY_IP);
    let frame = ethernet::construct_frame(
        MacAddress::BROADCAST,
        our_mac,
        ethernet::ETHERTYPE_ARP,
        &request,
    );
    super::send_frame(&frame);
    Ok(())
}

/// Number of resolution attempts before giving up.
const RESOLVE_ATTEMPTS: u32 = 50;
/// Poll interval between attempts.
const RESOLVE_POLL_MS: u64 = 10;

/// Resolve the gateway, blocking (polling) up to ~500 ms.
pub fn resolve_gateway() -> KernelResult<MacAddress> {
    for _ in 0..RESOLVE_ATTEMPTS {
        if let Some(mac) = gateway_mac() {
            return Ok(mac);
        }
        send_gateway_request()?;
        crate::arch::x86_64::timer::sleep_ms(RESOLVE_POLL_MS);
        super::poll();
    }
    Err(NetError::GatewayUnresolved.into())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const OUR_MAC: MacAddress = MacAddress([0x52, 0x54, 0x00, 0xAA, 0xBB, 0xCC]);

    #[test]
    fn test_request_layout() {
        let pkt = build_request(OUR_MAC, GATEWAY_IP);
        assert_eq!(pkt.len(), ARP_PACKET_SIZE);
        assert_eq!(u16::from_be_bytes([pkt[6], pkt[7]]), ARP_OP_REQUEST);
        assert_eq!(&pkt[8..14], &OUR_MAC.0);
        assert_eq!(&pkt[14..18], &OUR_IP.0);
        assert_eq!(&pkt[18..24], &[0u8; 6]); // target MAC zero in requests
        assert_eq!(&pkt[24..28], &GATEWAY_IP.0);
    }

    #[test]
    fn test_request_for_us_produces_reply() {
        let asker_mac = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        let asker_ip = Ipv4Address::new(10, 0, 2, 99);
        let request = build_packet(ARP_OP_REQUEST, asker_mac, asker_ip, MacAddress::ZERO, OUR_IP);

        let frame = handle_packet(&request, OUR_MAC).expect("reply expected");
        let parsed = ethernet::parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, asker_mac);
        assert_eq!(parsed.ethertype, ethernet::ETHERTYPE_ARP);

        let payload = parsed.payload;
        assert_eq!(
            u16::from_be_bytes([payload[6], payload[7]]),
            ARP_OP_REPLY
        );
        assert_eq!(&payload[8..14], &OUR_MAC.0);
        assert_eq!(&payload[14..18], &OUR_IP.0);
        assert_eq!(&payload[24..28], &asker_ip.0);
    }

    #[test]
    fn test_request_for_other_host_ignored() {
        let request = build_packet(
            ARP_OP_REQUEST,
            MacAddress([1; 6]),
            Ipv4Address::new(10, 0, 2, 50),
            MacAddress::ZERO,
            Ipv4Address::new(10, 0, 2, 77),
        );
        assert!(handle_packet(&request, OUR_MAC).is_none());
    }

    #[test]
    fn test_gateway_reply_learned_foreign_reply_ignored() {
        flush_cache();
        let foreign = build_packet(
            ARP_OP_REPLY,
            MacAddress([9; 6]),
            Ipv4Address::new(10, 0, 2, 123),
            OUR_MAC,
            OUR_IP,
        );
        assert!(handle_packet(&foreign, OUR_MAC).is_none());
        assert_eq!(gateway_mac(), None);

        let gw_mac = MacAddress([0x52, 0x55, 0x0A, 0x00, 0x02, 0x02]);
        let reply = build_packet(ARP_OP_REPLY, gw_mac, GATEWAY_IP, OUR_MAC, OUR_IP);
        assert!(handle_packet(&reply, OUR_MAC).is_none());
        assert_eq!(gateway_mac(), Some(gw_mac));
        flush_cache();
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(handle_packet(&[0u8; 20], OUR_MAC).is_none());
    }
}
