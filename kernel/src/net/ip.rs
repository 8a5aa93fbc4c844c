//! IPv4: header construction, validation, and ICMP dispatch.
//!
//! The stack accepts packets addressed to us or to broadcast, speaks ICMP
//! only, and emits fixed-shape headers: IHL 5, no fragmentation, TTL 64.

use alloc::vec::Vec;

use super::{checksum, icmp, Ipv4Address, OUR_IP};
use crate::error::NetError;

/// IPv4 header length (IHL = 5, no options).
pub const IP_HEADER_LEN: usize = 20;

/// Protocol number for ICMP.
pub const IP_PROTO_ICMP: u8 = 1;

/// Time-to-live on everything we send.
pub const IP_DEFAULT_TTL: u8 = 64;

/// A parsed IPv4 packet borrowing its payload.
#[derive(Debug)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
}

/// Build a 20-byte header with a valid checksum.
pub fn build_header(
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    payload_len: usize,
) -> [u8; IP_HEADER_LEN] {
    let total_len = (IP_HEADER_LEN + payload_len) as u16;
    let mut header = [0u8; IP_HEADER_LEN];
    header[0] = 0x45; // version 4, IHL 5
    header[1] = 0; // DSCP/ECN
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    // identification, flags, fragment offset: zero
    header[8] = IP_DEFAULT_TTL;
    header[9] = protocol;
    // checksum computed over the header with the field zeroed
    header[12..16].copy_from_slice(&src.0);
    header[16..20].copy_from_slice(&dst.0);
    let csum = checksum(&header);
    header[10..12].copy_from_slice(&csum.to_be_bytes());
    header
}

/// Validate and split a packet.
pub fn parse(packet: &[u8]) -> Result<Ipv4Packet<'_>, NetError> {
    if packet.len() < IP_HEADER_LEN {
        return Err(NetError::FrameTooShort);
    }
    if packet[0] >> 4 != 4 {
        return Err(NetError::UnsupportedProtocol);
    }
    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    if header_len < IP_HEADER_LEN || packet.len() < header_len {
        return Err(NetError::FrameTooShort);
    }
    // A valid header checksums (including its checksum field) to zero.
    if checksum(&packet[..header_len]) != 0 {
        return Err(NetError::ChecksumMismatch);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(NetError::FrameTooShort);
    }

    Ok(Ipv4Packet {
        src: Ipv4Address([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Address([packet[16], packet[17], packet[18], packet[19]]),
        protocol: packet[9],
        ttl: packet[8],
        payload: &packet[header_len..total_len],
    })
}

/// Handle an incoming IPv4 packet; the returned bytes are a complete
/// IPv4 reply packet ready for Ethernet framing.
pub fn handle_packet(packet: &[u8]) -> Option<Vec<u8>> {
    let parsed = parse(packet).ok()?;

    if parsed.dst != OUR_IP && parsed.dst != Ipv4Address::BROADCAST {
        // Not for us; drop silently.
        return None;
    }
    if parsed.protocol != IP_PROTO_ICMP {
        return None;
    }

    let icmp_reply = icmp::handle_message(parsed.src, parsed.payload)?;
    Some(build_packet(OUR_IP, parsed.src, IP_PROTO_ICMP, &icmp_reply))
}

/// Assemble header + payload.
pub fn build_packet(
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    let header = build_header(src, dst, protocol, payload.len());
    let mut packet = Vec::with_capacity(IP_HEADER_LEN + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);
    packet
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_header_shape() {
        let header = build_header(OUR_IP, Ipv4Address::new(10, 0, 2, 2), IP_PROTO_ICMP, 40);
        assert_eq!(header[0], 0x45);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 60);
        assert_eq!(header[8], 64);
        assert_eq!(header[9], 1);
        // Self-inverse: the finished header checksums to zero.
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_parse_roundtrip() {
        let payload = [0xAAu8; 16];
        let packet = build_packet(
            Ipv4Address::new(10, 0, 2, 2),
            OUR_IP,
            IP_PROTO_ICMP,
            &payload,
        );
        let parsed = parse(&packet).unwrap();
        assert_eq!(parsed.src, Ipv4Address::new(10, 0, 2, 2));
        assert_eq!(parsed.dst, OUR_IP);
        assert_eq!(parsed.protocol, IP_PROTO_ICMP);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(parsed.payload, &payload);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut packet = build_packet(OUR_IP, OUR_IP, IP_PROTO_ICMP, &[1, 2, 3]);
        packet[10] ^= 0xFF;
        assert!(matches!(parse(&packet), Err(NetError::ChecksumMismatch)));
    }

    #[test]
    fn test_foreign_destination_dropped() {
        // Echo request addressed to another host must be ignored.
        let echo = icmp::build_echo_request(0x1234, 1, &[0u8; 8]);
        let packet = build_packet(
            Ipv4Address::new(10, 0, 2, 2),
            Ipv4Address::new(10, 0, 2, 77),
            IP_PROTO_ICMP,
            &echo,
        );
        assert!(handle_packet(&packet).is_none());
    }

    #[test]
    fn test_non_icmp_protocol_dropped() {
        let packet = build_packet(Ipv4Address::new(10, 0, 2, 2), OUR_IP, 17, &[0u8; 8]);
        assert!(handle_packet(&packet).is_none());
    }
}
