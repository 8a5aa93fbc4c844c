//! Ethernet framing.

use alloc::vec::Vec;

use super::MacAddress;
use crate::error::NetError;

/// IPv4 ethertype.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// ARP ethertype.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Header: destination, source, ethertype.
pub const ETH_HEADER_LEN: usize = 14;

/// A parsed frame borrowing its payload.
#[derive(Debug)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Build a frame: 14-byte header, payload verbatim.
pub fn construct_frame(
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into header fields and payload.
pub fn parse_frame(frame: &[u8]) -> Result<EthernetFrame<'_>, NetError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(NetError::FrameTooShort);
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    Ok(EthernetFrame {
        dst: MacAddress(dst),
        src: MacAddress(src),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        payload: &frame[ETH_HEADER_LEN..],
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let dst = MacAddress([0xFF; 6]);
        let src = MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let frame = construct_frame(dst, src, ETHERTYPE_ARP, &[1, 2, 3]);
        assert_eq!(frame.len(), 17);

        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.ethertype, ETHERTYPE_ARP);
        assert_eq!(parsed.payload, &[1, 2, 3]);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            parse_frame(&[0; 13]),
            Err(NetError::FrameTooShort)
        ));
    }
}
