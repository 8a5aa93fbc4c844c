//! ICMP: echo responder and outbound ping.
//!
//! Inbound echo requests are answered with the id, sequence and payload
//! preserved and both checksums recomputed. Outbound ping is two-phase
//! per the cancellation model: a blocking (polling) ARP resolution of the
//! gateway, then a non-blocking wait for the matching reply via
//! [`ping_check`], which reports the measured round-trip time.

use alloc::vec::Vec;

use spin::Mutex;

use super::{arp, checksum, device, ethernet, ip, Ipv4Address, GATEWAY_IP};
use crate::arch::x86_64::timer;
use crate::error::KernelResult;

/// ICMP echo request type.
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// ICMP echo reply type.
pub const ICMP_ECHO_REPLY: u8 = 0;

/// Echo header: type, code, checksum, id, seq.
pub const ICMP_HEADER_LEN: usize = 8;

/// Identifier stamped on every ping we originate.
pub const PING_ID: u16 = 0x4F53;

/// Payload carried by outbound pings.
pub const PING_PAYLOAD: [u8; 32] = [0xAA; 32];

/// In-flight ping bookkeeping.
struct PendingPing {
    seq: u16,
    sent_ms: u64,
}

static PENDING: Mutex<Option<PendingPing>> = Mutex::new(None);
static LAST_RTT_MS: Mutex<Option<u64>> = Mutex::new(None);

/// Build an echo message (request or reply share the shape).
fn build_echo(msg_type: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    msg.push(msg_type);
    msg.push(0); // code
    msg.extend_from_slice(&[0, 0]); // checksum placeholder
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let csum = checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

/// Build an echo request.
pub fn build_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    build_echo(ICMP_ECHO_REQUEST, id, seq, payload)
}

/// Handle an inbound ICMP message from `src`.
///
/// Returns the ICMP reply bytes to send back (for echo requests), or
/// records ping completion (for echo replies addressed to our id).
pub fn handle_message(src: Ipv4Address, data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < ICMP_HEADER_LEN {
        return None;
    }
    // A corrupted message checksums non-zero; drop it.
    if checksum(data) != 0 {
        return None;
    }

    let msg_type = data[0];
    let id = u16::from_be_bytes([data[4], data[5]]);
    let seq = u16::from_be_bytes([data[6], data[7]]);
    let payload = &data[ICMP_HEADER_LEN..];

    match msg_type {
        ICMP_ECHO_REQUEST => Some(build_echo(ICMP_ECHO_REPLY, id, seq, payload)),
        ICMP_ECHO_REPLY => {
            if id != PING_ID {
                // Someone else's ping; not ours to account for.
                return None;
            }
            let mut pending = PENDING.lock();
            if let Some(p) = pending.as_ref() {
                if p.seq == seq {
                    let rtt = timer::ms().saturating_sub(p.sent_ms);
                    *LAST_RTT_MS.lock() = Some(rtt);
                    println!(
                        "[NET] Echo reply from {}.{}.{}.{} seq {} rtt {} ms",
                        src.0[0], src.0[1], src.0[2], src.0[3], seq, rtt
                    );
                    *pending = None;
                }
            }
            None
        }
        _ => None,
    }
}

/// Send an echo request to `target`.
///
/// Blocks (polling) while the gateway MAC is resolved, then transmits and
/// returns; the reply is picked up later by [`ping_check`].
pub fn ping(target: Ipv4Address, seq: u16) -> KernelResult<()> {
    let gw_mac = arp::resolve_gateway()?;
    let our_mac = device::mac_address()?;

    let echo = build_echo_request(PING_ID, seq, &PING_PAYLOAD);
    let packet = ip::build_packet(super::OUR_IP, target, ip::IP_PROTO_ICMP, &echo);
    let frame = ethernet::construct_frame(gw_mac, our_mac, ethernet::ETHERTYPE_IPV4, &packet);

    *PENDING.lock() = Some(PendingPing {
        seq,
        sent_ms: timer::ms(),
    });
    super::send_frame(&frame);
    Ok(())
}

/// Ping the default gateway.
pub fn ping_gateway(seq: u16) -> KernelResult<()> {
    ping(GATEWAY_IP, seq)
}

/// Non-blocking completion check: drains the device and returns the RTT
/// in milliseconds once the matching reply has arrived.
pub fn ping_check() -> Option<u64> {
    super::poll();
    LAST_RTT_MS.lock().take()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::net::OUR_IP;

    #[test]
    fn test_echo_request_layout() {
        let req = build_echo_request(PING_ID, 7, &PING_PAYLOAD);
        assert_eq!(req.len(), ICMP_HEADER_LEN + 32);
        assert_eq!(req[0], ICMP_ECHO_REQUEST);
        assert_eq!(req[1], 0);
        assert_eq!(u16::from_be_bytes([req[4], req[5]]), PING_ID);
        assert_eq!(u16::from_be_bytes([req[6], req[7]]), 7);
        // Message with embedded checksum sums to zero.
        assert_eq!(checksum(&req), 0);
    }

    /// §8 scenario 6: the echo reply preserves id, seq and payload, with
    /// valid checksums and the fixed IP shape (total length 60, TTL 64).
    #[test]
    fn test_echo_roundtrip_through_ip_layer() {
        let src = Ipv4Address::new(10, 0, 2, 2);
        let echo = build_echo_request(0x4F53, 1, &[0xAA; 32]);
        let request_packet = ip::build_packet(src, OUR_IP, ip::IP_PROTO_ICMP, &echo);

        let reply_packet = ip::handle_packet(&request_packet).expect("echo must be answered");

        let parsed = ip::parse(&reply_packet).unwrap();
        assert_eq!(parsed.src, OUR_IP);
        assert_eq!(parsed.dst, src);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(reply_packet.len(), 60);
        assert_eq!(
            u16::from_be_bytes([reply_packet[2], reply_packet[3]]),
            60
        );

        let reply = parsed.payload;
        assert_eq!(reply[0], ICMP_ECHO_REPLY);
        assert_eq!(checksum(reply), 0);
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 0x4F53);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        assert_eq!(&reply[8..], &[0xAA; 32]);
    }

    #[test]
    fn test_corrupt_echo_dropped() {
        let mut echo = build_echo_request(PING_ID, 1, &[1, 2, 3, 4]);
        echo[9] ^= 0x55; // corrupt payload without fixing the checksum
        assert!(handle_message(Ipv4Address::new(10, 0, 2, 2), &echo).is_none());
    }

    #[test]
    fn test_foreign_reply_id_ignored() {
        *PENDING.lock() = Some(PendingPing {
            seq: 3,
            sent_ms: 0,
        });
        let reply = build_echo(ICMP_ECHO_REPLY, 0x1111, 3, &[0u8; 4]);
        assert!(handle_message(Ipv4Address::new(10, 0, 2, 2), &reply).is_none());
        // Still pending: the foreign id must not complete our ping.
        assert!(PENDING.lock().take().is_some());
        *LAST_RTT_MS.lock() = None;
    }

    #[test]
    fn test_matching_reply_completes_ping() {
        *PENDING.lock() = Some(PendingPing {
            seq: 9,
            sent_ms: 0,
        });
        let reply = build_echo(ICMP_ECHO_REPLY, PING_ID, 9, &PING_PAYLOAD);
        assert!(handle_message(GATEWAY_IP, &reply).is_none());
        assert!(PENDING.lock().is_none());
        assert!(LAST_RTT_MS.lock().take().is_some());
    }
}
