//! Controller reachability over ICMP echo
//!
//! Uses an unprivileged datagram ICMP socket, so no raw-socket rights are
//! needed, but the host has to allow it (on Linux, `net.ipv4.ping_group_range`).
//! A ping never fails outright: every problem comes back as a
//! [`PingOutcome`] that is not alive and carries the reason.

use showplay_core::PingOutcome;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::controllers::resolve_address;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;

const PING_PAYLOAD: &[u8; 16] = b"showplay-ping\0\0\0";

/// Length of an echo request built by [`echo_request`]
pub const ECHO_REQUEST_LEN: usize = 8 + PING_PAYLOAD.len();

/// Internet checksum over `data` (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]) as u32)
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// ICMP echo request with a valid checksum
pub fn echo_request(id: u16, sequence: u16) -> [u8; ECHO_REQUEST_LEN] {
    let mut packet = [0u8; ECHO_REQUEST_LEN];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..].copy_from_slice(PING_PAYLOAD);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

fn ping_blocking(address: Ipv4Addr, timeout: Duration) -> PingOutcome {
    let mut socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
        Ok(socket) => socket,
        Err(e) => return PingOutcome::failed(format!("ICMP socket unavailable: {}", e)),
    };
    if let Err(e) = socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1)))) {
        return PingOutcome::failed(e);
    }

    let packet = echo_request(std::process::id() as u16, 1);
    let destination: SocketAddr = (address, 0).into();
    let started = Instant::now();
    if let Err(e) = socket.send_to(&packet, &destination.into()) {
        return PingOutcome::failed(format!("send failed: {}", e));
    }

    // Datagram ICMP sockets deliver the ICMP message without the IP header
    let mut reply = [0u8; 256];
    match socket.read(&mut reply) {
        Ok(0) => PingOutcome::failed("empty ICMP response"),
        Ok(_) if reply[0] == ICMP_ECHO_REPLY => PingOutcome::alive(started.elapsed().as_secs_f64() * 1000.0),
        Ok(_) => PingOutcome::failed(format!("ICMP type {} (not echo reply)", reply[0])),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
            PingOutcome::failed("timeout")
        }
        Err(e) => PingOutcome::failed(format!("receive failed: {}", e)),
    }
}

/// Send one echo request to `host` and wait up to `timeout` for the reply.
pub async fn ping(host: &str, timeout: Duration) -> PingOutcome {
    let address = match resolve_address(host, 0).await {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        Ok(SocketAddr::V6(_)) => return PingOutcome::failed("IPv6 ping not supported"),
        Err(e) => return PingOutcome::failed(e),
    };
    let outcome = tokio::task::spawn_blocking(move || ping_blocking(address, timeout))
        .await
        .unwrap_or_else(PingOutcome::failed);
    debug!("Ping {} ({}): {:?}", host, address, outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // RFC 1071 section 3 example
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
        assert_eq!(checksum(&[0xff]), !0xff00);
    }

    #[test]
    fn test_echo_request_layout() {
        let packet = echo_request(0x1234, 7);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0, 7]);
        assert_eq!(&packet[8..21], b"showplay-ping");
        // A packet carrying its own checksum sums to zero
        assert_eq!(checksum(&packet), 0);
    }

    #[tokio::test]
    async fn test_ping_never_errors() {
        // Loopback may or may not allow unprivileged ICMP; either way there is an answer
        let outcome = ping("127.0.0.1", Duration::from_millis(500)).await;
        assert!(outcome.alive || outcome.error.is_some());
        if outcome.alive {
            assert!(outcome.elapsed_ms >= 0.0);
        }

        let outcome = ping("::1", Duration::from_millis(100)).await;
        assert!(!outcome.alive);
        assert_eq!(outcome.error.as_deref(), Some("IPv6 ping not supported"));
    }
}
