//! Hop-count estimation from the remaining TTL of a single high-TTL echo reply.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{HOP_MARGIN, MAX_HOPS};
use crate::probe::{ProbeReply, ProbeStatus, ProbeTransport};

/// Initial TTLs commonly used by network stacks.
const COMMON_INITIAL_TTLS: [u8; 3] = [64, 128, 255];

/// Outcome of the estimation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimate {
    pub hops: u8,
    pub reply: ProbeReply,
}

/// Guess the sender's initial TTL by rounding up to the nearest common default.
pub fn initial_ttl(remaining: u8) -> u8 {
    COMMON_INITIAL_TTLS
        .into_iter()
        .find(|ttl| remaining <= *ttl)
        .unwrap_or(u8::MAX)
}

/// Number of hops to probe given the remaining TTL seen in an echo reply.
/// Falls back to [`MAX_HOPS`] when there is nothing usable.
pub fn estimate_hop_count(reply_ttl: Option<u8>) -> u8 {
    match reply_ttl {
        Some(remaining) => {
            let distance = initial_ttl(remaining) - remaining;
            distance.saturating_add(HOP_MARGIN).clamp(1, MAX_HOPS)
        }
        None => MAX_HOPS,
    }
}

/// Send the estimation probe and derive the hop count from it.
pub async fn estimate_hops(
    transport: &dyn ProbeTransport,
    target: IpAddr,
    timeout: Duration,
) -> Estimate {
    match transport.probe_unlimited(target, timeout).await {
        Ok(reply) => {
            let usable_ttl = match reply.status {
                ProbeStatus::EchoReply => reply.reply_ttl,
                _ => None,
            };
            let hops = estimate_hop_count(usable_ttl);
            debug!(
                "Estimation probe: status={:?} reply_ttl={:?} -> {} hops",
                reply.status, reply.reply_ttl, hops
            );
            Estimate { hops, reply }
        }
        Err(e) => {
            warn!("Estimation probe failed: {}", e);
            Estimate {
                hops: MAX_HOPS,
                reply: ProbeReply::timeout(Duration::ZERO),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_ttl_rounding() {
        assert_eq!(initial_ttl(1), 64);
        assert_eq!(initial_ttl(64), 64);
        assert_eq!(initial_ttl(65), 128);
        assert_eq!(initial_ttl(128), 128);
        assert_eq!(initial_ttl(129), 255);
        assert_eq!(initial_ttl(255), 255);
    }

    #[test]
    fn test_estimate_adds_margin() {
        // 64 - 57 = 7 hops, plus margin
        assert_eq!(estimate_hop_count(Some(57)), 10);
        // 128 - 116 = 12 hops
        assert_eq!(estimate_hop_count(Some(116)), 15);
        // 255 - 240 = 15 hops
        assert_eq!(estimate_hop_count(Some(240)), 18);
    }

    #[test]
    fn test_estimate_clamps() {
        // Directly attached: distance 0 still gets the margin
        assert_eq!(estimate_hop_count(Some(64)), HOP_MARGIN);
        // 64 - 1 = 63 hops is clamped to the maximum
        assert_eq!(estimate_hop_count(Some(1)), MAX_HOPS);
    }

    #[test]
    fn test_estimate_fallback() {
        assert_eq!(estimate_hop_count(None), MAX_HOPS);
    }
}
