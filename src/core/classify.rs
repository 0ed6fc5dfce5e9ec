//! Packet eligibility checks
//!
//! Every queue event passes through [`classify`] before it reaches the
//! inspection callback. Events that cannot be inspected are resolved here
//! with a kernel verdict of their own.

use crate::core::queue::{KernelVerdict, RawEvent};

/// Smallest possible IPv4 header; nothing shorter is a real packet
pub const MIN_IP_HEADER_LEN: usize = 20;

/// Outcome of checking one queue event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No packet id: the kernel cannot be told anything about this event.
    Unverdictable,
    /// Resolved without inspection.
    Synthetic {
        packet_id: u32,
        verdict: KernelVerdict,
    },
    /// Ready for conntrack decoding and the callback.
    Eligible {
        packet_id: u32,
        payload: Vec<u8>,
        conntrack: Vec<u8>,
    },
}

/// Decides whether a queue event goes to the callback.
///
/// - missing packet id: [`Classification::Unverdictable`]
/// - missing or truncated payload: drop
/// - missing conntrack: accept in local mode (multicast and broadcast have
///   no tracked connection there), drop for forwarded traffic
pub fn classify(event: RawEvent, local: bool) -> Classification {
    let Some(packet_id) = event.packet_id else {
        return Classification::Unverdictable;
    };

    let payload = match event.payload {
        Some(payload) if payload.len() >= MIN_IP_HEADER_LEN => payload,
        _ => {
            return Classification::Synthetic {
                packet_id,
                verdict: KernelVerdict::Drop,
            };
        }
    };

    let Some(conntrack) = event.conntrack else {
        let verdict = if local {
            KernelVerdict::Accept
        } else {
            KernelVerdict::Drop
        };
        return Classification::Synthetic { packet_id, verdict };
    };

    Classification::Eligible {
        packet_id,
        payload,
        conntrack,
    }
}
