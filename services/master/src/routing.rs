//! Routing: target-set computation at stream start and the per-packet
//! forwarding gate.
//!
//! Targets are computed once, when a stream starts, and cached on the stream
//! (repeater id values, never references).  Per packet, each cached
//! target's slot is checked again: an active real reception always wins over
//! our transmission, and a slot already claimed by another forwarded stream
//! is skipped for this packet without disturbing the cache.

use crate::access::TalkgroupPolicy;
use crate::stream::StreamState;
use hb_protocol::{Dmrd, RepeaterId};
use std::collections::HashSet;
use tokio::time::Instant;

/// One potential forwarding target (a connected repeater or outbound link),
/// viewed through the slot the stream occupies.
pub struct TargetCandidate<'a> {
    pub id: RepeaterId,
    pub policy: &'a TalkgroupPolicy,
    pub slot_stream: Option<&'a StreamState>,
}

/// Whether a target slot can accept our transmission at stream start.
///
/// Free slots and slots holding only a displaceable assumed stream are
/// available; so are slots whose stream has ended (the hang window reserves
/// the slot against local hijack, not against the conversation's own
/// traffic).  An active real reception excludes the target.
pub fn slot_available(existing: Option<&StreamState>) -> bool {
    match existing {
        None => true,
        Some(s) => s.ended || s.is_assumed,
    }
}

/// Compute the target set for a group call.  The caller supplies every
/// connected peer except the stream's source.
pub fn compute_group_targets<'a, I>(candidates: I, tgid: u32) -> HashSet<RepeaterId>
where
    I: Iterator<Item = TargetCandidate<'a>>,
{
    candidates
        .filter(|c| c.policy.permits(tgid) && slot_available(c.slot_stream))
        .map(|c| c.id)
        .collect()
}

/// Per-packet forwarding gate on one target slot.
///
/// Plants or refreshes the assumed-stream marker and says whether the packet
/// should actually be sent:
/// - empty slot: plant the marker, send
/// - our own marker: refresh it, send
/// - ended stream (hang window): replace it with our marker, send
/// - active real reception: skip (RX beats assumed TX)
/// - another stream's live marker: skip (first claim wins this packet)
pub fn admit_forward(slot: &mut Option<StreamState>, dmrd: &Dmrd, now: Instant) -> bool {
    match slot {
        None => {
            *slot = Some(StreamState::new_assumed(dmrd, now));
            true
        }
        Some(s) if s.is_assumed && !s.ended && s.stream_id == dmrd.stream_id => {
            s.touch(now);
            true
        }
        Some(s) if s.ended => {
            *slot = Some(StreamState::new_assumed(dmrd, now));
            true
        }
        Some(_) => false,
    }
}
