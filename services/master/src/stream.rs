//! Per-slot stream lifecycle: contention, fast-terminator, hang-time rules.
//!
//! A slot carries at most one stream.  Real receptions from a repeater create
//! normal streams; forwarding to a repeater plants an *assumed* stream on the
//! target slot as a contention/hang-time marker.  The disposition of every
//! incoming data packet against the slot's current occupant is decided by
//! [`classify_packet`], which is pure so the whole decision table is unit
//! tested without sockets.

use hb_protocol::{CallType, Dmrd, RepeaterId, Slot};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A voice terminator frame was received.
    Terminator,
    /// A new stream arrived on a slot whose stream had gone stale without a
    /// terminator.
    FastTerminator,
    /// No packet for longer than the stream timeout.
    Timeout,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Terminator => "terminator",
            EndReason::FastTerminator => "fast_terminator",
            EndReason::Timeout => "timeout",
        }
    }
}

/// State of one transmission on one slot.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_id: u32,
    pub rf_src: u32,
    pub dst_id: u32,
    pub slot: Slot,
    pub call_type: CallType,
    pub start_time: Instant,
    pub last_packet_time: Instant,
    pub packet_count: u64,
    pub ended: bool,
    pub end_time: Option<Instant>,
    /// True for TX-side markers planted on forwarding targets.
    pub is_assumed: bool,
    /// Cached routing targets; fixed for the life of the stream except for
    /// real-RX-wins displacement.
    pub target_repeaters: HashSet<RepeaterId>,
    pub routing_cached: bool,
}

impl StreamState {
    /// A new stream from a real reception.  Counts the packet that opened it.
    pub fn new_inbound(dmrd: &Dmrd, now: Instant) -> Self {
        StreamState {
            stream_id: dmrd.stream_id,
            rf_src: dmrd.rf_src,
            dst_id: dmrd.dst_id,
            slot: dmrd.slot(),
            call_type: dmrd.call_type(),
            start_time: now,
            last_packet_time: now,
            packet_count: 1,
            ended: false,
            end_time: None,
            is_assumed: false,
            target_repeaters: HashSet::new(),
            routing_cached: false,
        }
    }

    /// The marker planted on a forwarding target's slot.
    pub fn new_assumed(dmrd: &Dmrd, now: Instant) -> Self {
        StreamState {
            is_assumed: true,
            ..StreamState::new_inbound(dmrd, now)
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_packet_time = now;
        self.packet_count += 1;
    }

    pub fn end(&mut self, now: Instant) {
        self.ended = true;
        self.end_time = Some(now);
    }

    pub fn duration(&self) -> Duration {
        self.end_time
            .unwrap_or(self.last_packet_time)
            .duration_since(self.start_time)
    }

    /// Whether the hang-time window after this (ended) stream has elapsed.
    /// Exactly at the boundary counts as expired.
    pub fn hang_expired(&self, now: Instant, hang_time: Duration) -> bool {
        match self.end_time {
            Some(end) => now.duration_since(end) >= hang_time,
            None => false,
        }
    }
}

/// What to do with a data packet, given the slot's current occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Same stream continuing; `terminator` marks its final frame.
    Continuation { terminator: bool },
    /// Slot free (or hang window elapsed): start a new stream.
    StartNew,
    /// Slot holds a live assumed stream but the repeater is really receiving:
    /// real RX wins.  Displace the marker, then start the new stream.
    DisplaceAssumed,
    /// Slot holds a different, still-active stream: drop the packet.
    Contention,
    /// Slot's stream went stale without a terminator: end it with reason
    /// `fast_terminator`, then start the new stream.
    FastTerminator,
    /// Within the hang window and permitted by the hang rules: replace.
    HangAllowed,
    /// Within the hang window, different user and different talkgroup:
    /// drop (hijack prevention).
    HangDenied,
}

/// Decide the disposition of `dmrd` against the slot's current stream.
///
/// A stream is "active" while its last packet is no older than
/// `active_threshold` (the boundary counts as active).  Hang rules: a new
/// stream is allowed during the hang window unless both the source
/// subscriber and the destination differ from the ended stream's.
pub fn classify_packet(
    existing: Option<&StreamState>,
    dmrd: &Dmrd,
    now: Instant,
    active_threshold: Duration,
    hang_time: Duration,
) -> Disposition {
    let Some(stream) = existing else {
        return Disposition::StartNew;
    };

    if stream.is_assumed && !stream.ended {
        return Disposition::DisplaceAssumed;
    }

    if stream.stream_id == dmrd.stream_id && !stream.ended {
        return Disposition::Continuation {
            terminator: dmrd.is_terminator(),
        };
    }

    if !stream.ended {
        if now.duration_since(stream.last_packet_time) <= active_threshold {
            return Disposition::Contention;
        }
        return Disposition::FastTerminator;
    }

    // Ended: hang-time window.
    if stream.hang_expired(now, hang_time) {
        return Disposition::StartNew;
    }
    if stream.rf_src == dmrd.rf_src || stream.dst_id == dmrd.dst_id {
        Disposition::HangAllowed
    } else {
        Disposition::HangDenied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE: Duration = Duration::from_millis(200);
    const HANG: Duration = Duration::from_secs(10);

    fn dmrd(rf_src: u32, dst_id: u32, stream_id: u32) -> Dmrd {
        Dmrd {
            sequence: 0,
            rf_src,
            dst_id,
            repeater_id: RepeaterId(312_000),
            // TS2, group call, voice frame
            control: 0b1100_0000,
            stream_id,
            payload: [0; 33],
        }
    }

    fn terminator(rf_src: u32, dst_id: u32, stream_id: u32) -> Dmrd {
        let mut d = dmrd(rf_src, dst_id, stream_id);
        // data_sync frame, dtype 2
        d.control = 0b1110_0010;
        d
    }

    fn classify(existing: Option<&StreamState>, d: &Dmrd, now: Instant) -> Disposition {
        classify_packet(existing, d, now, ACTIVE, HANG)
    }

    #[test]
    fn empty_slot_starts_new() {
        let now = Instant::now();
        assert_eq!(classify(None, &dmrd(1, 2, 3), now), Disposition::StartNew);
    }

    #[test]
    fn same_stream_id_is_a_continuation() {
        let now = Instant::now();
        let d = dmrd(3_121_234, 3120, 0xAA);
        let stream = StreamState::new_inbound(&d, now);
        assert_eq!(
            classify(Some(&stream), &d, now + Duration::from_millis(60)),
            Disposition::Continuation { terminator: false }
        );
        assert_eq!(
            classify(
                Some(&stream),
                &terminator(3_121_234, 3120, 0xAA),
                now + Duration::from_millis(60)
            ),
            Disposition::Continuation { terminator: true }
        );
    }

    #[test]
    fn different_stream_on_active_slot_is_contention() {
        let now = Instant::now();
        let stream = StreamState::new_inbound(&dmrd(1, 3120, 0xAA), now);
        let rival = dmrd(2, 3121, 0xBB);
        assert_eq!(
            classify(Some(&stream), &rival, now + Duration::from_millis(60)),
            Disposition::Contention
        );
    }

    #[test]
    fn exactly_at_active_threshold_is_still_contention() {
        let now = Instant::now();
        let stream = StreamState::new_inbound(&dmrd(1, 3120, 0xAA), now);
        let rival = dmrd(2, 3121, 0xBB);
        assert_eq!(
            classify(Some(&stream), &rival, now + ACTIVE),
            Disposition::Contention
        );
    }

    #[test]
    fn stale_unterminated_stream_is_fast_terminated() {
        let now = Instant::now();
        let stream = StreamState::new_inbound(&dmrd(1, 3120, 0xAA), now);
        let rival = dmrd(2, 3121, 0xBB);
        assert_eq!(
            classify(Some(&stream), &rival, now + ACTIVE + Duration::from_millis(1)),
            Disposition::FastTerminator
        );
    }

    #[test]
    fn live_assumed_stream_is_displaced_by_real_rx() {
        let now = Instant::now();
        let assumed = StreamState::new_assumed(&dmrd(1, 3120, 0xAA), now);
        // Even a packet with the same stream id displaces: real RX wins.
        assert_eq!(
            classify(Some(&assumed), &dmrd(1, 3120, 0xAA), now),
            Disposition::DisplaceAssumed
        );
        assert_eq!(
            classify(Some(&assumed), &dmrd(9, 9, 0xBB), now + Duration::from_millis(60)),
            Disposition::DisplaceAssumed
        );
    }

    // Hang-time rules: (same src, same dst) and (same, diff) and (diff, same)
    // are allowed; (diff, diff) is the hijack case and is denied.

    fn ended_stream(now: Instant) -> StreamState {
        let mut s = StreamState::new_inbound(&dmrd(3_121_234, 3120, 0xAA), now);
        s.end(now + Duration::from_secs(1));
        s
    }

    #[test]
    fn hang_same_user_same_talkgroup_allowed() {
        let now = Instant::now();
        let s = ended_stream(now);
        let within = now + Duration::from_secs(5);
        assert_eq!(
            classify(Some(&s), &dmrd(3_121_234, 3120, 0xBB), within),
            Disposition::HangAllowed
        );
    }

    #[test]
    fn hang_same_user_new_talkgroup_allowed() {
        let now = Instant::now();
        let s = ended_stream(now);
        assert_eq!(
            classify(Some(&s), &dmrd(3_121_234, 9, 0xBB), now + Duration::from_secs(5)),
            Disposition::HangAllowed
        );
    }

    #[test]
    fn hang_new_user_same_talkgroup_allowed() {
        let now = Instant::now();
        let s = ended_stream(now);
        assert_eq!(
            classify(Some(&s), &dmrd(3_125_678, 3120, 0xBB), now + Duration::from_secs(5)),
            Disposition::HangAllowed
        );
    }

    #[test]
    fn hang_new_user_new_talkgroup_denied() {
        let now = Instant::now();
        let s = ended_stream(now);
        assert_eq!(
            classify(Some(&s), &dmrd(3_125_678, 9, 0xBB), now + Duration::from_secs(5)),
            Disposition::HangDenied
        );
    }

    #[test]
    fn hang_window_elapsed_frees_the_slot() {
        let now = Instant::now();
        let s = ended_stream(now);
        // end_time is now+1s; exactly at the hang boundary counts as expired
        let at_boundary = now + Duration::from_secs(1) + HANG;
        assert_eq!(
            classify(Some(&s), &dmrd(3_125_678, 9, 0xBB), at_boundary),
            Disposition::StartNew
        );
    }

    #[test]
    fn touch_and_end_maintain_counters_and_times() {
        let now = Instant::now();
        let mut s = StreamState::new_inbound(&dmrd(1, 2, 3), now);
        assert_eq!(s.packet_count, 1);
        s.touch(now + Duration::from_millis(60));
        s.touch(now + Duration::from_millis(120));
        assert_eq!(s.packet_count, 3);
        assert!(!s.ended);
        s.end(now + Duration::from_millis(120));
        assert!(s.ended);
        assert_eq!(s.duration(), Duration::from_millis(120));
        assert!(s.end_time.expect("ended") >= s.start_time);
    }
}
