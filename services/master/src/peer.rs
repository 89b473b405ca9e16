//! Per-repeater connection state.

use crate::access::TalkgroupPolicy;
use crate::stream::StreamState;
use hb_protocol::{RepeaterId, RptcPayload, Slot};
use std::net::SocketAddr;
use tokio::time::Instant;

/// Connection phase of the HomeBrew state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `RPTL` accepted, challenge sent, waiting for `RPTK`.
    Login,
    /// Authenticated, waiting for `RPTC`.
    Config,
    Connected,
}

/// One inbound repeater.
///
/// Created when its `RPTL` is accepted; mutated only by packets from this
/// repeater or by the sweeps; removed on `RPTCL`, auth failure, or keepalive
/// loss.
#[derive(Debug)]
pub struct Repeater {
    pub id: RepeaterId,
    pub addr: SocketAddr,
    pub phase: Phase,
    pub salt: [u8; 4],
    /// Resolved by the access controller when the login was accepted.
    pub passphrase: String,
    pub pattern_name: String,
    pub last_ping: Instant,
    pub keepalive_count: u64,
    pub missed_keepalives: u32,
    /// The pattern's configured policy, the master allow-list that `RPTO`
    /// requests are intersected against.
    pub configured_slot1: TalkgroupPolicy,
    pub configured_slot2: TalkgroupPolicy,
    /// Effective policy (configured, possibly narrowed by `RPTO`).
    pub slot1_talkgroups: TalkgroupPolicy,
    pub slot2_talkgroups: TalkgroupPolicy,
    pub options_received: bool,
    pub metadata: Option<RptcPayload>,
    pub slots: [Option<StreamState>; 2],
}

impl Repeater {
    pub fn new(
        id: RepeaterId,
        addr: SocketAddr,
        salt: [u8; 4],
        passphrase: String,
        pattern_name: String,
        now: Instant,
    ) -> Self {
        Repeater {
            id,
            addr,
            phase: Phase::Login,
            salt,
            passphrase,
            pattern_name,
            last_ping: now,
            keepalive_count: 0,
            missed_keepalives: 0,
            configured_slot1: TalkgroupPolicy::AllowAll,
            configured_slot2: TalkgroupPolicy::AllowAll,
            slot1_talkgroups: TalkgroupPolicy::AllowAll,
            slot2_talkgroups: TalkgroupPolicy::AllowAll,
            options_received: false,
            metadata: None,
            slots: [None, None],
        }
    }

    pub fn slot(&self, slot: Slot) -> Option<&StreamState> {
        self.slots[slot.index()].as_ref()
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut Option<StreamState> {
        &mut self.slots[slot.index()]
    }

    pub fn policy(&self, slot: Slot) -> &TalkgroupPolicy {
        match slot {
            Slot::S1 => &self.slot1_talkgroups,
            Slot::S2 => &self.slot2_talkgroups,
        }
    }

    pub fn configured_policy(&self, slot: Slot) -> &TalkgroupPolicy {
        match slot {
            Slot::S1 => &self.configured_slot1,
            Slot::S2 => &self.configured_slot2,
        }
    }

    pub fn callsign(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.callsign.as_str())
    }
}
