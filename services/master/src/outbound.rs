//! Outbound link state: this server presenting as a repeater to a remote
//! master.
//!
//! The handshake mirrors what a repeater does against us: `RPTL`, answer the
//! salt challenge with `RPTK`, send a 302-byte `RPTC` built from configured
//! metadata, optionally send `RPTO`, then keepalive with `RPTPING`.  The
//! socket I/O and timers are driven by the master loop; this module holds the
//! per-link state machine data.

use crate::access::TalkgroupPolicy;
use crate::config::OutboundConfig;
use crate::stream::StreamState;
use hb_protocol::{parse_options, RptcPayload, Slot, TgRequest};
use std::net::SocketAddr;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Not connected; a new login attempt starts at `retry_at`.
    Disconnected { retry_at: Instant },
    /// `RPTL` sent, waiting for the salt challenge.
    LoginSent { since: Instant },
    /// `RPTK` sent, waiting for `RPTACK`.
    AuthSent { since: Instant },
    /// `RPTC` sent, waiting for `RPTACK`.
    ConfigSent { since: Instant },
    Connected,
}

#[derive(Debug)]
pub struct OutboundLink {
    pub cfg: OutboundConfig,
    /// Resolved remote address; kept across retries until re-resolution.
    pub remote: Option<SocketAddr>,
    pub phase: LinkPhase,
    pub last_ping_sent: Instant,
    pub last_pong: Instant,
    /// Per-slot policy derived from the configured options string; governs
    /// both what we forward to the link and what we accept from it.
    pub slot1_talkgroups: TalkgroupPolicy,
    pub slot2_talkgroups: TalkgroupPolicy,
    pub slots: [Option<StreamState>; 2],
}

fn policy_from_request(request: &TgRequest) -> TalkgroupPolicy {
    match request {
        TgRequest::AllowAll => TalkgroupPolicy::AllowAll,
        TgRequest::List(tgs) => TalkgroupPolicy::List(tgs.iter().copied().collect()),
    }
}

impl OutboundLink {
    pub fn new(cfg: OutboundConfig, now: Instant) -> Self {
        let (slot1, slot2) = match &cfg.options {
            Some(options) => {
                let request = parse_options(options);
                (
                    policy_from_request(&request.ts1),
                    policy_from_request(&request.ts2),
                )
            }
            None => (TalkgroupPolicy::AllowAll, TalkgroupPolicy::AllowAll),
        };
        OutboundLink {
            cfg,
            remote: None,
            phase: LinkPhase::Disconnected { retry_at: now },
            last_ping_sent: now,
            last_pong: now,
            slot1_talkgroups: slot1,
            slot2_talkgroups: slot2,
            slots: [None, None],
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == LinkPhase::Connected
    }

    pub fn policy(&self, slot: Slot) -> &TalkgroupPolicy {
        match slot {
            Slot::S1 => &self.slot1_talkgroups,
            Slot::S2 => &self.slot2_talkgroups,
        }
    }

    pub fn slot(&self, slot: Slot) -> Option<&StreamState> {
        self.slots[slot.index()].as_ref()
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut Option<StreamState> {
        &mut self.slots[slot.index()]
    }

    /// The metadata block we present to the remote master.
    pub fn rptc_payload(&self) -> RptcPayload {
        RptcPayload {
            callsign: self.cfg.callsign.clone(),
            rx_freq: self.cfg.rx_frequency.clone(),
            tx_freq: self.cfg.tx_frequency.clone(),
            tx_power: self.cfg.power.clone(),
            color_code: "01".to_owned(),
            latitude: self.cfg.latitude.clone(),
            longitude: self.cfg.longitude.clone(),
            height: self.cfg.height.clone(),
            location: self.cfg.location.clone(),
            description: self.cfg.description.clone(),
            slots: "2".to_owned(),
            url: self.cfg.url.clone(),
            software_id: concat!("hblink-master-", env!("CARGO_PKG_VERSION")).to_owned(),
            package_id: concat!("hblink-master-", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }

    /// Tear down to disconnected; active slot markers are dropped.
    pub fn disconnect(&mut self, retry_at: Instant) {
        self.phase = LinkPhase::Disconnected { retry_at };
        self.slots = [None, None];
    }

    /// How long the current handshake step has been waiting, if any.
    pub fn handshake_age(&self, now: Instant) -> Option<std::time::Duration> {
        match self.phase {
            LinkPhase::LoginSent { since }
            | LinkPhase::AuthSent { since }
            | LinkPhase::ConfigSent { since } => Some(now.duration_since(since)),
            _ => None,
        }
    }
}
