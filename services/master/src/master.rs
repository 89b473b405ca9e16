//! The master event loop: UDP listeners, the HomeBrew connection state
//! machine, stream dispatch, routing, and all periodic sweeps.
//!
//! Everything runs on one cooperative loop.  All state (repeaters, links,
//! streams, caches) is owned by [`Master`] and mutated only between await
//! points, so there is no locking anywhere.  Sends use `try_send_to`: against
//! DMR's ~60 ms packet spacing, a send that would block is dropped instead.
//! The medium is lossy by nature and the hot path must never stall.

use crate::access::{evaluate, AccessDecision};
use crate::config::Config;
use crate::events::{now_rfc3339, DashboardEvent, EventEmitter};
use crate::outbound::{LinkPhase, OutboundLink};
use crate::peer::{Phase, Repeater};
use crate::routing::{admit_forward, compute_group_targets, slot_available, TargetCandidate};
use crate::stream::{classify_packet, Disposition, EndReason, StreamState};
use crate::user_cache::UserCache;
use hb_protocol::{
    auth_digest, build_mstcl, build_mstnak, build_mstpong, build_rptack, build_rptc, build_rptcl,
    build_rptk, build_rptl, build_rpto, build_rptping, classify, digest_matches, parse_frame,
    parse_options, rewrite_repeater_id, CallType, Command, CommandFrame, Dmrd, RepeaterId,
    RptcPayload, Slot, DMRD_LEN,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

const RECV_BUF_LEN: usize = 1500;

#[derive(Debug, thiserror::Error)]
#[error("failed to bind UDP listener on {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Default)]
struct Stats {
    dmrd_received: u64,
    forwarded: u64,
    dropped: u64,
}

pub struct Master {
    cfg: Config,
    sock_v4: UdpSocket,
    sock_v6: Option<UdpSocket>,
    repeaters: HashMap<RepeaterId, Repeater>,
    links: Vec<OutboundLink>,
    /// Remote `(host, port)` → link index, for O(1) inbound demux.
    link_by_addr: HashMap<SocketAddr, usize>,
    /// Ids claimed by outbound links; inbound logins with these are NAK'd.
    reserved: HashMap<RepeaterId, usize>,
    users: UserCache,
    emitter: EventEmitter,
    stats: Stats,
}

impl Master {
    pub async fn bind(cfg: Config, emitter: EventEmitter) -> Result<Self, BindError> {
        let v4_addr = format!("{}:{}", cfg.global.bind_ipv4, cfg.global.port_ipv4);
        let sock_v4 = UdpSocket::bind(&v4_addr).await.map_err(|e| BindError {
            addr: v4_addr.clone(),
            source: e,
        })?;
        info!(addr = %v4_addr, "IPv4 listener bound");

        let sock_v6 = if cfg.global.disable_ipv6 {
            None
        } else {
            let v6_addr = format!("[{}]:{}", cfg.global.bind_ipv6, cfg.global.port_ipv6);
            let sock = UdpSocket::bind(&v6_addr).await.map_err(|e| BindError {
                addr: v6_addr.clone(),
                source: e,
            })?;
            info!(addr = %v6_addr, "IPv6 listener bound");
            Some(sock)
        };

        let now = Instant::now();
        let links: Vec<OutboundLink> = cfg
            .outbound
            .iter()
            .cloned()
            .map(|link_cfg| OutboundLink::new(link_cfg, now))
            .collect();
        let reserved = links
            .iter()
            .enumerate()
            .map(|(i, l)| (l.cfg.our_id, i))
            .collect();
        let users = UserCache::new(cfg.global.user_cache_timeout);

        Ok(Master {
            cfg,
            sock_v4,
            sock_v6,
            repeaters: HashMap::new(),
            links,
            link_by_addr: HashMap::new(),
            reserved,
            users,
            emitter,
            stats: Stats::default(),
        })
    }

    pub fn local_addr_v4(&self) -> std::io::Result<SocketAddr> {
        self.sock_v4.local_addr()
    }

    pub fn local_addr_v6(&self) -> Option<std::io::Result<SocketAddr>> {
        self.sock_v6.as_ref().map(UdpSocket::local_addr)
    }

    /// Drive the loop until `shutdown` flips to true, then drain.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf4 = [0u8; RECV_BUF_LEN];
        let mut buf6 = [0u8; RECV_BUF_LEN];
        let mut stream_sweep = interval(std::time::Duration::from_secs(1));
        let mut minute_sweep = interval(std::time::Duration::from_secs(60));
        let mut keepalive_sweep = interval(self.cfg.global.ping_time);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = self.sock_v4.recv_from(&mut buf4) => {
                    match result {
                        Ok((len, addr)) => {
                            self.handle_datagram(&buf4[..len], addr, Instant::now());
                        }
                        Err(e) => debug!(error = %e, "IPv4 recv error"),
                    }
                }
                result = recv_or_pending(self.sock_v6.as_ref(), &mut buf6) => {
                    match result {
                        Ok((len, addr)) => {
                            self.handle_datagram(&buf6[..len], addr, Instant::now());
                        }
                        Err(e) => debug!(error = %e, "IPv6 recv error"),
                    }
                }
                _ = stream_sweep.tick() => self.tick_streams(Instant::now()),
                _ = minute_sweep.tick() => self.tick_minute(Instant::now()),
                _ = keepalive_sweep.tick() => {
                    let now = Instant::now();
                    self.tick_keepalive(now);
                    self.tick_outbound(now).await;
                }
            }
        }

        self.drain(Instant::now());
    }

    // -----------------------------------------------------------------------
    // Datagram dispatch
    // -----------------------------------------------------------------------

    fn handle_datagram(&mut self, buf: &[u8], addr: SocketAddr, now: Instant) {
        if let Some(&idx) = self.link_by_addr.get(&addr) {
            self.handle_link_datagram(idx, buf, addr, now);
            return;
        }
        match classify(buf) {
            Some(Command::Dmrd) => self.handle_dmrd(buf, addr, now),
            Some(
                cmd @ (Command::Rptl
                | Command::Rptk
                | Command::Rptc
                | Command::Rpto
                | Command::Rptp
                | Command::Rptcl),
            ) => match parse_frame(buf) {
                Ok(frame) => match cmd {
                    Command::Rptl => self.handle_rptl(frame.repeater_id, addr, now),
                    Command::Rptk => self.handle_rptk(&frame, addr, now),
                    Command::Rptc => self.handle_rptc(&frame, addr, now),
                    Command::Rpto => self.handle_rpto(&frame, addr, now),
                    Command::Rptp => self.handle_rptp(frame.repeater_id, addr, now),
                    Command::Rptcl => self.handle_rptcl(frame.repeater_id, addr, now),
                    _ => unreachable!("narrowed by the outer match"),
                },
                Err(e) => {
                    warn!(peer = %addr, error = %e, "malformed command datagram");
                    // Best-effort NAK when the id field is intact.
                    if buf.len() >= 8 {
                        let id = RepeaterId::from_bytes(
                            buf[4..8].try_into().expect("length checked"),
                        );
                        self.try_send(addr, &build_mstnak(id));
                    }
                }
            },
            Some(cmd) => {
                debug!(peer = %addr, command = %cmd, "server-bound command from unknown peer");
            }
            None => {
                warn!(peer = %addr, len = buf.len(), "unknown command prefix");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection manager
    // -----------------------------------------------------------------------

    fn handle_rptl(&mut self, id: RepeaterId, addr: SocketAddr, now: Instant) {
        if self.reserved.contains_key(&id) {
            warn!(repeater = %id, peer = %addr, "login rejected: id reserved by outbound link");
            self.try_send(addr, &build_mstnak(id));
            return;
        }

        let decision = evaluate(
            &self.cfg.blacklist,
            &self.cfg.patterns,
            self.cfg.default_config.as_ref(),
            id,
            None,
        );
        let accepted = match decision {
            AccessDecision::Blacklisted { rule_name, reason } => {
                warn!(repeater = %id, rule = %rule_name, reason = %reason, "login rejected: blacklisted");
                None
            }
            AccessDecision::Disabled { pattern_name } => {
                warn!(repeater = %id, pattern = %pattern_name, "login rejected: pattern disabled");
                None
            }
            AccessDecision::NoMatch => {
                warn!(repeater = %id, "login rejected: no matching configuration");
                None
            }
            AccessDecision::Matched {
                pattern_name,
                config,
            } => Some((pattern_name.to_owned(), config.passphrase.clone())),
        };
        let Some((pattern_name, passphrase)) = accepted else {
            self.try_send(addr, &build_mstnak(id));
            return;
        };

        // A login from an already-known repeater is a restart: tear the old
        // state down first.
        if self.repeaters.contains_key(&id) {
            debug!(repeater = %id, "re-login; discarding previous state");
            self.remove_repeater(id, "re-login", now, false);
        }

        let salt: [u8; 4] = rand::random();
        self.repeaters.insert(
            id,
            Repeater::new(id, addr, salt, passphrase, pattern_name.clone(), now),
        );
        self.try_send(addr, &build_mstcl(id, salt));
        info!(repeater = %id, peer = %addr, pattern = %pattern_name, "login challenge sent");
        debug!(repeater = %id, salt = %hex::encode(salt), "challenge salt");
    }

    fn handle_rptk(&mut self, frame: &CommandFrame<'_>, addr: SocketAddr, now: Instant) {
        let id = frame.repeater_id;
        enum Outcome {
            Unknown,
            Spoofed,
            StateMismatch,
            Accepted,
            Rejected,
        }
        let outcome = match self.repeaters.get_mut(&id) {
            None => Outcome::Unknown,
            Some(rep) if rep.addr != addr => Outcome::Spoofed,
            Some(rep) if rep.phase != Phase::Login => Outcome::StateMismatch,
            Some(rep) => {
                let expected = auth_digest(rep.salt, &rep.passphrase);
                if digest_matches(&expected, frame.payload) {
                    rep.phase = Phase::Config;
                    rep.last_ping = now;
                    Outcome::Accepted
                } else {
                    Outcome::Rejected
                }
            }
        };
        match outcome {
            Outcome::Unknown | Outcome::StateMismatch => {
                warn!(repeater = %id, "RPTK outside login phase");
                self.try_send(addr, &build_mstnak(id));
            }
            Outcome::Spoofed => {
                warn!(repeater = %id, peer = %addr, "RPTK from wrong address; dropped");
            }
            Outcome::Accepted => {
                info!(repeater = %id, "authenticated");
                self.try_send(addr, &build_rptack(id));
            }
            Outcome::Rejected => {
                warn!(repeater = %id, "authentication failed; removing");
                self.repeaters.remove(&id);
                self.try_send(addr, &build_mstnak(id));
            }
        }
    }

    fn handle_rptc(&mut self, frame: &CommandFrame<'_>, addr: SocketAddr, now: Instant) {
        let id = frame.repeater_id;
        let meta = match RptcPayload::parse(frame.payload) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(repeater = %id, error = %e, "bad RPTC payload");
                self.try_send(addr, &build_mstnak(id));
                return;
            }
        };

        enum Outcome {
            Nak,
            Drop,
            RemoveNak(String),
            Accepted { callsign: String },
        }
        let outcome = match self.repeaters.get_mut(&id) {
            None => Outcome::Nak,
            Some(rep) if rep.addr != addr => Outcome::Drop,
            Some(rep) if rep.phase != Phase::Config => Outcome::Nak,
            Some(rep) => {
                // Full evaluation now that the callsign is known: callsign
                // globs and callsign blacklist entries become effective, and
                // the matched pattern's policy is authoritative.
                match evaluate(
                    &self.cfg.blacklist,
                    &self.cfg.patterns,
                    self.cfg.default_config.as_ref(),
                    id,
                    Some(&meta.callsign),
                ) {
                    AccessDecision::Blacklisted { rule_name, reason } => Outcome::RemoveNak(
                        format!("blacklisted by {rule_name}: {reason}"),
                    ),
                    AccessDecision::Disabled { pattern_name } => {
                        Outcome::RemoveNak(format!("pattern {pattern_name} disabled"))
                    }
                    AccessDecision::NoMatch => {
                        Outcome::RemoveNak("no matching configuration".to_owned())
                    }
                    AccessDecision::Matched {
                        pattern_name,
                        config,
                    } => {
                        rep.configured_slot1 = config.slot1_talkgroups.clone();
                        rep.configured_slot2 = config.slot2_talkgroups.clone();
                        rep.slot1_talkgroups = config.slot1_talkgroups.clone();
                        rep.slot2_talkgroups = config.slot2_talkgroups.clone();
                        rep.pattern_name = pattern_name.to_owned();
                        rep.metadata = Some(meta.clone());
                        rep.phase = Phase::Connected;
                        rep.last_ping = now;
                        Outcome::Accepted {
                            callsign: meta.callsign.clone(),
                        }
                    }
                }
            }
        };
        match outcome {
            Outcome::Nak => {
                warn!(repeater = %id, "RPTC outside config phase");
                self.try_send(addr, &build_mstnak(id));
            }
            Outcome::Drop => {
                warn!(repeater = %id, peer = %addr, "RPTC from wrong address; dropped");
            }
            Outcome::RemoveNak(reason) => {
                warn!(repeater = %id, reason = %reason, "configuration rejected");
                self.remove_repeater(id, &reason, now, false);
                self.try_send(addr, &build_mstnak(id));
            }
            Outcome::Accepted { callsign } => {
                info!(repeater = %id, callsign = %callsign, peer = %addr, "connected");
                self.try_send(addr, &build_rptack(id));
                self.emitter.emit(DashboardEvent::RepeaterConnected {
                    repeater_id: id.0,
                    callsign: callsign.clone(),
                    address: addr.to_string(),
                    timestamp: now_rfc3339(),
                });
                self.emitter.emit(DashboardEvent::RepeaterDetails {
                    repeater_id: id.0,
                    callsign,
                    location: meta.location.clone(),
                    description: meta.description.clone(),
                    rx_freq: meta.rx_freq.clone(),
                    tx_freq: meta.tx_freq.clone(),
                    color_code: meta.color_code.clone(),
                    slots: meta.slots.clone(),
                    software_id: meta.software_id.clone(),
                    url: meta.url.clone(),
                    timestamp: now_rfc3339(),
                });
            }
        }
    }

    fn handle_rpto(&mut self, frame: &CommandFrame<'_>, addr: SocketAddr, _now: Instant) {
        let id = frame.repeater_id;
        enum Outcome {
            Nak,
            Drop,
            Accepted,
        }
        let outcome = match self.repeaters.get_mut(&id) {
            None => Outcome::Nak,
            Some(rep) if rep.addr != addr => Outcome::Drop,
            Some(rep) if rep.phase != Phase::Connected => Outcome::Nak,
            Some(rep) => {
                let text = String::from_utf8_lossy(frame.payload);
                let request = parse_options(&text);
                rep.slot1_talkgroups = rep.configured_slot1.intersect(&request.ts1);
                rep.slot2_talkgroups = rep.configured_slot2.intersect(&request.ts2);
                rep.options_received = true;
                debug!(repeater = %id, options = %text, "options applied");
                Outcome::Accepted
            }
        };
        match outcome {
            Outcome::Nak => {
                warn!(repeater = %id, "RPTO from unconnected repeater");
                self.try_send(addr, &build_mstnak(id));
            }
            Outcome::Drop => {
                warn!(repeater = %id, peer = %addr, "RPTO from wrong address; dropped");
            }
            Outcome::Accepted => {
                self.try_send(addr, &build_rptack(id));
            }
        }
    }

    fn handle_rptp(&mut self, id: RepeaterId, addr: SocketAddr, now: Instant) {
        enum Outcome {
            Nak,
            Drop,
            Pong,
        }
        let outcome = match self.repeaters.get_mut(&id) {
            None => Outcome::Nak,
            Some(rep) if rep.addr != addr => Outcome::Drop,
            Some(rep) if rep.phase != Phase::Connected => Outcome::Nak,
            Some(rep) => {
                rep.last_ping = now;
                rep.missed_keepalives = 0;
                rep.keepalive_count += 1;
                Outcome::Pong
            }
        };
        match outcome {
            Outcome::Nak => {
                // NAK prompts the repeater to re-register.
                debug!(repeater = %id, "ping from unknown repeater");
                self.try_send(addr, &build_mstnak(id));
            }
            Outcome::Drop => {
                warn!(repeater = %id, peer = %addr, "ping from wrong address; dropped");
            }
            Outcome::Pong => {
                self.try_send(addr, &build_mstpong(id));
            }
        }
    }

    fn handle_rptcl(&mut self, id: RepeaterId, addr: SocketAddr, now: Instant) {
        match self.repeaters.get(&id) {
            Some(rep) if rep.addr == addr => {
                info!(repeater = %id, "closed by repeater");
                self.remove_repeater(id, "closed by repeater", now, true);
            }
            Some(_) => warn!(repeater = %id, peer = %addr, "RPTCL from wrong address; dropped"),
            None => debug!(repeater = %id, "RPTCL for unknown repeater"),
        }
    }

    /// Tear down one repeater: end its streams, scrub it from every routing
    /// cache and the user cache, optionally announce the disconnect.
    fn remove_repeater(&mut self, id: RepeaterId, reason: &str, now: Instant, announce: bool) {
        let Some(mut rep) = self.repeaters.remove(&id) else {
            return;
        };
        for entry in &mut rep.slots {
            if let Some(stream) = entry {
                if !stream.ended && !stream.is_assumed {
                    stream.end(now);
                    self.emitter.emit(stream_end_event(id, stream, EndReason::Timeout, &self.cfg));
                }
            }
            *entry = None;
        }
        self.displace_target(id);
        self.users.forget_repeater(id);
        if announce {
            self.emitter.emit(DashboardEvent::RepeaterDisconnected {
                repeater_id: id.0,
                reason: reason.to_owned(),
                timestamp: now_rfc3339(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Stream engine
    // -----------------------------------------------------------------------

    fn handle_dmrd(&mut self, buf: &[u8], addr: SocketAddr, now: Instant) {
        let dmrd = match Dmrd::parse(buf) {
            Ok(dmrd) => dmrd,
            Err(e) => {
                warn!(peer = %addr, error = %e, "bad DMRD datagram");
                return;
            }
        };

        let src_id = match self.repeaters.get(&dmrd.repeater_id) {
            Some(rep) if rep.addr != addr => {
                warn!(repeater = %dmrd.repeater_id, peer = %addr, "DMRD from wrong address; dropped");
                return;
            }
            Some(rep) if rep.phase == Phase::Connected => dmrd.repeater_id,
            Some(_) => {
                debug!(repeater = %dmrd.repeater_id, "DMRD before connection complete; dropped");
                return;
            }
            None => {
                debug!(repeater = %dmrd.repeater_id, peer = %addr, "DMRD from unknown repeater");
                self.try_send(addr, &build_mstnak(dmrd.repeater_id));
                return;
            }
        };
        self.dispatch_dmrd(src_id, &dmrd, buf, now);
    }

    /// Shared data path for repeater- and link-sourced DMRD.
    fn dispatch_dmrd(&mut self, src_id: RepeaterId, dmrd: &Dmrd, buf: &[u8], now: Instant) {
        self.stats.dmrd_received += 1;
        let slot = dmrd.slot();
        let disposition = classify_packet(
            self.peer_slot(src_id, slot),
            dmrd,
            now,
            self.cfg.global.stream_active_threshold,
            self.cfg.global.stream_hang_time,
        );

        match disposition {
            Disposition::Continuation { terminator } => {
                if let Some(Some(stream)) = self.peer_slot_entry(src_id, slot).map(Option::as_mut)
                {
                    stream.touch(now);
                }
                if terminator {
                    self.end_stream(src_id, slot, EndReason::Terminator, now);
                } else {
                    self.forward_packet(src_id, slot, dmrd, buf, now);
                }
            }
            Disposition::Contention => {
                debug!(
                    repeater = %src_id, %slot, stream_id = dmrd.stream_id,
                    "contention: slot busy with another stream; packet dropped"
                );
                self.stats.dropped += 1;
            }
            Disposition::HangDenied => {
                warn!(
                    repeater = %src_id, %slot, rf_src = dmrd.rf_src, dst_id = dmrd.dst_id,
                    "hang-time hijack denied; packet dropped"
                );
                self.stats.dropped += 1;
            }
            Disposition::DisplaceAssumed => {
                // Real reception beats our forwarding: this repeater stops
                // being a target anywhere, its marker goes away, and the new
                // stream starts.
                self.displace_target(src_id);
                if let Some(entry) = self.peer_slot_entry(src_id, slot) {
                    *entry = None;
                }
                self.start_stream(src_id, dmrd, buf, now);
            }
            Disposition::FastTerminator => {
                self.end_stream(src_id, slot, EndReason::FastTerminator, now);
                self.start_stream(src_id, dmrd, buf, now);
            }
            Disposition::StartNew | Disposition::HangAllowed => {
                self.start_stream(src_id, dmrd, buf, now);
            }
        }
    }

    fn start_stream(&mut self, src_id: RepeaterId, dmrd: &Dmrd, buf: &[u8], now: Instant) {
        if dmrd.is_terminator() {
            debug!(repeater = %src_id, stream_id = dmrd.stream_id, "lone terminator ignored");
            return;
        }
        let slot = dmrd.slot();
        let tgid = dmrd.dst_id;

        if dmrd.call_type() == CallType::Group {
            let permitted = self
                .peer_policy(src_id, slot)
                .is_some_and(|p| p.permits(tgid));
            if !permitted {
                warn!(
                    repeater = %src_id, %slot, tgid,
                    "talkgroup not permitted on this slot; packet dropped"
                );
                self.stats.dropped += 1;
                return;
            }
        }

        let targets = match dmrd.call_type() {
            CallType::Group => self.group_targets(src_id, slot, tgid),
            CallType::Private => self.private_target(src_id, slot, tgid, now),
        };

        let mut stream = StreamState::new_inbound(dmrd, now);
        stream.target_repeaters = targets;
        stream.routing_cached = true;

        self.users.touch(dmrd.rf_src, src_id, slot, now);
        info!(
            repeater = %src_id, %slot, stream_id = format_args!("{:08x}", dmrd.stream_id),
            rf_src = dmrd.rf_src, dst_id = tgid, targets = stream.target_repeaters.len(),
            "stream start"
        );
        self.emitter.emit(DashboardEvent::StreamStart {
            repeater_id: src_id.0,
            slot: slot.number(),
            stream_id: dmrd.stream_id,
            rf_src: dmrd.rf_src,
            dst_id: tgid,
            call_type: match dmrd.call_type() {
                CallType::Group => "group".to_owned(),
                CallType::Private => "private".to_owned(),
            },
            timestamp: now_rfc3339(),
        });

        if let Some(entry) = self.peer_slot_entry(src_id, slot) {
            *entry = Some(stream);
        }
        self.forward_packet(src_id, slot, dmrd, buf, now);
    }

    fn end_stream(&mut self, peer_id: RepeaterId, slot: Slot, reason: EndReason, now: Instant) {
        let (stream_id, rf_src, dst_id, duration, packet_count) = {
            let Some(Some(stream)) = self.peer_slot_entry(peer_id, slot).map(Option::as_mut)
            else {
                return;
            };
            if stream.ended {
                return;
            }
            stream.end(now);
            if stream.is_assumed {
                return;
            }
            (
                stream.stream_id,
                stream.rf_src,
                stream.dst_id,
                stream.duration(),
                stream.packet_count,
            )
        };
        info!(
            repeater = %peer_id, %slot, stream_id = format_args!("{stream_id:08x}"),
            packets = packet_count, duration_secs = duration.as_secs_f64(),
            reason = reason.as_str(), "stream end"
        );
        self.emitter.emit(DashboardEvent::StreamEnd {
            repeater_id: peer_id.0,
            slot: slot.number(),
            stream_id,
            rf_src,
            dst_id,
            duration_secs: duration.as_secs_f64(),
            packet_count,
            reason: reason.as_str().to_owned(),
            hang_time_secs: self.cfg.global.stream_hang_time.as_secs_f64(),
            timestamp: now_rfc3339(),
        });
    }

    fn forward_packet(
        &mut self,
        src_id: RepeaterId,
        slot: Slot,
        dmrd: &Dmrd,
        buf: &[u8],
        now: Instant,
    ) {
        let targets: Vec<RepeaterId> = match self.peer_slot(src_id, slot) {
            Some(stream) => stream.target_repeaters.iter().copied().collect(),
            None => return,
        };
        if targets.is_empty() {
            return;
        }
        let mut out = [0u8; DMRD_LEN];
        out.copy_from_slice(buf);
        for target in targets {
            let admitted = match self.peer_slot_entry(target, slot) {
                Some(entry) => admit_forward(entry, dmrd, now),
                None => false,
            };
            if !admitted {
                continue;
            }
            let Some((addr, wire_id)) = self.peer_send_info(target) else {
                continue;
            };
            rewrite_repeater_id(&mut out, wire_id);
            self.try_send(addr, &out);
            self.stats.forwarded += 1;
        }
    }

    /// Real-RX-wins: remove `target` from every stream's cached target set.
    /// O(peers × slots); fine for the ≤100-repeater deployments this serves.
    fn displace_target(&mut self, target: RepeaterId) {
        for rep in self.repeaters.values_mut() {
            for entry in rep.slots.iter_mut().flatten() {
                entry.target_repeaters.remove(&target);
            }
        }
        for link in &mut self.links {
            for entry in link.slots.iter_mut().flatten() {
                entry.target_repeaters.remove(&target);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    fn group_targets(&self, src_id: RepeaterId, slot: Slot, tgid: u32) -> std::collections::HashSet<RepeaterId> {
        let repeater_candidates = self
            .repeaters
            .values()
            .filter(|r| r.phase == Phase::Connected && r.id != src_id)
            .map(|r| TargetCandidate {
                id: r.id,
                policy: r.policy(slot),
                slot_stream: r.slot(slot),
            });
        let link_candidates = self
            .links
            .iter()
            .filter(|l| l.is_connected() && l.cfg.our_id != src_id)
            .map(|l| TargetCandidate {
                id: l.cfg.our_id,
                policy: l.policy(slot),
                slot_stream: l.slot(slot),
            });
        compute_group_targets(repeater_candidates.chain(link_candidates), tgid)
    }

    /// Private call: the single repeater last heard carrying the subscriber,
    /// subject to the same slot policy and availability rules.
    fn private_target(
        &self,
        src_id: RepeaterId,
        slot: Slot,
        dst_id: u32,
        now: Instant,
    ) -> std::collections::HashSet<RepeaterId> {
        let mut targets = std::collections::HashSet::new();
        let Some(entry) = self.users.lookup(dst_id, now) else {
            debug!(dst_id, "private call to unknown subscriber; no targets");
            return targets;
        };
        if entry.repeater_id == src_id {
            return targets;
        }
        let eligible = self
            .peer_policy(entry.repeater_id, slot)
            .is_some_and(|p| p.permits(dst_id))
            && slot_available(self.peer_slot(entry.repeater_id, slot));
        if eligible {
            targets.insert(entry.repeater_id);
        }
        targets
    }

    // -----------------------------------------------------------------------
    // Peer accessors (repeaters and outbound links share the id space)
    // -----------------------------------------------------------------------

    fn peer_slot(&self, id: RepeaterId, slot: Slot) -> Option<&StreamState> {
        if let Some(rep) = self.repeaters.get(&id) {
            return rep.slot(slot);
        }
        self.reserved
            .get(&id)
            .and_then(|&i| self.links[i].slot(slot))
    }

    fn peer_slot_entry(&mut self, id: RepeaterId, slot: Slot) -> Option<&mut Option<StreamState>> {
        if let Some(rep) = self.repeaters.get_mut(&id) {
            return Some(rep.slot_mut(slot));
        }
        match self.reserved.get(&id) {
            Some(&i) => Some(self.links[i].slot_mut(slot)),
            None => None,
        }
    }

    fn peer_policy(&self, id: RepeaterId, slot: Slot) -> Option<&crate::access::TalkgroupPolicy> {
        if let Some(rep) = self.repeaters.get(&id) {
            return Some(rep.policy(slot));
        }
        self.reserved.get(&id).map(|&i| self.links[i].policy(slot))
    }

    /// Where to send a forwarded packet for this peer, and the id to stamp
    /// into it (outbound links present their configured id).
    fn peer_send_info(&self, id: RepeaterId) -> Option<(SocketAddr, RepeaterId)> {
        if let Some(rep) = self.repeaters.get(&id) {
            if rep.phase == Phase::Connected {
                return Some((rep.addr, rep.id));
            }
            return None;
        }
        let &i = self.reserved.get(&id)?;
        let link = &self.links[i];
        if link.is_connected() {
            link.remote.map(|addr| (addr, link.cfg.our_id))
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Outbound links
    // -----------------------------------------------------------------------

    fn handle_link_datagram(&mut self, idx: usize, buf: &[u8], addr: SocketAddr, now: Instant) {
        match classify(buf) {
            Some(Command::Dmrd) => {
                if !self.links[idx].is_connected() {
                    debug!(link = %self.links[idx].cfg.name, "DMRD before link connected; dropped");
                    return;
                }
                let dmrd = match Dmrd::parse(buf) {
                    Ok(dmrd) => dmrd,
                    Err(e) => {
                        warn!(link = %self.links[idx].cfg.name, error = %e, "bad DMRD from link");
                        return;
                    }
                };
                let src_id = self.links[idx].cfg.our_id;
                self.dispatch_dmrd(src_id, &dmrd, buf, now);
            }
            Some(cmd) => {
                let frame = match parse_frame(buf) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(link = %self.links[idx].cfg.name, error = %e, "malformed datagram from link");
                        return;
                    }
                };
                self.handle_link_command(idx, cmd, &frame, addr, now);
            }
            None => {
                warn!(link = %self.links[idx].cfg.name, "unknown command prefix from link");
            }
        }
    }

    fn handle_link_command(
        &mut self,
        idx: usize,
        cmd: Command,
        frame: &CommandFrame<'_>,
        addr: SocketAddr,
        now: Instant,
    ) {
        let our_id = self.links[idx].cfg.our_id;
        let name = self.links[idx].cfg.name.clone();
        match cmd {
            Command::Mstcl => {
                // The remote's login challenge: answer with the salted digest.
                if !matches!(self.links[idx].phase, LinkPhase::LoginSent { .. }) {
                    debug!(link = %name, "unexpected challenge; ignoring");
                    return;
                }
                let salt: [u8; 4] = frame.payload.try_into().expect("length enforced by parser");
                let digest = auth_digest(salt, &self.links[idx].cfg.password);
                self.try_send(addr, &build_rptk(our_id, &digest));
                self.links[idx].phase = LinkPhase::AuthSent { since: now };
                debug!(link = %name, "challenge answered");
            }
            Command::Rptack => match self.links[idx].phase {
                LinkPhase::AuthSent { .. } => {
                    let rptc = build_rptc(our_id, &self.links[idx].rptc_payload());
                    self.try_send(addr, &rptc);
                    self.links[idx].phase = LinkPhase::ConfigSent { since: now };
                    debug!(link = %name, "authenticated; configuration sent");
                }
                LinkPhase::ConfigSent { .. } => {
                    if let Some(options) = self.links[idx].cfg.options.clone() {
                        self.try_send(addr, &build_rpto(our_id, &options));
                    }
                    self.links[idx].phase = LinkPhase::Connected;
                    self.links[idx].last_pong = now;
                    self.links[idx].last_ping_sent = now;
                    info!(link = %name, remote = %addr, "outbound link connected");
                    self.emitter.emit(DashboardEvent::OutboundConnected {
                        name,
                        remote: addr.to_string(),
                        our_id: our_id.0,
                        timestamp: now_rfc3339(),
                    });
                }
                // Acks for RPTO or pings while connected.
                LinkPhase::Connected => {}
                _ => debug!(link = %name, "unexpected RPTACK; ignoring"),
            },
            Command::Mstpong => {
                self.links[idx].last_pong = now;
            }
            Command::Mstnak => {
                let was_connected = self.links[idx].is_connected();
                warn!(link = %name, "remote refused us (MSTNAK)");
                self.emitter.emit(DashboardEvent::OutboundError {
                    name: name.clone(),
                    error: "remote replied MSTNAK".to_owned(),
                    timestamp: now_rfc3339(),
                });
                if was_connected {
                    self.emitter.emit(DashboardEvent::OutboundDisconnected {
                        name,
                        reason: "remote replied MSTNAK".to_owned(),
                        timestamp: now_rfc3339(),
                    });
                }
                self.links[idx].disconnect(now + self.cfg.global.ping_time);
            }
            Command::Rptcl => {
                info!(link = %name, "remote closed the link");
                if self.links[idx].is_connected() {
                    self.emitter.emit(DashboardEvent::OutboundDisconnected {
                        name,
                        reason: "closed by remote".to_owned(),
                        timestamp: now_rfc3339(),
                    });
                }
                self.links[idx].disconnect(now + self.cfg.global.ping_time);
            }
            other => {
                debug!(link = %name, command = %other, "unhandled command from link");
            }
        }
    }

    async fn tick_outbound(&mut self, now: Instant) {
        for i in 0..self.links.len() {
            match self.links[i].phase {
                LinkPhase::Disconnected { retry_at } => {
                    if now >= retry_at {
                        self.link_connect(i, now).await;
                    }
                }
                LinkPhase::LoginSent { .. }
                | LinkPhase::AuthSent { .. }
                | LinkPhase::ConfigSent { .. } => {
                    let limit = self.cfg.global.ping_time * self.cfg.global.max_missed;
                    if self.links[i].handshake_age(now).is_some_and(|age| age > limit) {
                        let name = self.links[i].cfg.name.clone();
                        warn!(link = %name, "handshake timed out; will retry");
                        self.emitter.emit(DashboardEvent::OutboundError {
                            name,
                            error: "handshake timed out".to_owned(),
                            timestamp: now_rfc3339(),
                        });
                        self.links[i].disconnect(now + self.cfg.global.ping_time);
                    }
                }
                LinkPhase::Connected => {
                    let deadline = self.cfg.global.ping_time * self.cfg.global.max_missed;
                    if now.duration_since(self.links[i].last_pong) > deadline {
                        let name = self.links[i].cfg.name.clone();
                        warn!(link = %name, "keepalive lost; reconnecting");
                        self.emitter.emit(DashboardEvent::OutboundDisconnected {
                            name,
                            reason: "keepalive lost".to_owned(),
                            timestamp: now_rfc3339(),
                        });
                        self.links[i].disconnect(now + self.cfg.global.ping_time);
                    } else if let Some(addr) = self.links[i].remote {
                        let our_id = self.links[i].cfg.our_id;
                        self.try_send(addr, &build_rptping(our_id));
                        self.links[i].last_ping_sent = now;
                    }
                }
            }
        }
    }

    async fn link_connect(&mut self, idx: usize, now: Instant) {
        let address = self.links[idx].cfg.address.clone();
        let port = self.links[idx].cfg.port;
        let name = self.links[idx].cfg.name.clone();
        let our_id = self.links[idx].cfg.our_id;

        let resolved = tokio::net::lookup_host((address.as_str(), port)).await;
        let addr = match resolved {
            Ok(addrs) => {
                let usable =
                    addrs.into_iter().find(|a| a.is_ipv4() || self.sock_v6.is_some());
                match usable {
                    Some(addr) => addr,
                    None => {
                        warn!(link = %name, "no usable address for link (IPv6 disabled?)");
                        self.emitter.emit(DashboardEvent::OutboundError {
                            name,
                            error: "no usable address".to_owned(),
                            timestamp: now_rfc3339(),
                        });
                        self.links[idx].disconnect(now + self.cfg.global.ping_time);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(link = %name, error = %e, "DNS resolution failed; will retry");
                self.emitter.emit(DashboardEvent::OutboundError {
                    name,
                    error: format!("DNS resolution failed: {e}"),
                    timestamp: now_rfc3339(),
                });
                self.links[idx].disconnect(now + self.cfg.global.ping_time);
                return;
            }
        };

        if let Some(old) = self.links[idx].remote {
            if old != addr {
                self.link_by_addr.remove(&old);
            }
        }
        self.link_by_addr.insert(addr, idx);
        self.links[idx].remote = Some(addr);
        self.try_send(addr, &build_rptl(our_id));
        self.links[idx].phase = LinkPhase::LoginSent { since: now };
        debug!(link = %name, remote = %addr, "login sent");
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    fn tick_streams(&mut self, now: Instant) {
        let timeout = self.cfg.global.stream_timeout;
        let hang = self.cfg.global.stream_hang_time;

        let mut timeouts: Vec<(RepeaterId, Slot)> = Vec::new();
        let mut expiries: Vec<(RepeaterId, Slot, u32, bool)> = Vec::new();
        let mut updates: Vec<DashboardEvent> = Vec::new();

        let mut inspect = |peer_id: RepeaterId, slot: Slot, stream: &StreamState| {
            if !stream.ended && now.duration_since(stream.last_packet_time) > timeout {
                timeouts.push((peer_id, slot));
            } else if stream.ended && stream.hang_expired(now, hang) {
                expiries.push((peer_id, slot, stream.stream_id, stream.is_assumed));
            } else if !stream.ended && !stream.is_assumed {
                updates.push(DashboardEvent::StreamUpdate {
                    repeater_id: peer_id.0,
                    slot: slot.number(),
                    stream_id: stream.stream_id,
                    rf_src: stream.rf_src,
                    dst_id: stream.dst_id,
                    packet_count: stream.packet_count,
                    duration_secs: now.duration_since(stream.start_time).as_secs_f64(),
                });
            }
        };
        for rep in self.repeaters.values() {
            for slot in [Slot::S1, Slot::S2] {
                if let Some(stream) = rep.slot(slot) {
                    inspect(rep.id, slot, stream);
                }
            }
        }
        for link in &self.links {
            for slot in [Slot::S1, Slot::S2] {
                if let Some(stream) = link.slot(slot) {
                    inspect(link.cfg.our_id, slot, stream);
                }
            }
        }

        for (peer_id, slot) in timeouts {
            self.end_stream(peer_id, slot, EndReason::Timeout, now);
        }
        for (peer_id, slot, stream_id, is_assumed) in expiries {
            if let Some(entry) = self.peer_slot_entry(peer_id, slot) {
                *entry = None;
            }
            if !is_assumed {
                debug!(repeater = %peer_id, %slot, stream_id = format_args!("{stream_id:08x}"), "hang time expired");
                self.emitter.emit(DashboardEvent::HangTimeExpired {
                    repeater_id: peer_id.0,
                    slot: slot.number(),
                    stream_id,
                });
            }
        }
        for update in updates {
            self.emitter.emit(update);
        }
    }

    fn tick_keepalive(&mut self, now: Instant) {
        let ping_time = self.cfg.global.ping_time;
        let max_missed = self.cfg.global.max_missed;
        let mut evict: Vec<RepeaterId> = Vec::new();
        for rep in self.repeaters.values_mut() {
            if now.duration_since(rep.last_ping) > ping_time * (rep.missed_keepalives + 1) {
                rep.missed_keepalives += 1;
                if rep.missed_keepalives >= max_missed {
                    evict.push(rep.id);
                } else {
                    debug!(
                        repeater = %rep.id, missed = rep.missed_keepalives,
                        "keepalive missed"
                    );
                }
            }
        }
        for id in evict {
            warn!(repeater = %id, "keepalive lost; evicting");
            self.remove_repeater(id, "keepalive lost", now, true);
        }
    }

    fn tick_minute(&mut self, now: Instant) {
        let purged = self.users.sweep(now);
        if purged > 0 {
            debug!(purged, "user cache entries expired");
        }
        let active_streams = self
            .repeaters
            .values()
            .flat_map(|r| r.slots.iter())
            .chain(self.links.iter().flat_map(|l| l.slots.iter()))
            .filter(|s| s.as_ref().is_some_and(|s| !s.ended && !s.is_assumed))
            .count();
        info!(
            repeaters = self.repeaters.len(),
            links_connected = self.links.iter().filter(|l| l.is_connected()).count(),
            active_streams,
            users_cached = self.users.len(),
            dmrd_received = self.stats.dmrd_received,
            forwarded = self.stats.forwarded,
            dropped = self.stats.dropped,
            "periodic stats"
        );
        self.stats = Stats::default();
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    fn drain(&mut self, now: Instant) {
        info!("draining: closing streams and links");
        let peer_ids: Vec<RepeaterId> = self
            .repeaters
            .keys()
            .copied()
            .chain(self.links.iter().map(|l| l.cfg.our_id))
            .collect();
        for peer_id in peer_ids {
            for slot in [Slot::S1, Slot::S2] {
                self.end_stream(peer_id, slot, EndReason::Timeout, now);
            }
        }
        for i in 0..self.links.len() {
            if self.links[i].is_connected() {
                let name = self.links[i].cfg.name.clone();
                let our_id = self.links[i].cfg.our_id;
                if let Some(addr) = self.links[i].remote {
                    self.try_send(addr, &build_rptcl(our_id));
                }
                self.emitter.emit(DashboardEvent::OutboundDisconnected {
                    name,
                    reason: "shutdown".to_owned(),
                    timestamp: now_rfc3339(),
                });
            }
        }
        info!("shutdown drain complete");
    }

    // -----------------------------------------------------------------------
    // Socket helpers
    // -----------------------------------------------------------------------

    fn try_send(&self, addr: SocketAddr, buf: &[u8]) {
        let sock = if addr.is_ipv4() {
            Some(&self.sock_v4)
        } else {
            self.sock_v6.as_ref()
        };
        let Some(sock) = sock else {
            debug!(peer = %addr, "no socket for address family; dropped");
            return;
        };
        match sock.try_send_to(buf, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(peer = %addr, "send buffer full; packet dropped");
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, "send failed");
            }
        }
    }
}

fn stream_end_event(
    peer_id: RepeaterId,
    stream: &StreamState,
    reason: EndReason,
    cfg: &Config,
) -> DashboardEvent {
    DashboardEvent::StreamEnd {
        repeater_id: peer_id.0,
        slot: stream.slot.number(),
        stream_id: stream.stream_id,
        rf_src: stream.rf_src,
        dst_id: stream.dst_id,
        duration_secs: stream.duration().as_secs_f64(),
        packet_count: stream.packet_count,
        reason: reason.as_str().to_owned(),
        hang_time_secs: cfg.global.stream_hang_time.as_secs_f64(),
        timestamp: now_rfc3339(),
    }
}

async fn recv_or_pending(
    sock: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TalkgroupPolicy;
    use crate::config::load_config_from_str;
    use std::time::Duration;

    const TEST_CONFIG: &str = r#"
        [global]
        bind_ipv4 = "127.0.0.1"
        port_ipv4 = 0
        disable_ipv6 = true

        [[blacklist.patterns]]
        name = "stolen"
        reason = "ID reported stolen"
        [blacklist.patterns.match]
        ids = [312666]

        [[repeater_configurations.patterns]]
        name = "club"
        [repeater_configurations.patterns.match]
        id_ranges = [[312000, 312999]]
        [repeater_configurations.patterns.config]
        passphrase = "secret"
        slot1_talkgroups = [1, 2, 3, 4, 5]
        slot2_talkgroups = [3120]

        [repeater_configurations.default]
        passphrase = "defaultpass"
    "#;

    async fn test_master(toml: &str) -> Master {
        let cfg = load_config_from_str(toml).unwrap();
        Master::bind(cfg, EventEmitter::disabled()).await.unwrap()
    }

    fn peer_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Drive the full RPTL -> RPTK -> RPTC handshake through the handlers.
    fn connect_repeater(master: &mut Master, id: u32, port: u16, now: Instant) {
        let id = RepeaterId(id);
        let addr = peer_addr(port);
        master.handle_rptl(id, addr, now);
        let rep = master.repeaters.get(&id).expect("login accepted");
        assert_eq!(rep.phase, Phase::Login);
        let digest = auth_digest(rep.salt, &rep.passphrase.clone());

        let rptk = build_rptk(id, &digest);
        master.handle_rptk(&parse_frame(&rptk).unwrap(), addr, now);
        assert_eq!(master.repeaters[&id].phase, Phase::Config);

        let rptc = build_rptc(
            id,
            &RptcPayload {
                callsign: format!("VE3T{:02}", port % 100),
                ..RptcPayload::default()
            },
        );
        master.handle_rptc(&parse_frame(&rptc).unwrap(), addr, now);
        assert_eq!(master.repeaters[&id].phase, Phase::Connected);
    }

    fn dmrd_bytes(
        repeater: u32,
        rf_src: u32,
        dst_id: u32,
        stream_id: u32,
        slot2: bool,
        terminator: bool,
    ) -> Vec<u8> {
        let control = (u8::from(slot2) << 7)
            | 0x40
            | if terminator { 0x22 } else { 0x00 };
        Dmrd {
            sequence: 1,
            rf_src,
            dst_id,
            repeater_id: RepeaterId(repeater),
            control,
            stream_id,
            payload: [0xA5; 33],
        }
        .to_bytes()
        .to_vec()
    }

    fn private_dmrd_bytes(
        repeater: u32,
        rf_src: u32,
        dst_id: u32,
        stream_id: u32,
        slot2: bool,
    ) -> Vec<u8> {
        let mut bytes = dmrd_bytes(repeater, rf_src, dst_id, stream_id, slot2, false);
        // clear the group bit
        bytes[15] &= !0x40;
        bytes
    }

    #[tokio::test]
    async fn handshake_walks_login_config_connected() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_001, 41001, now);
        let rep = &master.repeaters[&RepeaterId(312_001)];
        assert_eq!(rep.pattern_name, "club");
        assert!(rep.policy(Slot::S2).permits(3120));
        assert!(!rep.policy(Slot::S2).permits(9));
    }

    #[tokio::test]
    async fn blacklisted_id_gets_no_state() {
        let mut master = test_master(TEST_CONFIG).await;
        master.handle_rptl(RepeaterId(312_666), peer_addr(41002), Instant::now());
        assert!(master.repeaters.is_empty());
    }

    #[tokio::test]
    async fn wrong_auth_digest_removes_state() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        let id = RepeaterId(312_002);
        let addr = peer_addr(41003);
        master.handle_rptl(id, addr, now);
        let rptk = build_rptk(id, &[0u8; 32]);
        master.handle_rptk(&parse_frame(&rptk).unwrap(), addr, now);
        assert!(master.repeaters.is_empty());
    }

    #[tokio::test]
    async fn reserved_link_id_cannot_log_in() {
        let toml = format!(
            "{TEST_CONFIG}\n\
            [[outbound_connections]]\n\
            name = \"up\"\n\
            address = \"127.0.0.1\"\n\
            port = 62031\n\
            our_id = 312100\n\
            password = \"x\"\n"
        );
        let mut master = test_master(&toml).await;
        master.handle_rptl(RepeaterId(312_100), peer_addr(41004), Instant::now());
        assert!(master.repeaters.is_empty());
    }

    #[tokio::test]
    async fn rpto_intersects_against_configured_policy() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_003, 41005, now);
        let id = RepeaterId(312_003);

        let rpto = build_rpto(id, "TS1=1,2,3,91;TS2=");
        master.handle_rpto(&parse_frame(&rpto).unwrap(), peer_addr(41005), now);

        let rep = &master.repeaters[&id];
        assert!(rep.options_received);
        assert_eq!(
            rep.slot1_talkgroups,
            TalkgroupPolicy::List([1, 2, 3].into_iter().collect())
        );
        assert!(rep.slot2_talkgroups.is_deny_all());

        // A second RPTO intersects against the configured list, not the
        // previously narrowed one.
        let rpto = build_rpto(id, "TS1=4,5;TS2=*");
        master.handle_rpto(&parse_frame(&rpto).unwrap(), peer_addr(41005), now);
        let rep = &master.repeaters[&id];
        assert_eq!(
            rep.slot1_talkgroups,
            TalkgroupPolicy::List([4, 5].into_iter().collect())
        );
        assert_eq!(
            rep.slot2_talkgroups,
            TalkgroupPolicy::List([3120].into_iter().collect())
        );
    }

    #[tokio::test]
    async fn stream_counts_packets_and_ends_on_terminator() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_010, 41010, base);
        let id = RepeaterId(312_010);
        let addr = peer_addr(41010);

        for i in 0..50u64 {
            let pkt = dmrd_bytes(312_010, 3_121_234, 3120, 0xAABB_CCDD, true, false);
            master.handle_datagram(&pkt, addr, base + Duration::from_millis(60 * i));
        }
        let stream = master.repeaters[&id].slot(Slot::S2).expect("stream active");
        assert_eq!(stream.packet_count, 50);
        assert!(!stream.ended);
        assert!(stream.routing_cached);

        let term = dmrd_bytes(312_010, 3_121_234, 3120, 0xAABB_CCDD, true, true);
        master.handle_datagram(&term, addr, base + Duration::from_secs(3));
        let stream = master.repeaters[&id].slot(Slot::S2).expect("hang-time occupancy");
        assert!(stream.ended);
        assert_eq!(stream.packet_count, 51);
        assert!(stream.end_time.expect("ended") >= stream.start_time);
    }

    #[tokio::test]
    async fn denied_talkgroup_never_creates_a_stream() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_011, 41011, now);

        // 9 is not in the slot-2 policy {3120}
        let pkt = dmrd_bytes(312_011, 3_121_234, 9, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41011), now);
        assert!(master.repeaters[&RepeaterId(312_011)].slot(Slot::S2).is_none());
    }

    #[tokio::test]
    async fn hang_time_denies_hijack_and_allows_join() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_012, 41012, base);
        let id = RepeaterId(312_012);
        let addr = peer_addr(41012);

        let pkt = dmrd_bytes(312_012, 3_121_234, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, addr, base);
        let term = dmrd_bytes(312_012, 3_121_234, 3120, 0xAA, true, true);
        master.handle_datagram(&term, addr, base + Duration::from_millis(60));

        // Different user, different talkgroup, within hang time: hijack,
        // denied before the talkgroup policy is even consulted.
        let pkt = dmrd_bytes(312_012, 3_125_678, 9, 0xBB, true, false);
        master.handle_datagram(&pkt, addr, base + Duration::from_secs(5));
        let stream = master.repeaters[&id].slot(Slot::S2).expect("old stream retained");
        assert_eq!(stream.stream_id, 0xAA, "hijack must not replace the stream");

        // Different user, same talkgroup: join, new stream accepted.
        let pkt = dmrd_bytes(312_012, 3_125_678, 3120, 0xCC, true, false);
        master.handle_datagram(&pkt, addr, base + Duration::from_secs(6));
        let stream = master.repeaters[&id].slot(Slot::S2).expect("joined stream");
        assert_eq!(stream.stream_id, 0xCC);
        assert!(!stream.ended);
    }

    #[tokio::test]
    async fn contention_drops_rival_and_fast_terminates_stale() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_013, 41013, base);
        let id = RepeaterId(312_013);
        let addr = peer_addr(41013);

        let pkt = dmrd_bytes(312_013, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, addr, base);

        // Rival stream while the first is active (exactly at the boundary):
        // dropped.
        let rival = dmrd_bytes(312_013, 222, 3120, 0xBB, true, false);
        master.handle_datagram(&rival, addr, base + Duration::from_millis(200));
        assert_eq!(master.repeaters[&id].slot(Slot::S2).unwrap().stream_id, 0xAA);

        // Past the threshold the stale stream is fast-terminated and the
        // rival takes the slot.
        master.handle_datagram(&rival, addr, base + Duration::from_millis(201));
        let stream = master.repeaters[&id].slot(Slot::S2).unwrap();
        assert_eq!(stream.stream_id, 0xBB);
        assert!(!stream.ended);
    }

    #[tokio::test]
    async fn group_routing_caches_targets_and_plants_assumed_streams() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_020, 41020, now);
        connect_repeater(&mut master, 312_021, 41021, now);
        connect_repeater(&mut master, 312_022, 41022, now);

        let pkt = dmrd_bytes(312_020, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41020), now);

        let src = &master.repeaters[&RepeaterId(312_020)];
        let stream = src.slot(Slot::S2).unwrap();
        assert_eq!(
            stream.target_repeaters,
            [RepeaterId(312_021), RepeaterId(312_022)].into_iter().collect()
        );

        for target in [312_021, 312_022] {
            let marker = master.repeaters[&RepeaterId(target)]
                .slot(Slot::S2)
                .expect("assumed stream planted");
            assert!(marker.is_assumed);
            assert_eq!(marker.stream_id, 0xAA);
        }
    }

    #[tokio::test]
    async fn real_rx_wins_displaces_target_from_cached_sets() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_030, 41030, now);
        connect_repeater(&mut master, 312_031, 41031, now);
        connect_repeater(&mut master, 312_032, 41032, now);

        let pkt = dmrd_bytes(312_030, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41030), now);

        // Repeater Y (312_031) starts its own reception on the same slot.
        let rx = dmrd_bytes(312_031, 222, 3120, 0xBB, true, false);
        master.handle_datagram(&rx, peer_addr(41031), now + Duration::from_millis(60));

        let a_targets = &master.repeaters[&RepeaterId(312_030)]
            .slot(Slot::S2)
            .unwrap()
            .target_repeaters;
        assert_eq!(a_targets, &[RepeaterId(312_032)].into_iter().collect());

        let y_stream = master.repeaters[&RepeaterId(312_031)].slot(Slot::S2).unwrap();
        assert!(!y_stream.is_assumed, "real reception replaced the marker");
        assert_eq!(y_stream.stream_id, 0xBB);

        // Subsequent packets of stream A keep flowing only to Z.
        let pkt = dmrd_bytes(312_030, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41030), now + Duration::from_millis(120));
        let z_marker = master.repeaters[&RepeaterId(312_032)].slot(Slot::S2).unwrap();
        assert!(z_marker.is_assumed);
        assert_eq!(z_marker.packet_count, 2);
    }

    #[tokio::test]
    async fn private_call_routes_to_last_heard_repeater_only() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_040, 41040, now);
        connect_repeater(&mut master, 312_041, 41041, now);
        connect_repeater(&mut master, 312_042, 41042, now);

        // Subscriber 3_121_234 is heard on repeater X slot 1 (TG 1 permitted).
        let pkt = dmrd_bytes(312_040, 3_121_234, 1, 0xAA, false, false);
        master.handle_datagram(&pkt, peer_addr(41040), now);

        // Private call from Z to that subscriber on slot 1.
        let pvt = private_dmrd_bytes(312_042, 3_125_678, 3_121_234, 0xBB, false);
        master.handle_datagram(&pvt, peer_addr(41042), now + Duration::from_millis(300));

        let z_stream = master.repeaters[&RepeaterId(312_042)].slot(Slot::S1).unwrap();
        // Policy on slot 1 is {1..5}; the subscriber id is not in it, but
        // private calls are not subject to the talkgroup filter on intake.
        // Routing still requires the target slot policy to admit the id, so
        // with a restrictive list the call has no targets.
        assert!(z_stream.target_repeaters.is_empty());

        // With an allow-all default policy the private call reaches exactly
        // the last-heard repeater.
        let toml = r#"
            [global]
            bind_ipv4 = "127.0.0.1"
            port_ipv4 = 0
            disable_ipv6 = true
            [repeater_configurations.default]
            passphrase = "pass"
        "#;
        let mut master = test_master(toml).await;
        let now = Instant::now();
        connect_repeater(&mut master, 1, 42040, now);
        connect_repeater(&mut master, 2, 42041, now);
        connect_repeater(&mut master, 3, 42042, now);

        let pkt = dmrd_bytes(1, 3_121_234, 99, 0xAA, false, false);
        master.handle_datagram(&pkt, peer_addr(42040), now);

        let pvt = private_dmrd_bytes(3, 3_125_678, 3_121_234, 0xBB, true);
        master.handle_datagram(&pvt, peer_addr(42042), now + Duration::from_millis(300));
        let stream = master.repeaters[&RepeaterId(3)].slot(Slot::S2).unwrap();
        assert_eq!(
            stream.target_repeaters,
            [RepeaterId(1)].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn timeout_sweep_ends_then_hang_sweep_clears() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_050, 41050, base);
        let id = RepeaterId(312_050);

        let pkt = dmrd_bytes(312_050, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41050), base);

        // Not yet past the 2 s stream timeout.
        master.tick_streams(base + Duration::from_secs(2));
        assert!(!master.repeaters[&id].slot(Slot::S2).unwrap().ended);

        master.tick_streams(base + Duration::from_millis(2100));
        assert!(master.repeaters[&id].slot(Slot::S2).unwrap().ended);

        // Hang time (10 s) after end_time; exactly at the boundary clears.
        master.tick_streams(base + Duration::from_millis(2100) + Duration::from_secs(10));
        assert!(master.repeaters[&id].slot(Slot::S2).is_none());
    }

    #[tokio::test]
    async fn keepalive_sweep_evicts_after_max_missed() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_060, 41060, base);
        let id = RepeaterId(312_060);

        // ping_time 5 s, max_missed 3: misses accrue at 5 s * (missed + 1).
        master.tick_keepalive(base + Duration::from_secs(6));
        assert_eq!(master.repeaters[&id].missed_keepalives, 1);
        master.tick_keepalive(base + Duration::from_secs(11));
        assert_eq!(master.repeaters[&id].missed_keepalives, 2);
        master.tick_keepalive(base + Duration::from_secs(16));
        assert!(!master.repeaters.contains_key(&id), "evicted at max_missed");
    }

    #[tokio::test]
    async fn ping_refreshes_keepalive_and_resets_missed() {
        let mut master = test_master(TEST_CONFIG).await;
        let base = Instant::now();
        connect_repeater(&mut master, 312_061, 41061, base);
        let id = RepeaterId(312_061);

        master.tick_keepalive(base + Duration::from_secs(6));
        assert_eq!(master.repeaters[&id].missed_keepalives, 1);

        master.handle_rptp(id, peer_addr(41061), base + Duration::from_secs(7));
        let rep = &master.repeaters[&id];
        assert_eq!(rep.missed_keepalives, 0);
        assert_eq!(rep.keepalive_count, 1);

        master.tick_keepalive(base + Duration::from_secs(11));
        assert!(master.repeaters.contains_key(&id));
    }

    #[tokio::test]
    async fn lone_terminator_is_ignored() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_070, 41070, now);

        let term = dmrd_bytes(312_070, 111, 3120, 0xDEAD, true, true);
        master.handle_datagram(&term, peer_addr(41070), now);
        assert!(master.repeaters[&RepeaterId(312_070)].slot(Slot::S2).is_none());
    }

    #[tokio::test]
    async fn spoofed_source_address_is_dropped() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_080, 41080, now);

        let pkt = dmrd_bytes(312_080, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(49999), now);
        assert!(master.repeaters[&RepeaterId(312_080)].slot(Slot::S2).is_none());
    }

    #[tokio::test]
    async fn rptcl_removes_repeater_and_scrubs_routing() {
        let mut master = test_master(TEST_CONFIG).await;
        let now = Instant::now();
        connect_repeater(&mut master, 312_090, 41090, now);
        connect_repeater(&mut master, 312_091, 41091, now);

        let pkt = dmrd_bytes(312_090, 111, 3120, 0xAA, true, false);
        master.handle_datagram(&pkt, peer_addr(41090), now);
        assert!(master.repeaters[&RepeaterId(312_090)]
            .slot(Slot::S2)
            .unwrap()
            .target_repeaters
            .contains(&RepeaterId(312_091)));

        master.handle_rptcl(RepeaterId(312_091), peer_addr(41091), now);
        assert!(!master.repeaters.contains_key(&RepeaterId(312_091)));
        assert!(!master.repeaters[&RepeaterId(312_090)]
            .slot(Slot::S2)
            .unwrap()
            .target_repeaters
            .contains(&RepeaterId(312_091)));
    }
}

#[cfg(test)]
mod link_tests {
    use super::*;
    use crate::config::load_config_from_str;
    use hb_protocol::build_mstpong;

    async fn master_with_link(port: u16) -> Master {
        let toml = format!(
            r#"
            [global]
            bind_ipv4 = "127.0.0.1"
            port_ipv4 = 0
            disable_ipv6 = true
            ping_time = 5

            [[outbound_connections]]
            name = "upstream"
            address = "127.0.0.1"
            port = {port}
            our_id = 312900
            password = "linkpass"
            options = "TS1=*;TS2=3120"
            callsign = "HBLINK"
        "#
        );
        let cfg = load_config_from_str(&toml).unwrap();
        Master::bind(cfg, EventEmitter::disabled()).await.unwrap()
    }

    fn remote(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Walk the link through the full handshake by feeding the remote's
    /// replies straight into the dispatcher.
    async fn connect_link(master: &mut Master, port: u16, now: Instant) {
        master.link_connect(0, now).await;
        assert!(matches!(master.links[0].phase, LinkPhase::LoginSent { .. }));
        assert_eq!(master.link_by_addr.get(&remote(port)), Some(&0));

        let challenge = build_mstcl(RepeaterId(312_900), [9, 8, 7, 6]);
        master.handle_datagram(&challenge, remote(port), now);
        assert!(matches!(master.links[0].phase, LinkPhase::AuthSent { .. }));

        master.handle_datagram(&build_rptack(RepeaterId(312_900)), remote(port), now);
        assert!(matches!(master.links[0].phase, LinkPhase::ConfigSent { .. }));

        master.handle_datagram(&build_rptack(RepeaterId(312_900)), remote(port), now);
        assert!(master.links[0].is_connected());
    }

    #[tokio::test]
    async fn link_handshake_reaches_connected() {
        let mut master = master_with_link(45_001).await;
        connect_link(&mut master, 45_001, Instant::now()).await;
    }

    #[tokio::test]
    async fn link_nak_disconnects_and_schedules_retry() {
        let mut master = master_with_link(45_002).await;
        let now = Instant::now();
        connect_link(&mut master, 45_002, now).await;

        master.handle_datagram(&build_mstnak(RepeaterId(312_900)), remote(45_002), now);
        assert!(!master.links[0].is_connected());
        match master.links[0].phase {
            LinkPhase::Disconnected { retry_at } => {
                assert_eq!(retry_at, now + self_ping_time(&master));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    fn self_ping_time(master: &Master) -> std::time::Duration {
        master.cfg.global.ping_time
    }

    #[tokio::test]
    async fn link_pong_refreshes_keepalive_and_loss_reconnects() {
        let mut master = master_with_link(45_003).await;
        let base = Instant::now();
        connect_link(&mut master, 45_003, base).await;

        let pong = build_mstpong(RepeaterId(312_900));
        master.handle_datagram(&pong, remote(45_003), base + std::time::Duration::from_secs(5));
        assert_eq!(master.links[0].last_pong, base + std::time::Duration::from_secs(5));

        // Quiet past ping_time * max_missed (15 s) forces a reconnect cycle.
        master
            .tick_outbound(base + std::time::Duration::from_secs(21))
            .await;
        assert!(matches!(
            master.links[0].phase,
            LinkPhase::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn link_handshake_timeout_resets_to_disconnected() {
        let mut master = master_with_link(45_004).await;
        let base = Instant::now();
        master.link_connect(0, base).await;
        assert!(matches!(master.links[0].phase, LinkPhase::LoginSent { .. }));

        master
            .tick_outbound(base + std::time::Duration::from_secs(16))
            .await;
        assert!(matches!(
            master.links[0].phase,
            LinkPhase::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn dmrd_from_connected_link_enters_the_stream_engine() {
        let mut master = master_with_link(45_005).await;
        let now = Instant::now();
        connect_link(&mut master, 45_005, now).await;

        // TG 3120 on slot 2 is within the link's options policy.
        let frame = Dmrd {
            sequence: 0,
            rf_src: 3_121_234,
            dst_id: 3120,
            repeater_id: RepeaterId(312_900),
            control: 0b1100_0000,
            stream_id: 0xAA,
            payload: [0; 33],
        }
        .to_bytes();
        master.handle_datagram(&frame, remote(45_005), now);

        let stream = master.links[0].slot(Slot::S2).expect("stream on link slot");
        assert!(!stream.is_assumed);
        assert_eq!(stream.stream_id, 0xAA);
        assert!(stream.routing_cached);
    }

    #[tokio::test]
    async fn dmrd_from_link_outside_its_policy_is_dropped() {
        let mut master = master_with_link(45_006).await;
        let now = Instant::now();
        connect_link(&mut master, 45_006, now).await;

        // TG 9 is not in the TS2 list {3120}.
        let frame = Dmrd {
            sequence: 0,
            rf_src: 3_121_234,
            dst_id: 9,
            repeater_id: RepeaterId(312_900),
            control: 0b1100_0000,
            stream_id: 0xBB,
            payload: [0; 33],
        }
        .to_bytes();
        master.handle_datagram(&frame, remote(45_006), now);
        assert!(master.links[0].slot(Slot::S2).is_none());
    }
}
