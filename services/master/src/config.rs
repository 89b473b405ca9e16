//! Master configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/hblink/master.toml`.
//!
//! # Required fields
//! - every `[[blacklist.patterns]]` / `[[repeater_configurations.patterns]]`
//!   entry needs a `name` and a `match` table with exactly one criterion
//!   (`ids`, `id_ranges`, or `callsigns`)
//! - every pattern `config` (and the optional `default`) needs a `passphrase`
//! - every enabled `[[outbound_connections]]` entry needs `name`, `address`,
//!   `port`, `our_id`, and `password`
//!
//! Talkgroup lists: an omitted `slotN_talkgroups` key means allow-all; an
//! explicitly empty list disables the slot.

use crate::access::{BlacklistRule, MatchRule, RepeaterConfig, RepeaterPattern, TalkgroupPolicy};
use hb_protocol::RepeaterId;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level master configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub blacklist: Vec<BlacklistRule>,
    pub patterns: Vec<RepeaterPattern>,
    pub default_config: Option<RepeaterConfig>,
    pub outbound: Vec<OutboundConfig>,
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub bind_ipv4: String,
    pub port_ipv4: u16,
    pub bind_ipv6: String,
    pub port_ipv6: u16,
    pub disable_ipv6: bool,
    /// Keepalive interval; also the outbound retry backoff.
    pub ping_time: Duration,
    pub max_missed: u32,
    /// Active stream considered dead after this long without a packet.
    pub stream_timeout: Duration,
    /// Slot reservation window after a stream ends.
    pub stream_hang_time: Duration,
    /// A stream with a packet newer than this is "active" for contention.
    pub stream_active_threshold: Duration,
    pub user_cache_timeout: Duration,
    pub dashboard: Option<DashboardConfig>,
}

/// Dashboard event feed endpoint (this server is the connecting client).
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub transport: DashboardTransport,
    /// Bounded event queue length; events beyond it are dropped.
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub enum DashboardTransport {
    Unix { socket_path: String },
    Tcp {
        host_ipv4: String,
        host_ipv6: Option<String>,
        port: u16,
    },
}

/// One server-to-server link, presenting as a repeater to the remote master.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub enabled: bool,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub our_id: RepeaterId,
    pub password: String,
    /// Optional `RPTO` options string sent after login.
    pub options: Option<String>,
    pub callsign: String,
    pub rx_frequency: String,
    pub tx_frequency: String,
    pub power: String,
    pub latitude: String,
    pub longitude: String,
    pub height: String,
    pub location: String,
    pub description: String,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct RawConfig {
    global: Option<RawGlobal>,
    blacklist: Option<RawBlacklist>,
    repeater_configurations: Option<RawRepeaterConfigurations>,
    outbound_connections: Option<Vec<RawOutbound>>,
}

#[derive(Debug, serde::Deserialize)]
struct RawGlobal {
    bind_ipv4: Option<String>,
    port_ipv4: Option<u16>,
    bind_ipv6: Option<String>,
    port_ipv6: Option<u16>,
    disable_ipv6: Option<bool>,
    ping_time: Option<u64>,
    max_missed: Option<u32>,
    stream_timeout: Option<f64>,
    stream_hang_time: Option<f64>,
    stream_active_threshold_ms: Option<u64>,
    user_cache: Option<RawUserCache>,
    dashboard: Option<RawDashboard>,
}

#[derive(Debug, serde::Deserialize)]
struct RawUserCache {
    timeout: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct RawDashboard {
    transport: Option<String>,
    unix_socket: Option<String>,
    host_ipv4: Option<String>,
    host_ipv6: Option<String>,
    port: Option<u16>,
    buffer_size: Option<usize>,
}

#[derive(Debug, serde::Deserialize)]
struct RawBlacklist {
    patterns: Option<Vec<RawBlacklistPattern>>,
}

#[derive(Debug, serde::Deserialize)]
struct RawBlacklistPattern {
    name: Option<String>,
    description: Option<String>,
    #[serde(rename = "match")]
    match_rule: Option<RawMatch>,
    reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RawMatch {
    ids: Option<Vec<u32>>,
    id_ranges: Option<Vec<(u32, u32)>>,
    callsigns: Option<Vec<String>>,
}

#[derive(Debug, serde::Deserialize)]
struct RawRepeaterConfigurations {
    patterns: Option<Vec<RawRepeaterPattern>>,
    default: Option<RawRepeaterConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct RawRepeaterPattern {
    name: Option<String>,
    description: Option<String>,
    #[serde(rename = "match")]
    match_rule: Option<RawMatch>,
    config: Option<RawRepeaterConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct RawRepeaterConfig {
    enabled: Option<bool>,
    passphrase: Option<String>,
    slot1_talkgroups: Option<Vec<u32>>,
    slot2_talkgroups: Option<Vec<u32>>,
}

#[derive(Debug, serde::Deserialize)]
struct RawOutbound {
    enabled: Option<bool>,
    name: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    our_id: Option<u32>,
    password: Option<String>,
    options: Option<String>,
    callsign: Option<String>,
    rx_frequency: Option<String>,
    tx_frequency: Option<String>,
    power: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    height: Option<String>,
    location: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load master config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load master config from the default path `/etc/hblink/master.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/hblink/master.toml"))
}

/// Load master config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let global = validate_global(raw.global)?;

    let blacklist = match raw.blacklist.and_then(|b| b.patterns) {
        Some(patterns) => {
            let mut rules = Vec::with_capacity(patterns.len());
            for (i, p) in patterns.into_iter().enumerate() {
                rules.push(validate_blacklist_pattern(i, p)?);
            }
            rules
        }
        None => Vec::new(),
    };

    let (patterns, default_config) = match raw.repeater_configurations {
        Some(rc) => {
            let mut out = Vec::new();
            for (i, p) in rc.patterns.unwrap_or_default().into_iter().enumerate() {
                out.push(validate_repeater_pattern(i, p)?);
            }
            let default = match rc.default {
                Some(d) => Some(validate_repeater_config(
                    "repeater_configurations.default",
                    d,
                )?),
                None => None,
            };
            (out, default)
        }
        None => (Vec::new(), None),
    };

    let outbound = validate_outbound(raw.outbound_connections.unwrap_or_default())?;

    Ok(Config {
        global,
        blacklist,
        patterns,
        default_config,
        outbound,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_global(raw: Option<RawGlobal>) -> Result<GlobalConfig, ConfigError> {
    let raw = raw.unwrap_or(RawGlobal {
        bind_ipv4: None,
        port_ipv4: None,
        bind_ipv6: None,
        port_ipv6: None,
        disable_ipv6: None,
        ping_time: None,
        max_missed: None,
        stream_timeout: None,
        stream_hang_time: None,
        stream_active_threshold_ms: None,
        user_cache: None,
        dashboard: None,
    });

    let ping_time = raw.ping_time.unwrap_or(5);
    if ping_time == 0 {
        return Err(ConfigError::InvalidValue(
            "global.ping_time must be at least 1 second".to_owned(),
        ));
    }
    let max_missed = raw.max_missed.unwrap_or(3);
    if max_missed == 0 {
        return Err(ConfigError::InvalidValue(
            "global.max_missed must be at least 1".to_owned(),
        ));
    }
    let stream_timeout = raw.stream_timeout.unwrap_or(2.0);
    if stream_timeout.is_nan() || stream_timeout <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "global.stream_timeout must be positive".to_owned(),
        ));
    }
    let stream_hang_time = raw.stream_hang_time.unwrap_or(10.0);
    if stream_hang_time.is_nan() || stream_hang_time <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "global.stream_hang_time must be positive".to_owned(),
        ));
    }
    let user_cache_timeout = raw.user_cache.and_then(|u| u.timeout).unwrap_or(600);
    if user_cache_timeout < 60 {
        return Err(ConfigError::InvalidValue(format!(
            "global.user_cache.timeout must be at least 60 seconds, got {user_cache_timeout}"
        )));
    }

    let dashboard = match raw.dashboard {
        Some(d) => Some(validate_dashboard(d)?),
        None => None,
    };

    Ok(GlobalConfig {
        bind_ipv4: raw.bind_ipv4.unwrap_or_else(|| "0.0.0.0".to_owned()),
        port_ipv4: raw.port_ipv4.unwrap_or(62031),
        bind_ipv6: raw.bind_ipv6.unwrap_or_else(|| "::".to_owned()),
        port_ipv6: raw.port_ipv6.unwrap_or(62032),
        disable_ipv6: raw.disable_ipv6.unwrap_or(false),
        ping_time: Duration::from_secs(ping_time),
        max_missed,
        stream_timeout: Duration::from_secs_f64(stream_timeout),
        stream_hang_time: Duration::from_secs_f64(stream_hang_time),
        stream_active_threshold: Duration::from_millis(
            raw.stream_active_threshold_ms.unwrap_or(200),
        ),
        user_cache_timeout: Duration::from_secs(user_cache_timeout),
        dashboard,
    })
}

fn validate_dashboard(raw: RawDashboard) -> Result<DashboardConfig, ConfigError> {
    let buffer_size = raw.buffer_size.unwrap_or(256);
    if buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "global.dashboard.buffer_size must be at least 1".to_owned(),
        ));
    }
    let transport = match raw.transport.as_deref() {
        Some("unix") | None => DashboardTransport::Unix {
            socket_path: raw.unix_socket.ok_or_else(|| {
                ConfigError::MissingField("global.dashboard.unix_socket".to_owned())
            })?,
        },
        Some("tcp") => DashboardTransport::Tcp {
            host_ipv4: raw.host_ipv4.unwrap_or_else(|| "127.0.0.1".to_owned()),
            host_ipv6: raw.host_ipv6,
            port: raw
                .port
                .ok_or_else(|| ConfigError::MissingField("global.dashboard.port".to_owned()))?,
        },
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "global.dashboard.transport must be \"unix\" or \"tcp\", got \"{other}\""
            )));
        }
    };
    Ok(DashboardConfig {
        transport,
        buffer_size,
    })
}

fn validate_match(context: &str, raw: Option<RawMatch>) -> Result<MatchRule, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::MissingField(format!("{context}.match")))?;
    let mut rules = Vec::new();
    if let Some(ids) = raw.ids {
        rules.push(MatchRule::Ids(ids));
    }
    if let Some(ranges) = raw.id_ranges {
        for &(lo, hi) in &ranges {
            if lo > hi {
                return Err(ConfigError::InvalidValue(format!(
                    "{context}.match.id_ranges entry [{lo}, {hi}] is inverted"
                )));
            }
        }
        rules.push(MatchRule::IdRanges(ranges));
    }
    if let Some(callsigns) = raw.callsigns {
        rules.push(MatchRule::Callsigns(callsigns));
    }
    match rules.len() {
        0 => Err(ConfigError::MissingField(format!(
            "{context}.match needs one of ids, id_ranges, callsigns"
        ))),
        1 => Ok(rules.pop().expect("length checked")),
        _ => Err(ConfigError::InvalidValue(format!(
            "{context}.match must declare exactly one of ids, id_ranges, callsigns"
        ))),
    }
}

fn validate_blacklist_pattern(
    index: usize,
    raw: RawBlacklistPattern,
) -> Result<BlacklistRule, ConfigError> {
    let context = format!("blacklist.patterns[{index}]");
    let name = raw
        .name
        .ok_or_else(|| ConfigError::MissingField(format!("{context}.name")))?;
    let rule = validate_match(&context, raw.match_rule)?;
    Ok(BlacklistRule {
        name,
        description: raw.description.unwrap_or_default(),
        rule,
        reason: raw.reason.unwrap_or_else(|| "blacklisted".to_owned()),
    })
}

fn talkgroup_policy(list: Option<Vec<u32>>) -> TalkgroupPolicy {
    match list {
        None => TalkgroupPolicy::AllowAll,
        Some(tgs) => TalkgroupPolicy::List(tgs.into_iter().collect()),
    }
}

fn validate_repeater_config(
    context: &str,
    raw: RawRepeaterConfig,
) -> Result<RepeaterConfig, ConfigError> {
    let passphrase = raw
        .passphrase
        .ok_or_else(|| ConfigError::MissingField(format!("{context}.passphrase")))?;
    Ok(RepeaterConfig {
        enabled: raw.enabled.unwrap_or(true),
        passphrase,
        slot1_talkgroups: talkgroup_policy(raw.slot1_talkgroups),
        slot2_talkgroups: talkgroup_policy(raw.slot2_talkgroups),
    })
}

fn validate_repeater_pattern(
    index: usize,
    raw: RawRepeaterPattern,
) -> Result<RepeaterPattern, ConfigError> {
    let context = format!("repeater_configurations.patterns[{index}]");
    let name = raw
        .name
        .ok_or_else(|| ConfigError::MissingField(format!("{context}.name")))?;
    let rule = validate_match(&context, raw.match_rule)?;
    let config = raw
        .config
        .ok_or_else(|| ConfigError::MissingField(format!("{context}.config")))?;
    Ok(RepeaterPattern {
        name,
        description: raw.description.unwrap_or_default(),
        rule,
        config: validate_repeater_config(&context, config)?,
    })
}

fn validate_outbound(raw: Vec<RawOutbound>) -> Result<Vec<OutboundConfig>, ConfigError> {
    let mut out = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut seen_ids: HashSet<u32> = HashSet::new();
    for (i, r) in raw.into_iter().enumerate() {
        let context = format!("outbound_connections[{i}]");
        let enabled = r.enabled.unwrap_or(true);
        if !enabled {
            continue;
        }
        let name = r
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("{context}.name")))?;
        if !seen_names.insert(name.clone()) {
            return Err(ConfigError::InvalidValue(format!(
                "{context}.name \"{name}\" is declared twice"
            )));
        }
        let our_id = r
            .our_id
            .ok_or_else(|| ConfigError::MissingField(format!("{context}.our_id")))?;
        if !seen_ids.insert(our_id) {
            return Err(ConfigError::InvalidValue(format!(
                "{context}.our_id {our_id} is declared twice"
            )));
        }
        out.push(OutboundConfig {
            enabled,
            name,
            address: r
                .address
                .ok_or_else(|| ConfigError::MissingField(format!("{context}.address")))?,
            port: r
                .port
                .ok_or_else(|| ConfigError::MissingField(format!("{context}.port")))?,
            our_id: RepeaterId(our_id),
            password: r
                .password
                .ok_or_else(|| ConfigError::MissingField(format!("{context}.password")))?,
            options: r.options,
            callsign: r.callsign.unwrap_or_default(),
            rx_frequency: r.rx_frequency.unwrap_or_default(),
            tx_frequency: r.tx_frequency.unwrap_or_default(),
            power: r.power.unwrap_or_default(),
            latitude: r.latitude.unwrap_or_default(),
            longitude: r.longitude.unwrap_or_default(),
            height: r.height.unwrap_or_default(),
            location: r.location.unwrap_or_default(),
            description: r.description.unwrap_or_default(),
            url: r.url.unwrap_or_default(),
        });
    }
    Ok(out)
}
