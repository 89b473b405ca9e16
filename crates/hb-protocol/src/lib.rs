// hb-protocol: HomeBrew DMR wire protocol types and serialization.
//
// Every command datagram starts with an ASCII prefix followed by the 4-byte
// repeater id (big-endian) and an optional payload.  `DMRD` is the data
// carrier and is exactly 53 bytes; `RPTC` is exactly 302 bytes.  This crate
// is pure parsing/encoding: no sockets, no state.

use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Frozen sizes and constants
// ---------------------------------------------------------------------------

/// Exact length of a `DMRD` data datagram.
pub const DMRD_LEN: usize = 53;
/// Exact length of an `RPTC` configuration datagram.
pub const RPTC_LEN: usize = 302;
/// Byte range of the repeater-id field inside a `DMRD` datagram.
/// Forwarding rewrites exactly these four bytes and nothing else.
pub const DMRD_REPEATER_ID_RANGE: std::ops::Range<usize> = 11..15;

/// `dtype_vseq` value that, combined with `FrameType::DataSync`, marks the
/// end of a transmission.
pub const DTYPE_TERMINATOR: u8 = 2;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Four-byte repeater identifier as carried on the wire (big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepeaterId(pub u32);

impl RepeaterId {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        RepeaterId(u32::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for RepeaterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DMR timeslot, from bit 7 of the DMRD control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    S1,
    S2,
}

impl Slot {
    pub fn from_bit(bit_set: bool) -> Self {
        if bit_set { Slot::S2 } else { Slot::S1 }
    }

    /// Zero-based index for slot-array storage.
    pub fn index(self) -> usize {
        match self {
            Slot::S1 => 0,
            Slot::S2 => 1,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Slot::S1 => 1,
            Slot::S2 => 2,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TS{}", self.number())
    }
}

/// Call addressing mode, from bit 6 of the DMRD control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Destination is a talkgroup.
    Group,
    /// Destination is a single subscriber.
    Private,
}

/// Frame classification, from bits 4–5 of the DMRD control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Voice,
    VoiceSync,
    DataSync,
    /// Bit pattern 3 is not assigned; carried through unchanged.
    Reserved,
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => FrameType::Voice,
            1 => FrameType::VoiceSync,
            2 => FrameType::DataSync,
            _ => FrameType::Reserved,
        }
    }
}

// ---------------------------------------------------------------------------
// Command classification
// ---------------------------------------------------------------------------

/// All recognized command kinds, by datagram prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Dmrd,
    Rptl,
    Rptk,
    Rptc,
    Rpto,
    /// Keepalive ping; on the wire as `RPTPING`, but `RPTP` is sufficient to
    /// disambiguate and short forms are accepted.
    Rptp,
    Rptcl,
    Mstcl,
    Mstpong,
    Mstnak,
    Rptack,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Dmrd => "DMRD",
            Command::Rptl => "RPTL",
            Command::Rptk => "RPTK",
            Command::Rptc => "RPTC",
            Command::Rpto => "RPTO",
            Command::Rptp => "RPTP",
            Command::Rptcl => "RPTCL",
            Command::Mstcl => "MSTCL",
            Command::Mstpong => "MSTPONG",
            Command::Mstnak => "MSTNAK",
            Command::Rptack => "RPTACK",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a datagram by its command prefix.
///
/// `RPTCL` must be tested before `RPTC` (shared prefix); `RPTPING` and the
/// bare `RPTP` form map to the same command.  Returns `None` for unknown
/// prefixes.
pub fn classify(buf: &[u8]) -> Option<Command> {
    if buf.starts_with(b"DMRD") {
        Some(Command::Dmrd)
    } else if buf.starts_with(b"RPTL") {
        Some(Command::Rptl)
    } else if buf.starts_with(b"RPTK") {
        Some(Command::Rptk)
    } else if buf.starts_with(b"RPTCL") {
        Some(Command::Rptcl)
    } else if buf.starts_with(b"RPTC") {
        Some(Command::Rptc)
    } else if buf.starts_with(b"RPTO") {
        Some(Command::Rpto)
    } else if buf.starts_with(b"RPTP") {
        Some(Command::Rptp)
    } else if buf.starts_with(b"MSTCL") {
        Some(Command::Mstcl)
    } else if buf.starts_with(b"MSTPONG") {
        Some(Command::Mstpong)
    } else if buf.starts_with(b"MSTNAK") {
        Some(Command::Mstnak)
    } else if buf.starts_with(b"RPTACK") {
        Some(Command::Rptack)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unknown command prefix")]
    UnknownCommand,
    #[error("{command} datagram truncated: {len} bytes")]
    Truncated { command: Command, len: usize },
    #[error("{command} must be exactly {expected} bytes, got {got}")]
    Length {
        command: Command,
        expected: usize,
        got: usize,
    },
}

// ---------------------------------------------------------------------------
// Command frames
// ---------------------------------------------------------------------------

/// A parsed non-`DMRD` command datagram: prefix, repeater id, payload tail.
///
/// The payload is whatever follows the id: the 4-byte salt for `MSTCL`,
/// the 32-byte digest for `RPTK`, the metadata block for `RPTC`, the ASCII
/// options string for `RPTO`, empty for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame<'a> {
    pub command: Command,
    pub repeater_id: RepeaterId,
    pub payload: &'a [u8],
}

/// Parse a command datagram (anything but `DMRD`) into a [`CommandFrame`].
///
/// Enforces the exact-size rules: `RPTC` is 302 bytes, `RPTK` carries a
/// 32-byte digest, `MSTCL` carries a 4-byte salt.  `RPTPING` is accepted in
/// both its full and bare `RPTP` forms.
pub fn parse_frame(buf: &[u8]) -> Result<CommandFrame<'_>, PacketError> {
    let command = classify(buf).ok_or(PacketError::UnknownCommand)?;
    let prefix_len = match command {
        Command::Dmrd => {
            // DMRD has its own layout; see Dmrd::parse.
            return Err(PacketError::UnknownCommand);
        }
        Command::Rptp => {
            if buf.starts_with(b"RPTPING") {
                7
            } else {
                4
            }
        }
        Command::Rptl | Command::Rptk | Command::Rptc | Command::Rpto => 4,
        Command::Rptcl | Command::Mstcl => 5,
        Command::Mstnak | Command::Rptack => 6,
        Command::Mstpong => 7,
    };
    if buf.len() < prefix_len + 4 {
        return Err(PacketError::Truncated {
            command,
            len: buf.len(),
        });
    }
    match command {
        Command::Rptc if buf.len() != RPTC_LEN => {
            return Err(PacketError::Length {
                command,
                expected: RPTC_LEN,
                got: buf.len(),
            });
        }
        Command::Rptk if buf.len() != prefix_len + 4 + 32 => {
            return Err(PacketError::Length {
                command,
                expected: prefix_len + 4 + 32,
                got: buf.len(),
            });
        }
        Command::Mstcl if buf.len() != prefix_len + 4 + 4 => {
            return Err(PacketError::Length {
                command,
                expected: prefix_len + 4 + 4,
                got: buf.len(),
            });
        }
        _ => {}
    }
    let id_bytes: [u8; 4] = buf[prefix_len..prefix_len + 4]
        .try_into()
        .expect("slice length checked above");
    Ok(CommandFrame {
        command,
        repeater_id: RepeaterId::from_bytes(id_bytes),
        payload: &buf[prefix_len + 4..],
    })
}

// ---------------------------------------------------------------------------
// DMRD data datagram
// ---------------------------------------------------------------------------

/// A parsed 53-byte `DMRD` data datagram.
///
/// Layout: `"DMRD"` | sequence(1) | rf_src(3) | dst_id(3) | repeater_id(4) |
/// control(1) | stream_id(4) | payload(33).
///
/// Control byte: bit 7 = slot (0 → TS1), bit 6 = call type (0 → private,
/// 1 → group), bits 4–5 = frame type, bits 0–3 = dtype / voice sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dmrd {
    pub sequence: u8,
    pub rf_src: u32,
    pub dst_id: u32,
    pub repeater_id: RepeaterId,
    pub control: u8,
    pub stream_id: u32,
    pub payload: [u8; 33],
}

impl Dmrd {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if !buf.starts_with(b"DMRD") {
            return Err(PacketError::UnknownCommand);
        }
        if buf.len() != DMRD_LEN {
            return Err(PacketError::Length {
                command: Command::Dmrd,
                expected: DMRD_LEN,
                got: buf.len(),
            });
        }
        Ok(Dmrd {
            sequence: buf[4],
            rf_src: u32::from_be_bytes([0, buf[5], buf[6], buf[7]]),
            dst_id: u32::from_be_bytes([0, buf[8], buf[9], buf[10]]),
            repeater_id: RepeaterId::from_bytes(
                buf[11..15].try_into().expect("length checked"),
            ),
            control: buf[15],
            stream_id: u32::from_be_bytes(buf[16..20].try_into().expect("length checked")),
            payload: buf[20..53].try_into().expect("length checked"),
        })
    }

    pub fn to_bytes(&self) -> [u8; DMRD_LEN] {
        let mut out = [0u8; DMRD_LEN];
        out[0..4].copy_from_slice(b"DMRD");
        out[4] = self.sequence;
        out[5..8].copy_from_slice(&self.rf_src.to_be_bytes()[1..]);
        out[8..11].copy_from_slice(&self.dst_id.to_be_bytes()[1..]);
        out[11..15].copy_from_slice(&self.repeater_id.to_bytes());
        out[15] = self.control;
        out[16..20].copy_from_slice(&self.stream_id.to_be_bytes());
        out[20..53].copy_from_slice(&self.payload);
        out
    }

    pub fn slot(&self) -> Slot {
        Slot::from_bit(self.control & 0x80 != 0)
    }

    pub fn call_type(&self) -> CallType {
        if self.control & 0x40 != 0 {
            CallType::Group
        } else {
            CallType::Private
        }
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from_bits((self.control >> 4) & 0x03)
    }

    pub fn dtype_vseq(&self) -> u8 {
        self.control & 0x0F
    }

    /// A terminator ends the transmission.  No sync-pattern inspection of the
    /// payload is required.
    pub fn is_terminator(&self) -> bool {
        self.frame_type() == FrameType::DataSync && self.dtype_vseq() == DTYPE_TERMINATOR
    }
}

/// Rewrite the repeater-id field (bytes 11–14) of a raw `DMRD` datagram in
/// place, leaving every other byte untouched.  This is the entire per-target
/// transformation applied when forwarding.
pub fn rewrite_repeater_id(buf: &mut [u8], id: RepeaterId) {
    debug_assert_eq!(buf.len(), DMRD_LEN);
    buf[DMRD_REPEATER_ID_RANGE].copy_from_slice(&id.to_bytes());
}

// ---------------------------------------------------------------------------
// RPTC metadata block
// ---------------------------------------------------------------------------

/// Field widths of the `RPTC` block after the command and id, in order.
const RPTC_FIELD_WIDTHS: [usize; 14] = [8, 9, 9, 2, 2, 8, 9, 3, 20, 19, 1, 124, 40, 40];

/// Repeater metadata carried by the 302-byte `RPTC` datagram.
///
/// String fields are null-padded on the wire; parsing trims trailing NULs
/// and spaces.  Values are accepted as-is; the master records them for the
/// dashboard and does not validate frequencies or coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RptcPayload {
    pub callsign: String,
    pub rx_freq: String,
    pub tx_freq: String,
    pub tx_power: String,
    pub color_code: String,
    pub latitude: String,
    pub longitude: String,
    pub height: String,
    pub location: String,
    pub description: String,
    pub slots: String,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

impl RptcPayload {
    /// Parse the 294-byte payload that follows `"RPTC"` + id.
    pub fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() != RPTC_LEN - 8 {
            return Err(PacketError::Length {
                command: Command::Rptc,
                expected: RPTC_LEN - 8,
                got: payload.len(),
            });
        }
        let mut fields = Vec::with_capacity(RPTC_FIELD_WIDTHS.len());
        let mut offset = 0;
        for width in RPTC_FIELD_WIDTHS {
            let raw = &payload[offset..offset + width];
            fields.push(
                String::from_utf8_lossy(raw)
                    .trim_end_matches(['\0', ' '])
                    .to_owned(),
            );
            offset += width;
        }
        let mut it = fields.into_iter();
        Ok(RptcPayload {
            callsign: it.next().unwrap_or_default(),
            rx_freq: it.next().unwrap_or_default(),
            tx_freq: it.next().unwrap_or_default(),
            tx_power: it.next().unwrap_or_default(),
            color_code: it.next().unwrap_or_default(),
            latitude: it.next().unwrap_or_default(),
            longitude: it.next().unwrap_or_default(),
            height: it.next().unwrap_or_default(),
            location: it.next().unwrap_or_default(),
            description: it.next().unwrap_or_default(),
            slots: it.next().unwrap_or_default(),
            url: it.next().unwrap_or_default(),
            software_id: it.next().unwrap_or_default(),
            package_id: it.next().unwrap_or_default(),
        })
    }

    fn field_values(&self) -> [&str; 14] {
        [
            &self.callsign,
            &self.rx_freq,
            &self.tx_freq,
            &self.tx_power,
            &self.color_code,
            &self.latitude,
            &self.longitude,
            &self.height,
            &self.location,
            &self.description,
            &self.slots,
            &self.url,
            &self.software_id,
            &self.package_id,
        ]
    }
}

// ---------------------------------------------------------------------------
// RPTO options string
// ---------------------------------------------------------------------------

/// A per-slot talkgroup subscription request from an `RPTO` options string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TgRequest {
    /// `TSn=*`, no filtering requested.
    AllowAll,
    /// Explicit list; empty means deny-all (slot disabled).
    List(Vec<u32>),
}

/// Parsed `RPTO` options: `TS1=<csv>;TS2=<csv>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsRequest {
    pub ts1: TgRequest,
    pub ts2: TgRequest,
}

/// Parse an `RPTO` options string.
///
/// `*` is the allow-all wildcard; an empty value (`TS1=`) and a missing
/// `TSn=` key both mean deny-all.  Values are decimal talkgroup ids;
/// malformed tokens are skipped.  Unknown keys are ignored.
pub fn parse_options(s: &str) -> OptionsRequest {
    let mut ts1 = TgRequest::List(Vec::new());
    let mut ts2 = TgRequest::List(Vec::new());
    for part in s.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let request = if value.trim() == "*" {
            TgRequest::AllowAll
        } else {
            TgRequest::List(
                value
                    .split(',')
                    .filter_map(|tok| tok.trim().parse::<u32>().ok())
                    .collect(),
            )
        };
        match key.trim() {
            "TS1" => ts1 = request,
            "TS2" => ts2 = request,
            _ => {}
        }
    }
    OptionsRequest { ts1, ts2 }
}

// ---------------------------------------------------------------------------
// Authentication digest
// ---------------------------------------------------------------------------

/// The expected `RPTK` answer: SHA-256 over `salt || passphrase`.
///
/// The same order is used when this server answers a remote challenge on an
/// outbound link, so two instances always interoperate.
pub fn auth_digest(salt: [u8; 4], passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// Constant-time digest comparison; both inputs are fixed-width.
pub fn digest_matches(a: &[u8; 32], b: &[u8]) -> bool {
    if b.len() != 32 {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Reply / request builders
// ---------------------------------------------------------------------------

fn concat(prefix: &[u8], id: RepeaterId, tail: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 4 + tail.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(&id.to_bytes());
    out.extend_from_slice(tail);
    out
}

pub fn build_rptl(id: RepeaterId) -> Vec<u8> {
    concat(b"RPTL", id, &[])
}

pub fn build_rptk(id: RepeaterId, digest: &[u8; 32]) -> Vec<u8> {
    concat(b"RPTK", id, digest)
}

/// Build a full 302-byte `RPTC` datagram from metadata fields.  Each field
/// is truncated or null-padded to its wire width.
pub fn build_rptc(id: RepeaterId, meta: &RptcPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(RPTC_LEN);
    out.extend_from_slice(b"RPTC");
    out.extend_from_slice(&id.to_bytes());
    for (value, width) in meta.field_values().iter().zip(RPTC_FIELD_WIDTHS) {
        let bytes = value.as_bytes();
        let take = bytes.len().min(width);
        out.extend_from_slice(&bytes[..take]);
        out.resize(out.len() + (width - take), 0);
    }
    debug_assert_eq!(out.len(), RPTC_LEN);
    out
}

pub fn build_rpto(id: RepeaterId, options: &str) -> Vec<u8> {
    concat(b"RPTO", id, options.as_bytes())
}

pub fn build_rptping(id: RepeaterId) -> Vec<u8> {
    concat(b"RPTPING", id, &[])
}

pub fn build_rptcl(id: RepeaterId) -> Vec<u8> {
    concat(b"RPTCL", id, &[])
}

pub fn build_mstcl(id: RepeaterId, salt: [u8; 4]) -> Vec<u8> {
    concat(b"MSTCL", id, &salt)
}

pub fn build_mstpong(id: RepeaterId) -> Vec<u8> {
    concat(b"MSTPONG", id, &[])
}

pub fn build_mstnak(id: RepeaterId) -> Vec<u8> {
    concat(b"MSTNAK", id, &[])
}

pub fn build_rptack(id: RepeaterId) -> Vec<u8> {
    concat(b"RPTACK", id, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tests_rptcl_before_rptc() {
        assert_eq!(classify(&build_rptcl(RepeaterId(1))), Some(Command::Rptcl));
        assert_eq!(classify(&[b"RPTC".as_slice(), &[0u8; 298]].concat()), Some(Command::Rptc));
    }

    #[test]
    fn classify_accepts_both_ping_forms() {
        assert_eq!(classify(b"RPTPING\x00\x01\x02\x03"), Some(Command::Rptp));
        assert_eq!(classify(b"RPTP\x00\x01\x02\x03"), Some(Command::Rptp));
    }

    #[test]
    fn classify_rejects_unknown_prefix() {
        assert_eq!(classify(b"XYZW\x00\x00\x00\x01"), None);
    }

    #[test]
    fn parse_frame_extracts_id_from_both_ping_forms() {
        let long = parse_frame(b"RPTPING\x00\x04\xC2\x93").unwrap();
        assert_eq!(long.repeater_id, RepeaterId(312_979));
        let short = parse_frame(b"RPTP\x00\x04\xC2\x93").unwrap();
        assert_eq!(short.repeater_id, RepeaterId(312_979));
    }

    #[test]
    fn parse_frame_rejects_short_rptk() {
        let err = parse_frame(&concat(b"RPTK", RepeaterId(1), &[0u8; 16])).unwrap_err();
        assert!(matches!(err, PacketError::Length { command: Command::Rptk, .. }));
    }

    #[test]
    fn mstcl_round_trip_carries_salt() {
        let buf = build_mstcl(RepeaterId(312_000), [0xDE, 0xAD, 0xBE, 0xEF]);
        let frame = parse_frame(&buf).unwrap();
        assert_eq!(frame.command, Command::Mstcl);
        assert_eq!(frame.repeater_id, RepeaterId(312_000));
        assert_eq!(frame.payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn auth_digest_is_salt_then_passphrase() {
        let salt = [1u8, 2, 3, 4];
        let mut hasher = Sha256::new();
        hasher.update([1u8, 2, 3, 4]);
        hasher.update(b"secret");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(auth_digest(salt, "secret"), expected);
        assert!(digest_matches(&expected, &expected));
        assert!(!digest_matches(&expected, &[0u8; 32]));
        assert!(!digest_matches(&expected, &expected[..16]));
    }

    #[test]
    fn rptc_field_widths_sum_to_wire_length() {
        let total: usize = 8 + RPTC_FIELD_WIDTHS.iter().sum::<usize>();
        assert_eq!(total, RPTC_LEN);
    }
}
