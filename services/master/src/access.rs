//! Repeater access control: blacklist and configuration-pattern matching.
//!
//! A candidate `(repeater_id, callsign)` is mapped either to a blacklist rule
//! (reject, with the rule's reason) or to a repeater configuration
//! (passphrase + per-slot talkgroup policy).  Evaluation order: blacklist
//! first, then patterns in declared order (first match wins), then the
//! optional default.
//!
//! The callsign is not known until the repeater's `RPTC` arrives, so
//! evaluations performed during login/auth pass `None` and callsign-based
//! rules simply cannot match yet.  The full evaluation reruns once the
//! callsign is known.

use hb_protocol::{RepeaterId, TgRequest};
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Talkgroup policy
// ---------------------------------------------------------------------------

/// Per-slot talkgroup policy.
///
/// `AllowAll` is a distinct sentinel, not an empty set: an unspecified policy
/// means no filtering, while an explicitly empty list disables the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TalkgroupPolicy {
    AllowAll,
    List(HashSet<u32>),
}

impl TalkgroupPolicy {
    pub fn permits(&self, tgid: u32) -> bool {
        match self {
            TalkgroupPolicy::AllowAll => true,
            TalkgroupPolicy::List(set) => set.contains(&tgid),
        }
    }

    pub fn is_deny_all(&self) -> bool {
        matches!(self, TalkgroupPolicy::List(set) if set.is_empty())
    }

    /// Intersect this (configured) policy with a repeater's `RPTO` request.
    /// The configured policy is the master allow-list: a repeater can narrow
    /// its subscription but never widen it.
    pub fn intersect(&self, request: &TgRequest) -> TalkgroupPolicy {
        match (self, request) {
            (TalkgroupPolicy::AllowAll, TgRequest::AllowAll) => TalkgroupPolicy::AllowAll,
            (TalkgroupPolicy::AllowAll, TgRequest::List(requested)) => {
                TalkgroupPolicy::List(requested.iter().copied().collect())
            }
            (TalkgroupPolicy::List(configured), TgRequest::AllowAll) => {
                TalkgroupPolicy::List(configured.clone())
            }
            (TalkgroupPolicy::List(configured), TgRequest::List(requested)) => {
                TalkgroupPolicy::List(
                    requested
                        .iter()
                        .copied()
                        .filter(|tg| configured.contains(tg))
                        .collect(),
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Match rules
// ---------------------------------------------------------------------------

/// One match criterion.  Each pattern carries exactly one variant; configs
/// declaring several criteria on a single pattern are rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    /// Enumerated repeater ids.
    Ids(Vec<u32>),
    /// Inclusive id ranges.
    IdRanges(Vec<(u32, u32)>),
    /// Callsign globs; `*` matches any run of characters.
    Callsigns(Vec<String>),
}

impl MatchRule {
    pub fn matches(&self, id: RepeaterId, callsign: Option<&str>) -> bool {
        match self {
            MatchRule::Ids(ids) => ids.contains(&id.0),
            MatchRule::IdRanges(ranges) => {
                ranges.iter().any(|&(lo, hi)| id.0 >= lo && id.0 <= hi)
            }
            MatchRule::Callsigns(globs) => callsign
                .map(|cs| globs.iter().any(|g| glob_match(g, cs)))
                .unwrap_or(false),
        }
    }
}

/// Case-insensitive glob match where `*` matches any (possibly empty) run.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().map(|c| c.to_ascii_uppercase()).collect();
    let txt: Vec<char> = text.chars().map(|c| c.to_ascii_uppercase()).collect();

    // Classic two-pointer wildcard matcher with backtracking to the most
    // recent star.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

// ---------------------------------------------------------------------------
// Rules and evaluation
// ---------------------------------------------------------------------------

/// A blacklist entry: identity match plus the operator-visible reason.
#[derive(Debug, Clone)]
pub struct BlacklistRule {
    pub name: String,
    pub description: String,
    pub rule: MatchRule,
    pub reason: String,
}

/// The configuration applied to a matched repeater.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeaterConfig {
    pub enabled: bool,
    pub passphrase: String,
    pub slot1_talkgroups: TalkgroupPolicy,
    pub slot2_talkgroups: TalkgroupPolicy,
}

impl RepeaterConfig {
    pub fn slot_policy(&self, slot: hb_protocol::Slot) -> &TalkgroupPolicy {
        match slot {
            hb_protocol::Slot::S1 => &self.slot1_talkgroups,
            hb_protocol::Slot::S2 => &self.slot2_talkgroups,
        }
    }
}

/// A named configuration pattern.
#[derive(Debug, Clone)]
pub struct RepeaterPattern {
    pub name: String,
    pub description: String,
    pub rule: MatchRule,
    pub config: RepeaterConfig,
}

/// Outcome of evaluating a candidate against the access rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccessDecision<'a> {
    /// Matched a blacklist rule; reject and surface the reason.
    Blacklisted {
        rule_name: &'a str,
        reason: &'a str,
    },
    /// Matched a pattern (or the default) whose config is enabled.
    Matched {
        pattern_name: &'a str,
        config: &'a RepeaterConfig,
    },
    /// Matched a pattern whose config is disabled; reject.
    Disabled { pattern_name: &'a str },
    /// No pattern matched and no default is configured; reject.
    NoMatch,
}

pub fn evaluate<'a>(
    blacklist: &'a [BlacklistRule],
    patterns: &'a [RepeaterPattern],
    default: Option<&'a RepeaterConfig>,
    id: RepeaterId,
    callsign: Option<&str>,
) -> AccessDecision<'a> {
    for rule in blacklist {
        if rule.rule.matches(id, callsign) {
            return AccessDecision::Blacklisted {
                rule_name: &rule.name,
                reason: &rule.reason,
            };
        }
    }
    for pattern in patterns {
        if pattern.rule.matches(id, callsign) {
            if !pattern.config.enabled {
                return AccessDecision::Disabled {
                    pattern_name: &pattern.name,
                };
            }
            return AccessDecision::Matched {
                pattern_name: &pattern.name,
                config: &pattern.config,
            };
        }
    }
    match default {
        Some(config) if config.enabled => AccessDecision::Matched {
            pattern_name: "default",
            config,
        },
        Some(_) => AccessDecision::Disabled {
            pattern_name: "default",
        },
        None => AccessDecision::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_all_config(passphrase: &str) -> RepeaterConfig {
        RepeaterConfig {
            enabled: true,
            passphrase: passphrase.to_owned(),
            slot1_talkgroups: TalkgroupPolicy::AllowAll,
            slot2_talkgroups: TalkgroupPolicy::AllowAll,
        }
    }

    fn pattern(name: &str, rule: MatchRule) -> RepeaterPattern {
        RepeaterPattern {
            name: name.to_owned(),
            description: String::new(),
            rule,
            config: allow_all_config(name),
        }
    }

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match("VE3*", "VE3XYZ"));
        assert!(glob_match("VE3*", "VE3"));
        assert!(glob_match("*", "ANYTHING"));
        assert!(glob_match("VA?*", "VA?ABC"));
        assert!(!glob_match("VE3*", "VA3XYZ"));
        assert!(glob_match("V*3*Z", "VE3XYZ"));
        assert!(!glob_match("V*3*Z", "VE3XYA"));
    }

    #[test]
    fn glob_is_case_insensitive() {
        assert!(glob_match("ve3*", "VE3ABC"));
    }

    #[test]
    fn blacklist_wins_over_patterns() {
        let blacklist = vec![BlacklistRule {
            name: "stolen".to_owned(),
            description: String::new(),
            rule: MatchRule::Ids(vec![312_666]),
            reason: "ID reported stolen".to_owned(),
        }];
        let patterns = vec![pattern("everything", MatchRule::IdRanges(vec![(0, u32::MAX)]))];
        let decision = evaluate(&blacklist, &patterns, None, RepeaterId(312_666), None);
        assert!(matches!(
            decision,
            AccessDecision::Blacklisted { rule_name: "stolen", reason: "ID reported stolen" }
        ));
    }

    #[test]
    fn first_matching_pattern_wins_in_declared_order() {
        let patterns = vec![
            pattern("narrow", MatchRule::Ids(vec![312_001])),
            pattern("wide", MatchRule::IdRanges(vec![(312_000, 312_099)])),
        ];
        match evaluate(&[], &patterns, None, RepeaterId(312_001), None) {
            AccessDecision::Matched { pattern_name, .. } => assert_eq!(pattern_name, "narrow"),
            other => panic!("expected Matched, got {other:?}"),
        }
        match evaluate(&[], &patterns, None, RepeaterId(312_050), None) {
            AccessDecision::Matched { pattern_name, .. } => assert_eq!(pattern_name, "wide"),
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn id_ranges_are_inclusive() {
        let rule = MatchRule::IdRanges(vec![(100, 200)]);
        assert!(rule.matches(RepeaterId(100), None));
        assert!(rule.matches(RepeaterId(200), None));
        assert!(!rule.matches(RepeaterId(99), None));
        assert!(!rule.matches(RepeaterId(201), None));
    }

    #[test]
    fn callsign_rules_cannot_match_without_a_callsign() {
        let patterns = vec![pattern("club", MatchRule::Callsigns(vec!["VE3*".to_owned()]))];
        assert_eq!(
            evaluate(&[], &patterns, None, RepeaterId(1), None),
            AccessDecision::NoMatch
        );
        assert!(matches!(
            evaluate(&[], &patterns, None, RepeaterId(1), Some("VE3XYZ")),
            AccessDecision::Matched { pattern_name: "club", .. }
        ));
    }

    #[test]
    fn default_applies_only_when_nothing_matches() {
        let patterns = vec![pattern("club", MatchRule::Ids(vec![7]))];
        let default = allow_all_config("default-pass");
        match evaluate(&[], &patterns, Some(&default), RepeaterId(8), None) {
            AccessDecision::Matched { pattern_name, config } => {
                assert_eq!(pattern_name, "default");
                assert_eq!(config.passphrase, "default-pass");
            }
            other => panic!("expected default match, got {other:?}"),
        }
    }

    #[test]
    fn disabled_pattern_rejects_instead_of_falling_through() {
        let mut p = pattern("off", MatchRule::Ids(vec![5]));
        p.config.enabled = false;
        let default = allow_all_config("default-pass");
        assert!(matches!(
            evaluate(&[], &[p], Some(&default), RepeaterId(5), None),
            AccessDecision::Disabled { pattern_name: "off" }
        ));
    }

    #[test]
    fn no_match_without_default_is_rejected() {
        assert_eq!(
            evaluate(&[], &[], None, RepeaterId(1), None),
            AccessDecision::NoMatch
        );
    }

    #[test]
    fn intersect_narrows_but_never_widens() {
        let configured = TalkgroupPolicy::List([1, 2, 3, 4, 5].into_iter().collect());
        let narrowed = configured.intersect(&TgRequest::List(vec![1, 2, 3, 91]));
        assert_eq!(
            narrowed,
            TalkgroupPolicy::List([1, 2, 3].into_iter().collect())
        );

        let kept = configured.intersect(&TgRequest::AllowAll);
        assert_eq!(kept, configured);

        let denied = configured.intersect(&TgRequest::List(vec![]));
        assert!(denied.is_deny_all());

        let unconfigured = TalkgroupPolicy::AllowAll;
        assert_eq!(
            unconfigured.intersect(&TgRequest::AllowAll),
            TalkgroupPolicy::AllowAll
        );
        assert_eq!(
            unconfigured.intersect(&TgRequest::List(vec![9])),
            TalkgroupPolicy::List([9].into_iter().collect())
        );
    }

    #[test]
    fn deny_all_denies_and_allow_all_allows() {
        assert!(TalkgroupPolicy::AllowAll.permits(123_456));
        let empty = TalkgroupPolicy::List(HashSet::new());
        assert!(!empty.permits(1));
        assert!(empty.is_deny_all());
    }
}
