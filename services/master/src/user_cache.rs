//! Last-heard cache: subscriber id → most recent repeater and slot.
//!
//! Updated on every accepted stream start; entries expire after the
//! configured TTL and are purged by a once-a-minute sweep.  This cache is
//! authoritative for private-call routing only.

use hb_protocol::{RepeaterId, Slot};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct UserEntry {
    pub repeater_id: RepeaterId,
    pub slot: Slot,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct UserCache {
    entries: HashMap<u32, UserEntry>,
    ttl: Duration,
}

impl UserCache {
    pub fn new(ttl: Duration) -> Self {
        UserCache {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn touch(&mut self, subscriber: u32, repeater_id: RepeaterId, slot: Slot, now: Instant) {
        self.entries.insert(
            subscriber,
            UserEntry {
                repeater_id,
                slot,
                last_seen: now,
            },
        );
    }

    /// Look up a subscriber, ignoring entries past the TTL even if the sweep
    /// has not removed them yet.
    pub fn lookup(&self, subscriber: u32, now: Instant) -> Option<UserEntry> {
        self.entries
            .get(&subscriber)
            .filter(|e| now.duration_since(e.last_seen) < self.ttl)
            .copied()
    }

    /// Remove expired entries; returns how many were purged.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) < ttl);
        before - self.entries.len()
    }

    /// Drop every entry pointing at a removed repeater.
    pub fn forget_repeater(&mut self, repeater_id: RepeaterId) {
        self.entries.retain(|_, e| e.repeater_id != repeater_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
