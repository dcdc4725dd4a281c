use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::KeyId;

/// Per-key synchronization metadata kept alongside the key ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub master_key_id: KeyId,
    /// When the key was last refreshed from (or pushed to) a keyserver.
    /// `None` after a bulk reset or if it was never synchronized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_millis: Option<u64>,
    #[serde(default)]
    pub seen_on_keyservers: bool,
}

impl KeyMetadata {
    #[must_use]
    pub fn new(master_key_id: KeyId) -> Self {
        Self {
            master_key_id,
            last_updated_millis: None,
            seen_on_keyservers: false,
        }
    }

    /// Marks the key as refreshed at `now_millis`.
    pub fn renew(&mut self, seen_on_keyservers: bool, now_millis: u64) {
        self.last_updated_millis = Some(now_millis);
        self.seen_on_keyservers = seen_on_keyservers;
    }

    /// Clears the refresh timestamp so the next sync picks the key up.
    pub fn invalidate(&mut self) {
        self.last_updated_millis = None;
    }

    /// Whether the key was last refreshed before `now - max_age`.
    #[must_use]
    pub fn is_stale(&self, now_millis: u64, max_age: Duration) -> bool {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        match self.last_updated_millis {
            None => true,
            Some(updated) => updated < now_millis.saturating_sub(max_age_ms),
        }
    }
}
