use serde::{Deserialize, Serialize};

use super::nostr::{Event, Kind, PublicKey, Timestamp};

/// The slice of a NIP-01 filter needed to follow RPC traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<Kind>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn pubkey_tag(mut self, pubkey: &PublicKey) -> Self {
        self.p_tags.push(pubkey.to_hex());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Empty fields match everything.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.p_tags.is_empty() && !event.tag_values("p").any(|p| self.p_tags.iter().any(|want| want == p)) {
            return false;
        }
        true
    }
}
