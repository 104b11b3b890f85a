//! Per-connection record of active subscriptions.

use std::collections::BTreeSet;

/// Channels and patterns a guarded connection is subscribed to.
///
/// Sets are ordered so that the resubscribe issued after a replacement is
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionRecord {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl SubscriptionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, channels: &[String]) {
        self.channels.extend(channels.iter().cloned());
    }

    /// An empty list drops every channel, matching the wire semantics.
    pub fn unsubscribe(&mut self, channels: &[String]) {
        remove_or_clear(&mut self.channels, channels);
    }

    pub fn psubscribe(&mut self, patterns: &[String]) {
        self.patterns.extend(patterns.iter().cloned());
    }

    /// An empty list drops every pattern.
    pub fn punsubscribe(&mut self, patterns: &[String]) {
        remove_or_clear(&mut self.patterns, patterns);
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
    }
}

fn remove_or_clear(set: &mut BTreeSet<String>, names: &[String]) {
    if names.is_empty() {
        set.clear();
        return;
    }
    for name in names {
        set.remove(name);
    }
}
