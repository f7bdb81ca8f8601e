//! Desired cluster-wide subscription state.

use std::collections::HashSet;

use crate::errors::Result;
use crate::node::NodeBus;

/// One subscription call to replicate onto a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionOp {
    /// `subscribe(topic)`
    Subscribe,
    /// `unsubscribe(topic)`
    Unsubscribe,
    /// `psubscribe(pattern)`
    PSubscribe,
    /// `punsubscribe(pattern)`
    PUnsubscribe,
}

impl SubscriptionOp {
    /// Issue this call on `bus`.
    pub async fn apply(self, bus: &dyn NodeBus, arg: &str) -> Result<()> {
        match self {
            Self::Subscribe => bus.subscribe(arg).await,
            Self::Unsubscribe => bus.unsubscribe(arg).await,
            Self::PSubscribe => bus.psubscribe(arg).await,
            Self::PUnsubscribe => bus.punsubscribe(arg).await,
        }
    }

    /// Lower-case command name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::PSubscribe => "psubscribe",
            Self::PUnsubscribe => "punsubscribe",
        }
    }
}

/// Topics and patterns that every live node should be subscribed to.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionState {
    topics: HashSet<String>,
    patterns: HashSet<String>,
}

impl SubscriptionState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `op` on `arg`. Returns whether the state changed.
    pub fn record(&mut self, op: SubscriptionOp, arg: &str) -> bool {
        match op {
            SubscriptionOp::Subscribe => self.topics.insert(arg.to_string()),
            SubscriptionOp::Unsubscribe => self.topics.remove(arg),
            SubscriptionOp::PSubscribe => self.patterns.insert(arg.to_string()),
            SubscriptionOp::PUnsubscribe => self.patterns.remove(arg),
        }
    }

    /// Calls that bring a fresh node to this state.
    pub fn replay(&self) -> Vec<(SubscriptionOp, String)> {
        self.topics
            .iter()
            .map(|t| (SubscriptionOp::Subscribe, t.clone()))
            .chain(
                self.patterns
                    .iter()
                    .map(|p| (SubscriptionOp::PSubscribe, p.clone())),
            )
            .collect()
    }

    /// Whether `topic` is subscribed literally.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Whether `pattern` is subscribed.
    pub fn has_pattern(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    /// Number of literal topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_changes() {
        let mut state = SubscriptionState::new();
        assert!(state.record(SubscriptionOp::Subscribe, "t1"));
        assert!(!state.record(SubscriptionOp::Subscribe, "t1"));
        assert!(state.has_topic("t1"));
        assert!(state.record(SubscriptionOp::Unsubscribe, "t1"));
        assert!(!state.record(SubscriptionOp::Unsubscribe, "t1"));
        assert_eq!(state.topic_count(), 0);
    }

    #[test]
    fn topics_and_patterns_are_separate() {
        let mut state = SubscriptionState::new();
        let _ = state.record(SubscriptionOp::Subscribe, "/to/user/*");
        let _ = state.record(SubscriptionOp::PSubscribe, "/to/user/*");
        let _ = state.record(SubscriptionOp::Unsubscribe, "/to/user/*");
        assert!(!state.has_topic("/to/user/*"));
        assert!(state.has_pattern("/to/user/*"));
    }

    #[test]
    fn replay_covers_everything() {
        let mut state = SubscriptionState::new();
        let _ = state.record(SubscriptionOp::Subscribe, "a");
        let _ = state.record(SubscriptionOp::Subscribe, "b");
        let _ = state.record(SubscriptionOp::PSubscribe, "p*");

        let mut replay = state.replay();
        replay.sort_by(|x, y| x.1.cmp(&y.1));
        assert_eq!(
            replay,
            vec![
                (SubscriptionOp::Subscribe, "a".to_string()),
                (SubscriptionOp::Subscribe, "b".to_string()),
                (SubscriptionOp::PSubscribe, "p*".to_string()),
            ]
        );
    }

    #[test]
    fn op_names() {
        assert_eq!(SubscriptionOp::PUnsubscribe.name(), "punsubscribe");
    }
}
