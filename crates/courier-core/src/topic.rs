//! Per-user delivery topic naming.
//!
//! A user's delivery topic is `<prefix><user-id>`. The prefix comes from
//! configuration (`bus.user_topic`, default `/to/user/`).

use crate::ids::UserId;

/// Maps user ids to delivery topics and back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserTopic {
    prefix: String,
}

impl UserTopic {
    /// Create a topic scheme with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Delivery topic for a user.
    pub fn for_user(&self, user: &UserId) -> String {
        format!("{}{}", self.prefix, user)
    }

    /// Pattern that matches every user's delivery topic.
    pub fn pattern(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Extract the user id from a delivery topic.
    ///
    /// Returns `None` when the topic does not carry the prefix or the
    /// remainder is empty.
    pub fn user_of(&self, topic: &str) -> Option<UserId> {
        topic
            .strip_prefix(self.prefix.as_str())
            .filter(|rest| !rest.is_empty())
            .map(UserId::from)
    }
}

impl Default for UserTopic {
    fn default() -> Self {
        Self::new("/to/user/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_user_topic() {
        let t = UserTopic::default();
        assert_eq!(t.for_user(&UserId::from("u1")), "/to/user/u1");
    }

    #[test]
    fn pattern_covers_prefix() {
        assert_eq!(UserTopic::new("inbox.").pattern(), "inbox.*");
    }

    #[test]
    fn extracts_user_from_topic() {
        let t = UserTopic::default();
        assert_eq!(t.user_of("/to/user/u42"), Some(UserId::from("u42")));
    }

    #[test]
    fn foreign_topic_has_no_user() {
        let t = UserTopic::default();
        assert_eq!(t.user_of("/to/group/u42"), None);
        assert_eq!(t.user_of("/to/user/"), None);
    }

    #[test]
    fn custom_prefix_round_trips() {
        let t = UserTopic::new("users:");
        let topic = t.for_user(&UserId::from("alice"));
        assert_eq!(topic, "users:alice");
        assert_eq!(t.user_of(&topic).unwrap().as_str(), "alice");
    }
}
