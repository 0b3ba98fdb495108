use std::fmt;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Stable 64-bit user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable 64-bit group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally (roughly) monotonic message identifier, assigned by IDGen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation address. Derived deterministically from kind + participants
/// per spec §3, never generated randomly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConversationId {
    /// `"single_" + hash16(min(u1,u2) + "_" + max(u1,u2))`.
    pub fn single(u1: UserId, u2: UserId) -> Self {
        let (lo, hi) = if u1 <= u2 { (u1, u2) } else { (u2, u1) };
        Self(format!("single_{}", hash16(&format!("{lo}_{hi}"))))
    }

    /// `"group_" + group_id`.
    pub fn group(group_id: GroupId) -> Self {
        Self(format!("group_{group_id}"))
    }

    /// The one constant world conversation.
    pub fn world() -> Self {
        Self("world".to_string())
    }

    pub fn is_world(&self) -> bool {
        self.0 == "world"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Conversation kind, used by routing decisions in Logic (spec §4.2 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Single,
    Group,
    World,
}

impl ConversationKind {
    /// Infer the kind from a conversation id's well-known prefix.
    pub fn of(conversation_id: &ConversationId) -> Self {
        let s = conversation_id.as_str();
        if s == "world" {
            ConversationKind::World
        } else if let Some(rest) = s.strip_prefix("group_") {
            debug_assert!(!rest.is_empty());
            ConversationKind::Group
        } else {
            ConversationKind::Single
        }
    }
}

/// 16-hex-char FNV-1a digest. Spec leaves the hash function unspecified
/// (Open Question); FNV-1a is picked for being dependency-light and stable
/// across platforms — see DESIGN.md.
pub fn hash16(input: &str) -> String {
    use std::hash::Hasher;
    let mut hasher = FnvHasher::default();
    hasher.write(input.as_bytes());
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_conversation_id_is_order_independent() {
        let a = ConversationId::single(UserId(100), UserId(200));
        let b = ConversationId::single(UserId(200), UserId(100));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("single_"));
    }

    #[test]
    fn group_conversation_id_embeds_group_id() {
        let id = ConversationId::group(GroupId(7));
        assert_eq!(id.as_str(), "group_7");
        assert_eq!(ConversationKind::of(&id), ConversationKind::Group);
    }

    #[test]
    fn world_conversation_is_constant() {
        let id = ConversationId::world();
        assert_eq!(id.as_str(), "world");
        assert!(id.is_world());
        assert_eq!(ConversationKind::of(&id), ConversationKind::World);
    }

    #[test]
    fn hash16_is_stable_and_fixed_width() {
        let h1 = hash16("100_200");
        let h2 = hash16("100_200");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }
}
