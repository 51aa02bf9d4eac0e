use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable, backend-assigned message identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated identifier of a message that has not been confirmed yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of an entry in a message list.
///
/// An entry starts as `Provisional` when the user sends it and is promoted to
/// `Durable` once the send operation returns the backend id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageKey {
    Provisional(ProvisionalId),
    Durable(MessageId),
}

impl MessageKey {
    pub fn durable(&self) -> Option<MessageId> {
        match self {
            Self::Durable(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => write!(f, "{id}"),
            Self::Durable(id) => write!(f, "{id}"),
        }
    }
}

/// A unit of push subscription: one conversation, one thread, or the
/// process-wide profile feed.
///
/// On the wire a scope is its topic string, e.g. `conversation:<uuid>`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Conversation(ChannelId),
    Thread(MessageId),
    Profiles,
}

impl Scope {
    pub fn to_topic(&self) -> String {
        match self {
            Self::Conversation(id) => format!("conversation:{}", id.0),
            Self::Thread(id) => format!("thread:{}", id.0),
            Self::Profiles => "profiles".to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_topic())
    }
}

impl FromStr for Scope {
    type Err = ProtocolError;

    fn from_str(topic: &str) -> Result<Self, Self::Err> {
        if topic == "profiles" {
            return Ok(Self::Profiles);
        }

        let (kind, key) = topic
            .split_once(':')
            .ok_or_else(|| ProtocolError::UnknownTopic(topic.to_string()))?;
        let uuid =
            Uuid::parse_str(key).map_err(|_| ProtocolError::UnknownTopic(topic.to_string()))?;

        match kind {
            "conversation" => Ok(Self::Conversation(ChannelId(uuid))),
            "thread" => Ok(Self::Thread(MessageId(uuid))),
            _ => Err(ProtocolError::UnknownTopic(topic.to_string())),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_topic_roundtrip() {
        let channel = ChannelId::new();
        let scope = Scope::Conversation(channel);
        let parsed: Scope = scope.to_topic().parse().unwrap();
        assert_eq!(parsed, scope);

        assert_eq!("profiles".parse::<Scope>().unwrap(), Scope::Profiles);
    }

    #[test]
    fn test_scope_rejects_unknown_topic() {
        assert!("channel:not-a-uuid".parse::<Scope>().is_err());
        assert!("dm:6d3f1a8e-0f43-4c55-9a40-3f0b9a3c2f11".parse::<Scope>().is_err());
        assert!("".parse::<Scope>().is_err());
    }

    #[test]
    fn test_message_key_durable() {
        let id = MessageId::new();
        assert_eq!(MessageKey::Durable(id).durable(), Some(id));
        assert!(MessageKey::Provisional(ProvisionalId::new()).is_provisional());
    }
}
