use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{MessageRow, Profile};
use crate::types::Scope;

/// Row-level change reported by the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Scope the event was published on.
    pub scope: Scope,
    pub kind: ChangeKind,
    pub row: ChangeRow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum ChangeRow {
    Message(MessageRow),
    Profile(Profile),
}

impl ChangeEvent {
    pub fn message(scope: Scope, kind: ChangeKind, row: MessageRow) -> Self {
        Self {
            scope,
            kind,
            row: ChangeRow::Message(row),
        }
    }

    pub fn profile(kind: ChangeKind, profile: Profile) -> Self {
        Self {
            scope: Scope::Profiles,
            kind,
            row: ChangeRow::Profile(profile),
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate an event.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_slice(data)?;
        event.validate()?;
        Ok(event)
    }

    /// Check that the row can belong to the scope it was published on.
    ///
    /// A conversation feed carries its top-level messages and the replies
    /// posted in it; a thread feed carries only replies to its root.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mismatch = |reason: &str| ProtocolError::ScopeMismatch {
            scope: self.scope,
            reason: reason.to_string(),
        };

        match (&self.scope, &self.row) {
            (Scope::Conversation(channel), ChangeRow::Message(row)) => {
                if row.channel_id != *channel {
                    return Err(mismatch("message from another channel"));
                }
            }
            (Scope::Thread(parent), ChangeRow::Message(row)) => {
                if row.parent_id != Some(*parent) {
                    return Err(mismatch("message is not a reply to this thread"));
                }
            }
            (Scope::Profiles, ChangeRow::Profile(_)) => {}
            (Scope::Profiles, ChangeRow::Message(_)) => {
                return Err(mismatch("message row on the profile feed"));
            }
            (_, ChangeRow::Profile(_)) => {
                return Err(mismatch("profile row on a message feed"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, MessageId, UserId};
    use chrono::Utc;

    fn row(channel_id: ChannelId, parent_id: Option<MessageId>) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            channel_id,
            author_id: UserId::new(),
            body: "hi".to_string(),
            attachment: None,
            created_at: Utc::now(),
            parent_id,
            reply_ids: Vec::new(),
        }
    }

    #[test]
    fn test_change_event_wire_format() {
        let channel = ChannelId::new();
        let event = ChangeEvent::message(
            Scope::Conversation(channel),
            ChangeKind::Insert,
            row(channel, None),
        );

        let json: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["scope"], format!("conversation:{}", channel.0));
        assert_eq!(json["kind"], "insert");
        assert_eq!(json["row"]["table"], "message");
        assert_eq!(json["row"]["record"]["body"], "hi");

        let restored = ChangeEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            ChangeEvent::from_bytes(b"{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(ChangeEvent::from_bytes(br#"{"scope":"nowhere","kind":"insert"}"#).is_err());
    }

    #[test]
    fn test_rejects_row_from_other_scope() {
        let event = ChangeEvent::message(
            Scope::Conversation(ChannelId::new()),
            ChangeKind::Insert,
            row(ChannelId::new(), None),
        );
        assert!(matches!(
            event.validate(),
            Err(ProtocolError::ScopeMismatch { .. })
        ));

        let parent = MessageId::new();
        let channel = ChannelId::new();
        let reply = ChangeEvent::message(
            Scope::Thread(parent),
            ChangeKind::Insert,
            row(channel, Some(parent)),
        );
        assert!(reply.validate().is_ok());

        let stray = ChangeEvent::message(
            Scope::Thread(parent),
            ChangeKind::Insert,
            row(channel, None),
        );
        assert!(stray.validate().is_err());
    }
}
