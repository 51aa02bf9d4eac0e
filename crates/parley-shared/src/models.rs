//! Domain model structs shared by the sync core and its collaborators.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can travel over
//! the change-event channel or be handed to the UI layer as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::PLACEHOLDER_DISPLAY_NAME;
use crate::types::{ChannelId, MessageId, MessageKey, ProvisionalId, UserId};

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// File attached to a message. The bytes live in external object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A persisted message row as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    /// Durable message identifier.
    pub id: MessageId,
    /// The channel (or DM) this message belongs to.
    pub channel_id: ChannelId,
    /// The user who wrote the message.
    pub author_id: UserId,
    /// Message text.
    pub body: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Server-side creation time.
    pub created_at: DateTime<Utc>,
    /// `None` for top-level messages, the thread root for replies.
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    /// Replies in creation order. Only populated for top-level messages.
    #[serde(default)]
    pub reply_ids: Vec<MessageId>,
}

/// An entry of a conversation or thread list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<MessageId>,
    pub reply_ids: Vec<MessageId>,
}

impl Message {
    pub fn durable_id(&self) -> Option<MessageId> {
        self.key.durable()
    }

    pub fn is_provisional(&self) -> bool {
        self.key.is_provisional()
    }

    /// Overwrite the row-backed fields with a fresher copy of the same row.
    ///
    /// Returns `true` if anything changed. `reply_ids` are merged, not
    /// replaced, since replies seen locally may not be in the row yet.
    pub fn apply_row(&mut self, row: &MessageRow) -> bool {
        let mut changed = false;

        if self.body != row.body {
            self.body = row.body.clone();
            changed = true;
        }
        if self.attachment != row.attachment {
            self.attachment = row.attachment.clone();
            changed = true;
        }
        if self.created_at != row.created_at {
            self.created_at = row.created_at;
            changed = true;
        }
        if self.author_id != row.author_id {
            self.author_id = row.author_id;
            changed = true;
        }
        for reply in &row.reply_ids {
            if !self.reply_ids.contains(reply) {
                self.reply_ids.push(*reply);
                changed = true;
            }
        }

        changed
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            key: MessageKey::Durable(row.id),
            channel_id: row.channel_id,
            author_id: row.author_id,
            body: row.body,
            attachment: row.attachment,
            created_at: row.created_at,
            parent_id: row.parent_id,
            reply_ids: row.reply_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

/// What the user typed. The owning stream decides the thread parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Request handed to the send collaborator for one optimistic entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    pub provisional_id: ProvisionalId,
    pub channel_id: ChannelId,
    pub parent_id: Option<MessageId>,
    pub author_id: UserId,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Authoritative response of a successful send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Denormalized user profile attached to rendered messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Identifier at the external auth provider, if any.
    #[serde(default)]
    pub external_auth_id: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Set only by [`Profile::placeholder`]. Profiles from the backend or
    /// the push channel never carry it.
    #[serde(skip)]
    pub placeholder: bool,
}

impl Profile {
    /// Stand-in for a sender whose profile is missing or failed to load.
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: PLACEHOLDER_DISPLAY_NAME.to_string(),
            email: None,
            external_auth_id: None,
            avatar_url: None,
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            channel_id: ChannelId::new(),
            author_id: UserId::new(),
            body: "hello".to_string(),
            attachment: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 8, 14, 30, 0).unwrap(),
            parent_id: None,
            reply_ids: Vec::new(),
        }
    }

    #[test]
    fn test_message_from_row_is_durable() {
        let row = row();
        let id = row.id;
        let message = Message::from(row);
        assert_eq!(message.durable_id(), Some(id));
        assert!(!message.is_provisional());
    }

    #[test]
    fn test_apply_row_overwrites_and_merges_replies() {
        let original = row();
        let mut message = Message::from(original.clone());
        let local_reply = MessageId::new();
        message.reply_ids.push(local_reply);

        let mut fresher = original.clone();
        fresher.body = "hello (edited)".to_string();
        fresher.reply_ids = vec![MessageId::new()];

        assert!(message.apply_row(&fresher));
        assert_eq!(message.body, "hello (edited)");
        assert_eq!(message.reply_ids.len(), 2);
        assert_eq!(message.reply_ids[0], local_reply);

        assert!(!message.apply_row(&fresher));
    }

    #[test]
    fn test_placeholder_profile() {
        let user = UserId::new();
        let profile = Profile::placeholder(user);
        assert_eq!(profile.display_name, "removed user");
        assert!(profile.is_placeholder());
    }

    #[test]
    fn test_user_named_like_placeholder_is_real() {
        let namesake = Profile {
            user_id: UserId::new(),
            display_name: PLACEHOLDER_DISPLAY_NAME.to_string(),
            email: None,
            external_auth_id: None,
            avatar_url: None,
            placeholder: false,
        };
        assert!(!namesake.is_placeholder());

        let json = serde_json::to_string(&Profile::placeholder(UserId::new())).unwrap();
        let decoded: Profile = serde_json::from_str(&json).unwrap();
        assert!(!decoded.is_placeholder());
        assert_eq!(decoded.display_name, PLACEHOLDER_DISPLAY_NAME);
    }
}
