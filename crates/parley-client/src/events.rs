use serde::Serialize;

use parley_shared::models::Message;
use parley_shared::types::Scope;
use parley_sync::profile_cache::ProfileCache;
use parley_sync::stream::{ScrollAnchor, StreamSnapshot};

pub const EVENT_STREAM_UPDATED: &str = "stream-updated";
pub const EVENT_SEND_FAILED: &str = "send-failed";

#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub timestamp: String,
    pub pending: bool,
    pub reply_count: usize,
    pub attachment: Option<String>,
}

impl MessagePayload {
    /// Render one entry. The sender name comes from the cache only; an
    /// uncached sender shows a short id until its profile arrives.
    pub fn render(message: &Message, profiles: &ProfileCache) -> Self {
        let author_name = profiles
            .peek(message.author_id)
            .map(|profile| profile.display_name)
            .unwrap_or_else(|| message.author_id.short());

        Self {
            id: message.key.to_string(),
            author_id: message.author_id.to_string(),
            author_name,
            body: message.body.clone(),
            timestamp: message.created_at.to_rfc3339(),
            pending: message.is_provisional(),
            reply_count: message.reply_ids.len(),
            attachment: message.attachment.as_ref().map(|a| a.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamUpdatedPayload {
    pub scope: String,
    pub revision: u64,
    pub scroll: &'static str,
    pub messages: Vec<MessagePayload>,
}

impl StreamUpdatedPayload {
    pub fn render(scope: Scope, snapshot: &StreamSnapshot, profiles: &ProfileCache) -> Self {
        let scroll = match snapshot.scroll {
            ScrollAnchor::Keep => "keep",
            ScrollAnchor::Jump => "jump",
            ScrollAnchor::Animate => "animate",
        };

        Self {
            scope: scope.to_topic(),
            revision: snapshot.revision,
            scroll,
            messages: snapshot
                .messages
                .iter()
                .map(|message| MessagePayload::render(message, profiles))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendFailedPayload {
    pub scope: String,
    pub provisional_id: String,
    pub reason: String,
}

/// Encode an event for the UI layer as `{"event": .., "payload": ..}`.
pub fn encode_event<S: Serialize>(event: &str, payload: &S) -> Option<String> {
    let envelope = serde_json::json!({ "event": event, "payload": payload });
    match serde_json::to_string(&envelope) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(event, error = %e, "Failed to encode event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;

    use parley_shared::error::FetchError;
    use parley_shared::models::Profile;
    use parley_shared::types::{ChannelId, MessageId, MessageKey, ProvisionalId, UserId};
    use parley_sync::backend::ProfileFetcher;
    use parley_sync::clock::SystemClock;
    use parley_sync::config::ProfileCacheConfig;

    struct NoProfiles;

    #[async_trait]
    impl ProfileFetcher for NoProfiles {
        async fn fetch_profile(&self, _user_id: UserId) -> Result<Option<Profile>, FetchError> {
            Ok(None)
        }
    }

    fn cache() -> ProfileCache {
        ProfileCache::new(
            Arc::new(NoProfiles),
            Arc::new(SystemClock),
            ProfileCacheConfig::default(),
        )
    }

    fn message(key: MessageKey, author: UserId) -> Message {
        Message {
            key,
            channel_id: ChannelId::new(),
            author_id: author,
            body: "hi".to_string(),
            attachment: None,
            created_at: Utc::now(),
            parent_id: None,
            reply_ids: vec![MessageId::new()],
        }
    }

    #[test]
    fn test_render_uses_cached_name_or_short_id() {
        let profiles = cache();
        let known = UserId::new();
        let unknown = UserId::new();
        profiles.invalidate_from_event(Profile {
            user_id: known,
            display_name: "Ada".to_string(),
            email: None,
            external_auth_id: None,
            avatar_url: None,
            placeholder: false,
        });

        let named = MessagePayload::render(
            &message(MessageKey::Durable(MessageId::new()), known),
            &profiles,
        );
        assert_eq!(named.author_name, "Ada");
        assert!(!named.pending);
        assert_eq!(named.reply_count, 1);

        let anonymous = MessagePayload::render(
            &message(MessageKey::Provisional(ProvisionalId::new()), unknown),
            &profiles,
        );
        assert_eq!(anonymous.author_name, unknown.short());
        assert!(anonymous.pending);
        assert!(anonymous.id.starts_with("local:"));
    }

    #[test]
    fn test_encode_event_envelope() {
        let snapshot = StreamSnapshot {
            revision: 3,
            messages: Vec::new(),
            scroll: ScrollAnchor::Jump,
        };
        let payload = StreamUpdatedPayload::render(Scope::Profiles, &snapshot, &cache());

        let json = encode_event(EVENT_STREAM_UPDATED, &payload).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "stream-updated");
        assert_eq!(value["payload"]["revision"], 3);
        assert_eq!(value["payload"]["scroll"], "jump");
        assert_eq!(value["payload"]["scope"], "profiles");
    }
}
