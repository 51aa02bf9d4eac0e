//! Reply list of one thread, keyed by the thread's root message.

use parley_shared::models::MessageRow;
use parley_shared::types::{MessageId, Scope};

use crate::stream::{MessageStream, StreamScope};

pub type ThreadStream = MessageStream<MessageId>;

impl StreamScope for MessageId {
    fn scope(&self) -> Scope {
        Scope::Thread(*self)
    }

    fn parent_id(&self) -> Option<MessageId> {
        Some(*self)
    }

    fn owns(&self, row: &MessageRow) -> bool {
        row.parent_id == Some(*self)
    }

    fn tracks_replies(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use parley_shared::events::ChangeKind;
    use parley_shared::models::{MessageDraft, SendReceipt};
    use parley_shared::types::{ChannelId, MessageKey, UserId};

    use crate::clock::ManualClock;
    use crate::message_log::{Applied, Promotion};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn reply(channel: ChannelId, parent: MessageId, secs: i64) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            channel_id: channel,
            author_id: UserId::new(),
            body: format!("reply at {secs}"),
            attachment: None,
            created_at: t(secs),
            parent_id: Some(parent),
            reply_ids: Vec::new(),
        }
    }

    fn thread(parent: MessageId) -> ThreadStream {
        ThreadStream::new(parent, Arc::new(ManualClock::new(t(100))))
    }

    #[test]
    fn test_seed_keeps_only_replies_of_this_thread() {
        let channel = ChannelId::new();
        let parent = MessageId::new();
        let mut stream = thread(parent);

        let mut top_level = reply(channel, parent, 1);
        top_level.parent_id = None;
        let other_thread = reply(channel, MessageId::new(), 2);

        stream.initialize(vec![
            reply(channel, parent, 20),
            top_level,
            other_thread,
            reply(channel, parent, 10),
        ]);

        assert_eq!(stream.len(), 2);
        assert_eq!(stream.messages()[0].created_at, t(10));
        assert_eq!(stream.messages()[1].created_at, t(20));
    }

    #[test]
    fn test_local_reply_targets_thread_root() {
        let channel = ChannelId::new();
        let parent = MessageId::new();
        let mut stream = thread(parent);

        let request = stream.append_optimistic(MessageDraft {
            channel_id: channel,
            author_id: UserId::new(),
            body: "on it".to_string(),
            attachment: None,
        });

        assert_eq!(request.parent_id, Some(parent));
        assert_eq!(stream.messages()[0].parent_id, Some(parent));
    }

    #[test]
    fn test_reply_reconciles_like_conversation() {
        let channel = ChannelId::new();
        let parent = MessageId::new();
        let mut stream = thread(parent);
        stream.initialize(vec![reply(channel, parent, 10)]);

        let request = stream.append_optimistic(MessageDraft {
            channel_id: channel,
            author_id: UserId::new(),
            body: "mine".to_string(),
            attachment: None,
        });

        // Someone else's reply lands between the seed and ours.
        let theirs = reply(channel, parent, 50);
        assert_eq!(
            stream.on_remote_event(ChangeKind::Insert, &theirs),
            Applied::Inserted(1)
        );

        let durable = MessageId::new();
        let promotion = stream.confirm(
            request.provisional_id,
            SendReceipt {
                id: durable,
                created_at: t(101),
            },
        );
        assert_eq!(promotion, Promotion::Promoted(2));

        let mut echo = reply(channel, parent, 101);
        echo.id = durable;
        stream.on_remote_event(ChangeKind::Insert, &echo);
        stream.on_remote_event(ChangeKind::Insert, &echo);

        assert_eq!(stream.len(), 3);
        assert_eq!(stream.messages()[2].key, MessageKey::Durable(durable));
    }

    #[test]
    fn test_thread_ignores_nested_reply_tracking() {
        let channel = ChannelId::new();
        let parent = MessageId::new();
        let mut stream = thread(parent);
        let first = reply(channel, parent, 10);
        stream.initialize(vec![first.clone()]);

        assert!(!stream.attach_reply(first.id, MessageId::new()));
        assert!(stream.messages()[0].reply_ids.is_empty());
    }
}
