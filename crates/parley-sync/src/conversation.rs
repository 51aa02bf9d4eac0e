//! Message list of one channel or DM.
//!
//! Holds top-level messages only. Replies posted in the channel do not enter
//! the list; they are recorded in their parent's `reply_ids`.

use parley_shared::models::MessageRow;
use parley_shared::types::{ChannelId, MessageId, Scope};

use crate::stream::{MessageStream, StreamScope};

pub type ConversationStream = MessageStream<ChannelId>;

impl StreamScope for ChannelId {
    fn scope(&self) -> Scope {
        Scope::Conversation(*self)
    }

    fn parent_id(&self) -> Option<MessageId> {
        None
    }

    fn owns(&self, row: &MessageRow) -> bool {
        row.channel_id == *self && row.parent_id.is_none()
    }

    fn tracks_replies(&self) -> bool {
        true
    }
}
