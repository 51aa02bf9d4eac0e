//! Ordered, de-duplicated message list.
//!
//! Entries are sorted by `created_at` ascending; entries with equal
//! timestamps keep insertion order. No two entries share a durable id.

use parley_shared::models::{Message, MessageRow, SendReceipt};
use parley_shared::types::{MessageId, MessageKey, ProvisionalId};

/// Effect of applying a row to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new entry was inserted at this index.
    Inserted(usize),
    /// An existing entry changed and now sits at this index.
    Updated(usize),
    /// The row was already present with identical content.
    Unchanged,
}

/// Effect of promoting a provisional entry with the send response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The provisional entry now carries the durable id, at this index.
    Promoted(usize),
    /// The durable row was already present (its push event won the race);
    /// the provisional entry was dropped.
    Merged,
    /// No such provisional entry (rolled back or torn down).
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        self.entries.iter().position(|m| m.key == *key)
    }

    pub fn position_durable(&self, id: MessageId) -> Option<usize> {
        self.position(&MessageKey::Durable(id))
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.position(key).map(|i| &self.entries[i])
    }

    /// Index after every entry created at or before `message`.
    fn insertion_point(&self, message: &Message) -> usize {
        self.entries
            .partition_point(|m| m.created_at <= message.created_at)
    }

    fn insert_sorted(&mut self, message: Message) -> usize {
        let index = self.insertion_point(&message);
        self.entries.insert(index, message);
        index
    }

    /// Move entry `index` if its timestamp no longer fits between its
    /// neighbours. Returns the new index.
    fn reposition(&mut self, index: usize) -> usize {
        let created_at = self.entries[index].created_at;
        let before_ok = index == 0 || self.entries[index - 1].created_at <= created_at;
        let after_ok =
            index + 1 == self.entries.len() || created_at <= self.entries[index + 1].created_at;

        if before_ok && after_ok {
            return index;
        }

        let message = self.entries.remove(index);
        self.insert_sorted(message)
    }

    /// Append a local entry at the tail.
    ///
    /// Its timestamp is clamped to the current tail so a skewed local clock
    /// cannot break ordering.
    pub fn push_local(&mut self, mut message: Message) -> usize {
        if let Some(last) = self.entries.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        self.entries.push(message);
        self.entries.len() - 1
    }

    /// Insert an unknown row at its sorted position, or overwrite the
    /// existing entry with the same durable id (last write wins).
    pub fn upsert(&mut self, row: &MessageRow) -> Applied {
        match self.position_durable(row.id) {
            Some(index) => {
                if self.entries[index].apply_row(row) {
                    Applied::Updated(self.reposition(index))
                } else {
                    Applied::Unchanged
                }
            }
            None => Applied::Inserted(self.insert_sorted(Message::from(row.clone()))),
        }
    }

    /// Replace a provisional entry with its durable identity.
    pub fn promote(&mut self, provisional_id: ProvisionalId, receipt: SendReceipt) -> Promotion {
        let Some(index) = self.position(&MessageKey::Provisional(provisional_id)) else {
            return Promotion::Missing;
        };

        if self.position_durable(receipt.id).is_some() {
            self.entries.remove(index);
            return Promotion::Merged;
        }

        let entry = &mut self.entries[index];
        entry.key = MessageKey::Durable(receipt.id);
        entry.created_at = receipt.created_at;
        Promotion::Promoted(self.reposition(index))
    }

    pub fn remove(&mut self, key: &MessageKey) -> Option<Message> {
        let index = self.position(key)?;
        Some(self.entries.remove(index))
    }

    /// Record `reply` in the reply list of `parent`. Returns `false` if the
    /// parent is not in the log or already lists the reply.
    pub fn attach_reply(&mut self, parent: MessageId, reply: MessageId) -> bool {
        let Some(index) = self.position_durable(parent) else {
            return false;
        };

        let replies = &mut self.entries[index].reply_ids;
        if replies.contains(&reply) {
            return false;
        }
        replies.push(reply);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at)
    }
}
