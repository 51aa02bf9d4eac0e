//! Optimistic-insert + server-reconciliation over a [`MessageLog`].
//!
//! [`MessageStream`] implements the algorithm once; the scope type decides
//! which rows belong to the list. See [`crate::conversation`] and
//! [`crate::thread`].
//!
//! Reconciliation policy: the send operation's own response is
//! authoritative. When it returns, the provisional entry takes the durable
//! id in place; the later push echo for that id is then a duplicate and is
//! de-duplicated by id. If the echo wins the race, the provisional entry is
//! dropped when the response arrives.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use parley_shared::events::ChangeKind;
use parley_shared::models::{Message, MessageDraft, MessageRow, SendReceipt, SendRequest};
use parley_shared::types::{MessageId, MessageKey, ProvisionalId, Scope};

use crate::clock::Clock;
use crate::message_log::{Applied, MessageLog, Promotion};

/// Which rows a stream holds.
pub trait StreamScope: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn scope(&self) -> Scope;

    /// Thread root assigned to locally sent messages.
    fn parent_id(&self) -> Option<MessageId>;

    /// Whether `row` is an entry of this list.
    fn owns(&self, row: &MessageRow) -> bool;

    /// Whether replies to entries of this list update their reply ids.
    fn tracks_replies(&self) -> bool;
}

/// How the view should move its scroll position after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollAnchor {
    /// Nothing was added or removed.
    #[default]
    Keep,
    /// First load: jump to the newest entry without animation.
    Jump,
    /// The list grew or shrank after the first load: animate to the newest
    /// entry.
    Animate,
}

/// What a view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    /// Bumped on every published change.
    pub revision: u64,
    pub messages: Vec<Message>,
    pub scroll: ScrollAnchor,
}

/// Position in a stream's sequence of push events, taken when a load is
/// issued. Rows of that load never overwrite entries written by a later
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LoadMark(u64);

pub struct MessageStream<S: StreamScope> {
    scope: S,
    log: MessageLog,
    /// Push events applied so far.
    events: u64,
    /// Event sequence number of the last push write per durable id.
    touched: HashMap<MessageId, u64>,
    clock: Arc<dyn Clock>,
    /// Set once a non-empty seed has been applied.
    seeded: bool,
    /// Set once the view has been told to jump to a non-empty list.
    shown: bool,
    revision: u64,
    tx: watch::Sender<StreamSnapshot>,
}

impl<S: StreamScope> MessageStream<S> {
    pub fn new(scope: S, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = watch::channel(StreamSnapshot::default());
        Self {
            scope,
            log: MessageLog::new(),
            events: 0,
            touched: HashMap::new(),
            clock,
            seeded: false,
            shown: false,
            revision: 0,
            tx,
        }
    }

    pub fn scope(&self) -> S {
        self.scope
    }

    /// Receiver of list snapshots, starting with the current one.
    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.tx.subscribe()
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.log.get(key)
    }

    /// Mark to hand back with the rows of a load issued now.
    pub fn load_mark(&self) -> LoadMark {
        LoadMark(self.events)
    }

    /// Apply one loaded row. An entry a push event wrote after `since` is
    /// fresher than the row, so only its reply ids are merged.
    fn apply_loaded(&mut self, since: LoadMark, row: &MessageRow) -> Applied {
        let stale = self.touched.get(&row.id).is_some_and(|seq| *seq > since.0);
        let Some(index) = self.log.position_durable(row.id).filter(|_| stale) else {
            return self.log.upsert(row);
        };

        let mut merged = false;
        for reply in &row.reply_ids {
            merged |= self.log.attach_reply(row.id, *reply);
        }
        trace!(
            scope = %self.scope,
            id = %row.id,
            "Loaded row older than push data, kept event copy"
        );
        if merged {
            Applied::Updated(index)
        } else {
            Applied::Unchanged
        }
    }

    fn publish(&mut self, previous_len: usize) {
        let len = self.log.len();
        let scroll = if len == previous_len {
            ScrollAnchor::Keep
        } else if !self.shown && len > 0 {
            self.shown = true;
            ScrollAnchor::Jump
        } else if self.shown {
            ScrollAnchor::Animate
        } else {
            ScrollAnchor::Keep
        };

        self.revision += 1;
        let snapshot = StreamSnapshot {
            revision: self.revision,
            messages: self.log.messages().to_vec(),
            scroll,
        };
        self.tx.send_replace(snapshot);
    }

    /// Seed the list with the initial fetch.
    ///
    /// Only the first non-empty seed is applied: a late re-fetch must not
    /// clobber entries appended after the initial load. The seed is the
    /// query issued when the stream was created, so entries pushed in the
    /// meantime survive and keep their event payload.
    pub fn initialize(&mut self, rows: Vec<MessageRow>) -> bool {
        if self.seeded {
            debug!(scope = %self.scope, "Stream already seeded, ignoring re-seed");
            return false;
        }

        let scope = self.scope;
        let previous_len = self.log.len();
        let mut applied = 0usize;
        for row in rows.iter().filter(|row| scope.owns(row)) {
            if self.apply_loaded(LoadMark::default(), row) != Applied::Unchanged {
                applied += 1;
            }
        }
        self.seeded = !rows.is_empty();

        info!(scope = %self.scope, rows = rows.len(), applied, "Stream seeded");
        self.publish(previous_len);
        true
    }

    /// Merge a fresh fetch after events may have been lost (reconnect).
    ///
    /// Unlike [`initialize`](Self::initialize) this always applies. Local
    /// provisional entries are kept, and entries pushed after `since` keep
    /// their event payload. Returns how many entries changed.
    pub fn resync(&mut self, since: LoadMark, rows: Vec<MessageRow>) -> usize {
        let previous_len = self.log.len();
        let mut changed = 0usize;

        for row in &rows {
            if self.scope.owns(row) {
                if self.apply_loaded(since, row) != Applied::Unchanged {
                    changed += 1;
                }
            } else if self.track_reply(row).is_some() {
                changed += 1;
            }
        }
        self.seeded |= !rows.is_empty();

        info!(scope = %self.scope, rows = rows.len(), changed, "Stream resynced");
        if changed > 0 {
            self.publish(previous_len);
        }
        changed
    }

    /// Show a locally sent message immediately.
    ///
    /// Returns the request to hand to the send operation; its
    /// `provisional_id` correlates the later [`confirm`](Self::confirm) or
    /// [`rollback`](Self::rollback).
    pub fn append_optimistic(&mut self, draft: MessageDraft) -> SendRequest {
        let provisional_id = ProvisionalId::new();
        let parent_id = self.scope.parent_id();

        let message = Message {
            key: MessageKey::Provisional(provisional_id),
            channel_id: draft.channel_id,
            author_id: draft.author_id,
            body: draft.body,
            attachment: draft.attachment,
            created_at: self.clock.now(),
            parent_id,
            reply_ids: Vec::new(),
        };

        let request = SendRequest {
            provisional_id,
            channel_id: message.channel_id,
            parent_id,
            author_id: message.author_id,
            body: message.body.clone(),
            attachment: message.attachment.clone(),
        };

        let previous_len = self.log.len();
        self.log.push_local(message);
        debug!(scope = %self.scope, provisional = %provisional_id, "Optimistic message appended");
        self.publish(previous_len);

        request
    }

    /// Promote a provisional entry with the send response.
    pub fn confirm(&mut self, provisional_id: ProvisionalId, receipt: SendReceipt) -> Promotion {
        let previous_len = self.log.len();
        let promotion = self.log.promote(provisional_id, receipt);

        match promotion {
            Promotion::Promoted(index) => {
                debug!(
                    scope = %self.scope,
                    provisional = %provisional_id,
                    id = %receipt.id,
                    index,
                    "Provisional message confirmed"
                );
                self.publish(previous_len);
            }
            Promotion::Merged => {
                debug!(
                    scope = %self.scope,
                    provisional = %provisional_id,
                    id = %receipt.id,
                    "Push echo arrived first, dropped provisional copy"
                );
                self.publish(previous_len);
            }
            Promotion::Missing => {
                trace!(scope = %self.scope, provisional = %provisional_id, "Nothing to confirm");
            }
        }

        promotion
    }

    /// Remove a provisional entry whose send failed.
    pub fn rollback(&mut self, provisional_id: ProvisionalId) -> bool {
        let previous_len = self.log.len();
        match self.log.remove(&MessageKey::Provisional(provisional_id)) {
            Some(_) => {
                warn!(
                    scope = %self.scope,
                    provisional = %provisional_id,
                    "Send failed, optimistic message rolled back"
                );
                self.publish(previous_len);
                true
            }
            None => false,
        }
    }

    /// Apply one row-level change from the push channel.
    pub fn on_remote_event(&mut self, kind: ChangeKind, row: &MessageRow) -> Applied {
        let previous_len = self.log.len();

        if !self.scope.owns(row) {
            if let Some(index) = self.track_reply(row) {
                debug!(scope = %self.scope, reply = %row.id, index, "Reply attached to parent");
                self.publish(previous_len);
                return Applied::Updated(index);
            }
            debug!(scope = %self.scope, id = %row.id, "Dropping row outside stream scope");
            return Applied::Unchanged;
        }

        self.events += 1;
        self.touched.insert(row.id, self.events);

        let applied = self.log.upsert(row);
        match applied {
            Applied::Inserted(index) => {
                debug!(scope = %self.scope, id = %row.id, index, ?kind, "Remote message inserted");
                self.publish(previous_len);
            }
            Applied::Updated(index) => {
                debug!(scope = %self.scope, id = %row.id, index, ?kind, "Remote message updated");
                self.publish(previous_len);
            }
            Applied::Unchanged => {
                trace!(scope = %self.scope, id = %row.id, ?kind, "Duplicate remote event ignored");
            }
        }
        applied
    }

    /// Record a reply id on its parent entry. Returns `true` and publishes
    /// if the parent was found and did not list it yet.
    pub fn attach_reply(&mut self, parent: MessageId, reply: MessageId) -> bool {
        let previous_len = self.log.len();
        if self.scope.tracks_replies() && self.log.attach_reply(parent, reply) {
            self.publish(previous_len);
            true
        } else {
            false
        }
    }

    /// Attach a reply row to its parent entry, returning the parent's index.
    fn track_reply(&mut self, row: &MessageRow) -> Option<usize> {
        if !self.scope.tracks_replies() {
            return None;
        }
        let parent = row.parent_id?;
        if self.log.attach_reply(parent, row.id) {
            self.log.position_durable(parent)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.tx.borrow().clone()
    }
}

impl<S: StreamScope> fmt::Debug for MessageStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream")
            .field("scope", &self.scope)
            .field("len", &self.log.len())
            .field("seeded", &self.seeded)
            .field("revision", &self.revision)
            .finish()
    }
}
