//! In-process backend and push transport.
//!
//! [`Loopback`] stores messages and profiles in memory, implements the
//! collaborator traits, and publishes every write as a change event on an
//! internal feed. [`Loopback::spawn_transport`] starts a transport actor
//! that forwards the feed to one engine, filtered by that engine's
//! subscriptions. Several transports may share one backend.
//!
//! Failure injection (rejected sends, refused subscriptions, slow loads,
//! dropped connections, raw payloads) makes it usable for tests and demos.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use parley_shared::error::{FetchError, SendError};
use parley_shared::events::{ChangeEvent, ChangeKind};
use parley_shared::models::{MessageRow, Profile, SendReceipt, SendRequest};
use parley_shared::types::{MessageId, Scope, UserId};
use parley_sync::backend::{
    MessageLoader, MessageSender, ProfileFetcher, TransportCommand, TransportEvent,
};
use parley_sync::clock::Clock;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Feed {
    Change(ChangeEvent),
    /// Delivered as-is to every transport, subscribed or not.
    Raw(Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct Store {
    messages: Vec<MessageRow>,
    profiles: HashMap<UserId, Profile>,
    reject_sends: usize,
    refuse_subscribes: usize,
    fail_loads: usize,
    /// Loads currently waiting on the load gate.
    held_loads: usize,
}

struct Inner {
    store: Mutex<Store>,
    feed: broadcast::Sender<Feed>,
    /// `true` while loads are held back after reading the store.
    load_gate: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, feed: Feed) {
        // No receivers just means no transport is running.
        let _ = self.feed.send(feed);
    }

    fn publish_message(&self, kind: ChangeKind, row: &MessageRow) {
        self.publish(Feed::Change(ChangeEvent::message(
            Scope::Conversation(row.channel_id),
            kind,
            row.clone(),
        )));
        if let Some(parent) = row.parent_id {
            self.publish(Feed::Change(ChangeEvent::message(
                Scope::Thread(parent),
                kind,
                row.clone(),
            )));
        }
    }

    /// Store a row, linking it to its parent. Returns the updated parent.
    fn store_message(&self, row: MessageRow) -> Option<MessageRow> {
        let mut store = self.store();
        let parent = row.parent_id.and_then(|parent_id| {
            let parent = store.messages.iter_mut().find(|m| m.id == parent_id)?;
            if !parent.reply_ids.contains(&row.id) {
                parent.reply_ids.push(row.id);
            }
            Some(parent.clone())
        });
        store.messages.push(row);
        parent
    }

    fn take_subscribe_refusal(&self) -> bool {
        let mut store = self.store();
        if store.refuse_subscribes > 0 {
            store.refuse_subscribes -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory backend. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Loopback {
    inner: Arc<Inner>,
}

impl Loopback {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (load_gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store::default()),
                feed,
                load_gate,
                clock,
            }),
        }
    }

    /// Store rows without publishing anything, as if they were written
    /// before this session or while the push channel was down.
    pub fn seed_messages(&self, rows: impl IntoIterator<Item = MessageRow>) {
        for row in rows {
            self.inner.store_message(row);
        }
    }

    /// Store a row written by another client and publish it.
    pub fn insert_remote(&self, row: MessageRow) {
        debug!(id = %row.id, channel = %row.channel_id, "Remote message inserted");
        let parent = self.inner.store_message(row.clone());
        self.inner.publish_message(ChangeKind::Insert, &row);
        if let Some(parent) = parent {
            self.inner.publish_message(ChangeKind::Update, &parent);
        }
    }

    /// Overwrite a stored row and publish an update.
    pub fn update_remote(&self, row: MessageRow) {
        {
            let mut store = self.inner.store();
            match store.messages.iter_mut().find(|m| m.id == row.id) {
                Some(existing) => *existing = row.clone(),
                None => store.messages.push(row.clone()),
            }
        }
        self.inner.publish_message(ChangeKind::Update, &row);
    }

    /// Store a profile without publishing.
    pub fn seed_profile(&self, profile: Profile) {
        self.inner.store().profiles.insert(profile.user_id, profile);
    }

    /// Store a profile and publish the change on the profile feed.
    pub fn put_profile(&self, profile: Profile) {
        let kind = match self
            .inner
            .store()
            .profiles
            .insert(profile.user_id, profile.clone())
        {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        self.inner.publish(Feed::Change(ChangeEvent::profile(kind, profile)));
    }

    pub fn messages(&self) -> Vec<MessageRow> {
        self.inner.store().messages.clone()
    }

    /// Make the next `count` sends fail.
    pub fn reject_next_sends(&self, count: usize) {
        self.inner.store().reject_sends = count;
    }

    /// Make the next `count` subscribe commands fail.
    pub fn refuse_next_subscribes(&self, count: usize) {
        self.inner.store().refuse_subscribes = count;
    }

    /// Make the next `count` message loads fail.
    pub fn fail_next_loads(&self, count: usize) {
        self.inner.store().fail_loads = count;
    }

    /// Hold every load after it has read the store, so its rows go stale
    /// while writes keep being published.
    pub fn hold_loads(&self) {
        self.inner.load_gate.send_replace(true);
    }

    pub fn release_loads(&self) {
        self.inner.load_gate.send_replace(false);
    }

    /// Number of loads waiting in [`hold_loads`](Self::hold_loads).
    pub fn held_loads(&self) -> usize {
        self.inner.store().held_loads
    }

    /// Drop every transport connection. Transports report
    /// [`TransportEvent::Disconnected`] and forget their subscriptions.
    pub fn disconnect(&self) {
        info!("Simulating push channel disconnect");
        self.inner.publish(Feed::Disconnect);
    }

    /// Deliver an arbitrary payload to every transport.
    pub fn inject_raw(&self, payload: Vec<u8>) {
        self.inner.publish(Feed::Raw(payload));
    }

    /// Start a transport actor for one engine.
    ///
    /// Returns the command sender and notification receiver to hand to the
    /// engine. The actor stops when the command sender is dropped.
    pub fn spawn_transport(
        &self,
        capacity: usize,
    ) -> (mpsc::Sender<TransportCommand>, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(capacity);
        let mut feed = self.inner.feed.subscribe();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut subscribed: HashSet<Scope> = HashSet::new();

            loop {
                let event = tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TransportCommand::Subscribe(scope)) => {
                            if inner.take_subscribe_refusal() {
                                debug!(scope = %scope, "Refusing subscription");
                                TransportEvent::SubscribeFailed {
                                    scope,
                                    reason: "refused by loopback".to_string(),
                                }
                            } else {
                                subscribed.insert(scope);
                                TransportEvent::Subscribed(scope)
                            }
                        }
                        Some(TransportCommand::Unsubscribe(scope)) => {
                            subscribed.remove(&scope);
                            continue;
                        }
                        None => {
                            debug!("Command channel closed, stopping loopback transport");
                            break;
                        }
                    },

                    item = feed.recv() => match item {
                        Ok(Feed::Change(change)) => {
                            if !subscribed.contains(&change.scope) {
                                continue;
                            }
                            match change.to_bytes() {
                                Ok(bytes) => TransportEvent::Change(bytes),
                                Err(e) => {
                                    warn!(error = %e, "Failed to encode change event");
                                    continue;
                                }
                            }
                        }
                        Ok(Feed::Raw(bytes)) => TransportEvent::Change(bytes),
                        Ok(Feed::Disconnect) => {
                            subscribed.clear();
                            TransportEvent::Disconnected
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Events were lost: the engine must resync.
                            warn!(missed, "Loopback transport lagged, dropping connection");
                            subscribed.clear();
                            TransportEvent::Disconnected
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if event_tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping loopback transport");
                    break;
                }
            }
        });

        (cmd_tx, event_rx)
    }
}

#[async_trait]
impl MessageSender for Loopback {
    async fn send_message(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        {
            let mut store = self.inner.store();
            if store.reject_sends > 0 {
                store.reject_sends -= 1;
                return Err(SendError::Rejected("injected failure".to_string()));
            }
        }

        let row = MessageRow {
            id: MessageId::new(),
            channel_id: request.channel_id,
            author_id: request.author_id,
            body: request.body.clone(),
            attachment: request.attachment.clone(),
            created_at: self.inner.clock.now(),
            parent_id: request.parent_id,
            reply_ids: Vec::new(),
        };
        let receipt = SendReceipt {
            id: row.id,
            created_at: row.created_at,
        };

        debug!(id = %row.id, provisional = %request.provisional_id, "Message persisted");
        let parent = self.inner.store_message(row.clone());
        self.inner.publish_message(ChangeKind::Insert, &row);
        if let Some(parent) = parent {
            self.inner.publish_message(ChangeKind::Update, &parent);
        }

        Ok(receipt)
    }
}

#[async_trait]
impl MessageLoader for Loopback {
    async fn load_messages(&self, scope: Scope) -> Result<Vec<MessageRow>, FetchError> {
        let rows: Vec<MessageRow> = {
            let mut store = self.inner.store();
            if store.fail_loads > 0 {
                store.fail_loads -= 1;
                return Err(FetchError::Backend("injected failure".to_string()));
            }

            store
                .messages
                .iter()
                .filter(|row| match scope {
                    Scope::Conversation(channel) => {
                        row.channel_id == channel && row.parent_id.is_none()
                    }
                    Scope::Thread(parent) => row.parent_id == Some(parent),
                    Scope::Profiles => false,
                })
                .cloned()
                .collect()
        };

        let mut gate = self.inner.load_gate.subscribe();
        let held = *gate.borrow();
        if held {
            debug!(scope = %scope, rows = rows.len(), "Holding load");
            self.inner.store().held_loads += 1;
            let _ = gate.wait_for(|held| !*held).await;
            self.inner.store().held_loads -= 1;
        }
        Ok(rows)
    }
}

#[async_trait]
impl ProfileFetcher for Loopback {
    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<Profile>, FetchError> {
        Ok(self.inner.store().profiles.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_shared::types::{ChannelId, ProvisionalId};
    use parley_sync::clock::SystemClock;

    fn loopback() -> Loopback {
        Loopback::new(Arc::new(SystemClock))
    }

    fn row(channel: ChannelId, parent: Option<MessageId>) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            channel_id: channel,
            author_id: UserId::new(),
            body: "hi".to_string(),
            attachment: None,
            created_at: Utc::now(),
            parent_id: parent,
            reply_ids: Vec::new(),
        }
    }

    fn request(channel: ChannelId, parent: Option<MessageId>) -> SendRequest {
        SendRequest {
            provisional_id: ProvisionalId::new(),
            channel_id: channel,
            parent_id: parent,
            author_id: UserId::new(),
            body: "sent".to_string(),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn test_send_persists_and_links_reply() {
        let backend = loopback();
        let channel = ChannelId::new();
        let parent = row(channel, None);
        backend.seed_messages([parent.clone()]);

        let receipt = backend
            .send_message(&request(channel, Some(parent.id)))
            .await
            .unwrap();

        let top = backend
            .load_messages(Scope::Conversation(channel))
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].reply_ids, vec![receipt.id]);

        let replies = backend.load_messages(Scope::Thread(parent.id)).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, receipt.id);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = loopback();
        let channel = ChannelId::new();

        backend.reject_next_sends(1);
        assert!(backend.send_message(&request(channel, None)).await.is_err());
        assert!(backend.send_message(&request(channel, None)).await.is_ok());

        backend.fail_next_loads(1);
        let scope = Scope::Conversation(channel);
        assert!(backend.load_messages(scope).await.is_err());
        assert_eq!(backend.load_messages(scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_held_load_returns_rows_read_before_release() {
        let backend = loopback();
        let channel = ChannelId::new();
        let original = row(channel, None);
        backend.seed_messages([original.clone()]);
        backend.hold_loads();

        let load = tokio::spawn({
            let backend = backend.clone();
            async move { backend.load_messages(Scope::Conversation(channel)).await }
        });
        while backend.held_loads() == 0 {
            tokio::task::yield_now().await;
        }

        let mut edited = original.clone();
        edited.body = "edited".to_string();
        backend.update_remote(edited);
        backend.release_loads();

        let rows = load.await.unwrap().unwrap();
        assert_eq!(rows[0].body, "hi");
        assert_eq!(backend.messages()[0].body, "edited");
        assert_eq!(backend.held_loads(), 0);
    }

    #[tokio::test]
    async fn test_transport_filters_by_subscription() {
        let backend = loopback();
        let (cmd_tx, mut event_rx) = backend.spawn_transport(16);
        let watched = ChannelId::new();
        let scope = Scope::Conversation(watched);

        cmd_tx.send(TransportCommand::Subscribe(scope)).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(TransportEvent::Subscribed(scope)));

        backend.insert_remote(row(ChannelId::new(), None));
        let mine = row(watched, None);
        backend.insert_remote(mine.clone());

        match event_rx.recv().await {
            Some(TransportEvent::Change(bytes)) => {
                let event = ChangeEvent::from_bytes(&bytes).unwrap();
                assert_eq!(event.scope, scope);
            }
            other => panic!("unexpected transport event: {other:?}"),
        }

        backend.disconnect();
        assert_eq!(event_rx.recv().await, Some(TransportEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_transport_refuses_on_request() {
        let backend = loopback();
        let (cmd_tx, mut event_rx) = backend.spawn_transport(16);
        backend.refuse_next_subscribes(1);

        cmd_tx
            .send(TransportCommand::Subscribe(Scope::Profiles))
            .await
            .unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(TransportEvent::SubscribeFailed { .. })
        ));

        cmd_tx
            .send(TransportCommand::Subscribe(Scope::Profiles))
            .await
            .unwrap();
        assert_eq!(
            event_rx.recv().await,
            Some(TransportEvent::Subscribed(Scope::Profiles))
        );
    }
}
