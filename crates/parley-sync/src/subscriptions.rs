//! Push-channel subscription tracking.
//!
//! Keeps at most one live transport subscription per [`Scope`], shared by
//! ref-counted [`SubscriptionHandle`]s. The last handle to go tears the
//! subscription down. Failed or dropped subscriptions move to
//! [`ScopeState::Error`] and are retried by the owner after the backoff
//! delay this module hands out.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::error::{Result, SyncError};
use parley_shared::events::ChangeEvent;
use parley_shared::types::Scope;

use crate::backend::TransportCommand;
use crate::config::ReconnectConfig;

/// Lifecycle of one scope's push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// No subscription (never opened, or torn down).
    Inactive,
    /// Subscribe command sent, waiting for the transport.
    Subscribing,
    /// Events are flowing.
    Active,
    /// The subscription failed or the connection dropped; a retry is due.
    Error,
}

/// Proof of interest in a scope. Not `Clone`: give it back through
/// [`SubscriptionManager::unsubscribe`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    scope: Scope,
}

impl SubscriptionHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }
}

#[derive(Debug)]
struct Subscription {
    state: ScopeState,
    handles: HashSet<u64>,
    /// Consecutive failures since the last successful subscribe.
    attempts: u32,
    /// Set on failure, cleared once active again.
    recovering: bool,
}

pub struct SubscriptionManager {
    subscriptions: HashMap<Scope, Subscription>,
    cmd_tx: mpsc::Sender<TransportCommand>,
    reconnect: ReconnectConfig,
    next_handle: u64,
}

impl SubscriptionManager {
    pub fn new(cmd_tx: mpsc::Sender<TransportCommand>, reconnect: ReconnectConfig) -> Self {
        Self {
            subscriptions: HashMap::new(),
            cmd_tx,
            reconnect,
            next_handle: 1,
        }
    }

    async fn send(&self, command: TransportCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SyncError::TransportClosed)
    }

    /// Register interest in `scope`, opening the transport subscription if
    /// this is the first handle.
    pub async fn subscribe(&mut self, scope: Scope) -> Result<SubscriptionHandle> {
        let id = self.next_handle;
        self.next_handle += 1;

        if let Some(sub) = self.subscriptions.get_mut(&scope) {
            sub.handles.insert(id);
            debug!(scope = %scope, refs = sub.handles.len(), "Subscription shared");
            return Ok(SubscriptionHandle { id, scope });
        }

        self.send(TransportCommand::Subscribe(scope)).await?;
        self.subscriptions.insert(
            scope,
            Subscription {
                state: ScopeState::Subscribing,
                handles: HashSet::from([id]),
                attempts: 0,
                recovering: false,
            },
        );
        info!(scope = %scope, "Subscribing");
        Ok(SubscriptionHandle { id, scope })
    }

    /// Give a handle back. Returns `true` if it was the last one and the
    /// subscription was torn down.
    pub async fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let scope = handle.scope;
        let Some(sub) = self.subscriptions.get_mut(&scope) else {
            debug!(scope = %scope, "Unsubscribe for unknown scope");
            return false;
        };

        if !sub.handles.remove(&handle.id) {
            debug!(scope = %scope, handle = handle.id, "Unsubscribe with stale handle");
            return false;
        }
        if !sub.handles.is_empty() {
            debug!(scope = %scope, refs = sub.handles.len(), "Subscription released");
            return false;
        }

        self.subscriptions.remove(&scope);
        if let Err(e) = self.send(TransportCommand::Unsubscribe(scope)).await {
            warn!(scope = %scope, error = %e, "Could not send unsubscribe");
        }
        info!(scope = %scope, "Subscription torn down");
        true
    }

    /// The transport confirmed a subscription. Returns `true` if the scope
    /// is recovering from a failure and its contents must be resynced.
    pub fn on_subscribed(&mut self, scope: Scope) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&scope) else {
            debug!(scope = %scope, "Subscribed notification for torn-down scope");
            return false;
        };

        let needs_resync = sub.recovering;
        sub.state = ScopeState::Active;
        sub.attempts = 0;
        sub.recovering = false;
        info!(scope = %scope, needs_resync, "Subscription active");
        needs_resync
    }

    /// The transport refused or lost a subscription. Returns the delay
    /// before [`retry`](Self::retry) should be called, or `None` if nobody
    /// holds the scope any more.
    pub fn on_subscribe_failed(&mut self, scope: Scope, reason: &str) -> Option<Duration> {
        let sub = self.subscriptions.get_mut(&scope)?;
        let delay = Self::fail(sub, &self.reconnect);
        warn!(
            scope = %scope,
            reason,
            attempt = sub.attempts,
            delay_ms = delay.as_millis() as u64,
            "Subscription failed"
        );
        Some(delay)
    }

    /// The connection dropped: every subscription is gone. Returns each
    /// scope with its retry delay.
    pub fn on_disconnected(&mut self) -> Vec<(Scope, Duration)> {
        let reconnect = self.reconnect;
        let retries: Vec<(Scope, Duration)> = self
            .subscriptions
            .iter_mut()
            .map(|(scope, sub)| (*scope, Self::fail(sub, &reconnect)))
            .collect();

        warn!(scopes = retries.len(), "Push transport disconnected");
        retries
    }

    fn fail(sub: &mut Subscription, reconnect: &ReconnectConfig) -> Duration {
        sub.state = ScopeState::Error;
        sub.attempts = sub.attempts.saturating_add(1);
        sub.recovering = true;
        reconnect.delay_for(sub.attempts)
    }

    /// Re-send the subscribe command for a scope in `Error`. Returns
    /// `false` if the scope was torn down or already recovered meanwhile.
    pub async fn retry(&mut self, scope: Scope) -> Result<bool> {
        match self.subscriptions.get(&scope).map(|sub| sub.state) {
            Some(ScopeState::Error) => {}
            _ => return Ok(false),
        }

        self.send(TransportCommand::Subscribe(scope)).await?;
        if let Some(sub) = self.subscriptions.get_mut(&scope) {
            sub.state = ScopeState::Subscribing;
            debug!(scope = %scope, attempt = sub.attempts, "Retrying subscription");
        }
        Ok(true)
    }

    /// Decode a raw change event and check it may be delivered. Anything
    /// malformed, or published on a scope that is not active, is dropped.
    pub fn route(&self, payload: &[u8]) -> Option<ChangeEvent> {
        let event = match ChangeEvent::from_bytes(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, len = payload.len(), "Dropping undecodable change event");
                return None;
            }
        };

        match self.state(event.scope) {
            ScopeState::Active => Some(event),
            state => {
                debug!(scope = %event.scope, ?state, "Dropping change event for inactive scope");
                None
            }
        }
    }

    pub fn state(&self, scope: Scope) -> ScopeState {
        self.subscriptions
            .get(&scope)
            .map(|sub| sub.state)
            .unwrap_or(ScopeState::Inactive)
    }

    pub fn ref_count(&self, scope: Scope) -> usize {
        self.subscriptions
            .get(&scope)
            .map(|sub| sub.handles.len())
            .unwrap_or(0)
    }

    pub fn active_scopes(&self) -> Vec<Scope> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.state == ScopeState::Active)
            .map(|(scope, _)| *scope)
            .collect()
    }

    /// Tear down every subscription regardless of outstanding handles.
    pub async fn close_all(&mut self) {
        let scopes: Vec<Scope> = self.subscriptions.drain().map(|(scope, _)| scope).collect();
        for scope in &scopes {
            if self.send(TransportCommand::Unsubscribe(*scope)).await.is_err() {
                break;
            }
        }
        info!(count = scopes.len(), "All subscriptions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_shared::events::ChangeKind;
    use parley_shared::models::MessageRow;
    use parley_shared::types::{ChannelId, MessageId, UserId};

    fn manager() -> (SubscriptionManager, mpsc::Receiver<TransportCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let reconnect = ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        (SubscriptionManager::new(tx, reconnect), rx)
    }

    fn payload(channel: ChannelId) -> Vec<u8> {
        let row = MessageRow {
            id: MessageId::new(),
            channel_id: channel,
            author_id: UserId::new(),
            body: "hello".to_string(),
            attachment: None,
            created_at: Utc::now(),
            parent_id: None,
            reply_ids: Vec::new(),
        };
        ChangeEvent::message(Scope::Conversation(channel), ChangeKind::Insert, row)
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_transport_subscription_per_scope() {
        let (mut manager, mut rx) = manager();
        let scope = Scope::Conversation(ChannelId::new());

        let first = manager.subscribe(scope).await.unwrap();
        let second = manager.subscribe(scope).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Subscribe(scope));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.ref_count(scope), 2);
        assert_eq!(manager.state(scope), ScopeState::Subscribing);

        assert!(!manager.unsubscribe(first).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.ref_count(scope), 1);

        assert!(manager.unsubscribe(second).await);
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Unsubscribe(scope));
        assert_eq!(manager.state(scope), ScopeState::Inactive);
        assert_eq!(manager.ref_count(scope), 0);
    }

    #[tokio::test]
    async fn test_route_only_delivers_active_scopes() {
        let (mut manager, _rx) = manager();
        let channel = ChannelId::new();
        let scope = Scope::Conversation(channel);

        assert!(manager.route(&payload(channel)).is_none());

        let _handle = manager.subscribe(scope).await.unwrap();
        assert!(manager.route(&payload(channel)).is_none());

        assert!(!manager.on_subscribed(scope));
        assert_eq!(manager.active_scopes(), vec![scope]);
        let event = manager.route(&payload(channel)).unwrap();
        assert_eq!(event.scope, scope);

        assert!(manager.route(b"not json").is_none());
        assert!(manager.route(&payload(ChannelId::new())).is_none());
    }

    #[tokio::test]
    async fn test_failure_backoff_and_resync() {
        let (mut manager, mut rx) = manager();
        let scope = Scope::Thread(MessageId::new());
        let _handle = manager.subscribe(scope).await.unwrap();
        rx.try_recv().unwrap();

        assert_eq!(
            manager.on_subscribe_failed(scope, "refused"),
            Some(Duration::from_millis(100))
        );
        assert_eq!(manager.state(scope), ScopeState::Error);

        assert!(manager.retry(scope).await.unwrap());
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Subscribe(scope));
        assert_eq!(manager.state(scope), ScopeState::Subscribing);

        assert_eq!(
            manager.on_subscribe_failed(scope, "refused"),
            Some(Duration::from_millis(200))
        );
        assert!(manager.retry(scope).await.unwrap());

        assert!(manager.on_subscribed(scope));
        assert_eq!(manager.state(scope), ScopeState::Active);

        // A second retry after recovery is a no-op.
        assert!(!manager.retry(scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_scope() {
        let (mut manager, _rx) = manager();
        let a = Scope::Conversation(ChannelId::new());
        let b = Scope::Profiles;
        let _ha = manager.subscribe(a).await.unwrap();
        let _hb = manager.subscribe(b).await.unwrap();
        manager.on_subscribed(a);
        manager.on_subscribed(b);

        let mut retries = manager.on_disconnected();
        retries.sort_by_key(|(scope, _)| scope.to_topic());
        assert_eq!(retries.len(), 2);
        assert!(retries
            .iter()
            .all(|(_, delay)| *delay == Duration::from_millis(100)));
        assert_eq!(manager.state(a), ScopeState::Error);
        assert!(manager.active_scopes().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_during_backoff_cancels_retry() {
        let (mut manager, mut rx) = manager();
        let scope = Scope::Conversation(ChannelId::new());
        let handle = manager.subscribe(scope).await.unwrap();
        manager.on_subscribe_failed(scope, "refused");

        assert!(manager.unsubscribe(handle).await);
        assert!(!manager.retry(scope).await.unwrap());
        assert!(manager.on_subscribe_failed(scope, "late").is_none());
        assert!(!manager.on_subscribed(scope));

        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Subscribe(scope));
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Unsubscribe(scope));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_is_reported() {
        let (mut manager, rx) = manager();
        drop(rx);

        let result = manager.subscribe(Scope::Profiles).await;
        assert!(matches!(result, Err(SyncError::TransportClosed)));
        assert_eq!(manager.state(Scope::Profiles), ScopeState::Inactive);
    }
}
