//! The sync engine.
//!
//! One task owns every open stream and the subscription manager and
//! processes, in a single `tokio::select!` loop:
//!
//! - completions of its own side-tasks (seed loads, sends, retry timers),
//! - notifications from the push transport,
//! - commands from [`SyncHandle`]s,
//! - the periodic profile purge.
//!
//! Side-tasks never touch engine state; they post a completion back into
//! the loop, which discards it if the stream it belongs to has been closed
//! in the meantime. The profile cache is shared with the handles and guards
//! itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parley_shared::error::{FetchError, Result, SendError, SyncError};
use parley_shared::events::{ChangeEvent, ChangeKind, ChangeRow};
use parley_shared::models::{MessageDraft, MessageRow, Profile, SendReceipt, SendRequest};
use parley_shared::types::{ChannelId, MessageId, ProvisionalId, Scope, UserId};
use parley_sync::backend::{MessageLoader, MessageSender, TransportCommand, TransportEvent};
use parley_sync::clock::Clock;
use parley_sync::config::SyncConfig;
use parley_sync::message_log::{Applied, Promotion};
use parley_sync::profile_cache::ProfileCache;
use parley_sync::stream::{LoadMark, StreamSnapshot};
use parley_sync::subscriptions::{ScopeState, SubscriptionHandle, SubscriptionManager};
use parley_sync::{ConversationStream, ThreadStream};

/// Everything the engine talks to.
pub struct EngineDeps {
    pub sender: Arc<dyn MessageSender>,
    pub loader: Arc<dyn MessageLoader>,
    pub profiles: ProfileCache,
    pub transport_tx: mpsc::Sender<TransportCommand>,
    pub transport_rx: mpsc::Receiver<TransportEvent>,
    pub clock: Arc<dyn Clock>,
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A view's window onto one open stream. Give it back through
/// [`SyncHandle::close`].
#[derive(Debug)]
pub struct ViewHandle {
    id: u64,
    scope: Scope,
    snapshots: watch::Receiver<StreamSnapshot>,
}

impl ViewHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The latest published list.
    pub fn snapshot(&self) -> StreamSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next change. Fails once the stream is gone (closed
    /// elsewhere, session cleared, or engine stopped).
    pub async fn changed(&mut self) -> Result<StreamSnapshot> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| SyncError::ScopeNotOpen(self.scope))?;
        Ok(self.snapshots.borrow_and_update().clone())
    }
}

/// Result of a send: the provisional id now, the durable id later.
#[derive(Debug)]
pub struct SendTicket {
    provisional_id: ProvisionalId,
    outcome: oneshot::Receiver<Result<MessageId>>,
}

impl SendTicket {
    pub fn provisional_id(&self) -> ProvisionalId {
        self.provisional_id
    }

    /// Wait for the backend. On failure the optimistic entry has already
    /// been rolled back.
    pub async fn outcome(self) -> Result<MessageId> {
        self.outcome
            .await
            .unwrap_or(Err(SyncError::Send(SendError::Abandoned)))
    }
}

/// Cheap, cloneable front door to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    profiles: ProfileCache,
}

impl SyncHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn open_conversation(&self, channel: ChannelId) -> Result<ViewHandle> {
        let scope = Scope::Conversation(channel);
        self.request(|reply| Command::Open { scope, reply }).await?
    }

    pub async fn open_thread(&self, parent: MessageId) -> Result<ViewHandle> {
        let scope = Scope::Thread(parent);
        self.request(|reply| Command::Open { scope, reply }).await?
    }

    /// Close a view. Returns `true` if it was the last view of its stream
    /// and the stream was torn down.
    pub async fn close(&self, view: ViewHandle) -> Result<bool> {
        let (scope, id) = (view.scope, view.id);
        self.request(|reply| Command::Close {
            scope,
            view: id,
            reply,
        })
        .await
    }

    /// Show `draft` in the open stream for `scope` and send it.
    pub async fn send(&self, scope: Scope, draft: MessageDraft) -> Result<SendTicket> {
        self.request(|reply| Command::Send {
            scope,
            draft,
            reply,
        })
        .await?
    }

    /// Profile of a sender, fetched on a miss. Never fails.
    pub async fn profile(&self, user_id: UserId) -> Profile {
        self.profiles.get(user_id).await
    }

    /// Profile if already cached; never fetches.
    pub fn cached_profile(&self, user_id: UserId) -> Option<Profile> {
        self.profiles.peek(user_id)
    }

    /// Push subscription state of a scope.
    pub async fn scope_state(&self, scope: Scope) -> Result<ScopeState> {
        self.request(|reply| Command::State { scope, reply }).await
    }

    /// Close every stream and drop every cached profile (logout).
    pub async fn clear_session(&self) -> Result<()> {
        self.request(|reply| Command::ClearSession { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }
}

// ---------------------------------------------------------------------------
// Loop messages
// ---------------------------------------------------------------------------

enum Command {
    Open {
        scope: Scope,
        reply: oneshot::Sender<Result<ViewHandle>>,
    },
    Close {
        scope: Scope,
        view: u64,
        reply: oneshot::Sender<bool>,
    },
    Send {
        scope: Scope,
        draft: MessageDraft,
        reply: oneshot::Sender<Result<SendTicket>>,
    },
    State {
        scope: Scope,
        reply: oneshot::Sender<ScopeState>,
    },
    ClearSession {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

struct Sent {
    scope: Scope,
    epoch: u64,
    request: SendRequest,
    result: std::result::Result<SendReceipt, SendError>,
    outcome: oneshot::Sender<Result<MessageId>>,
}

enum Completion {
    Loaded {
        scope: Scope,
        epoch: u64,
        /// Set for a resync, with the stream position it was issued at.
        resync: Option<LoadMark>,
        result: std::result::Result<Vec<MessageRow>, FetchError>,
    },
    Sent(Box<Sent>),
    RetryDue(Scope),
}

// ---------------------------------------------------------------------------
// Open streams
// ---------------------------------------------------------------------------

enum Stream {
    Conversation(ConversationStream),
    Thread(ThreadStream),
}

macro_rules! each_stream {
    ($stream:expr, $s:ident => $body:expr) => {
        match $stream {
            Stream::Conversation($s) => $body,
            Stream::Thread($s) => $body,
        }
    };
}

impl Stream {
    fn open(scope: Scope, clock: Arc<dyn Clock>) -> Option<Self> {
        match scope {
            Scope::Conversation(channel) => {
                Some(Self::Conversation(ConversationStream::new(channel, clock)))
            }
            Scope::Thread(parent) => Some(Self::Thread(ThreadStream::new(parent, clock))),
            Scope::Profiles => None,
        }
    }

    fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        each_stream!(self, s => s.subscribe())
    }

    fn initialize(&mut self, rows: Vec<MessageRow>) -> bool {
        each_stream!(self, s => s.initialize(rows))
    }

    fn load_mark(&self) -> LoadMark {
        each_stream!(self, s => s.load_mark())
    }

    fn resync(&mut self, since: LoadMark, rows: Vec<MessageRow>) -> usize {
        each_stream!(self, s => s.resync(since, rows))
    }

    fn append_optimistic(&mut self, draft: MessageDraft) -> SendRequest {
        each_stream!(self, s => s.append_optimistic(draft))
    }

    fn confirm(&mut self, provisional_id: ProvisionalId, receipt: SendReceipt) -> Promotion {
        each_stream!(self, s => s.confirm(provisional_id, receipt))
    }

    fn rollback(&mut self, provisional_id: ProvisionalId) -> bool {
        each_stream!(self, s => s.rollback(provisional_id))
    }

    fn on_remote_event(&mut self, kind: ChangeKind, row: &MessageRow) -> Applied {
        each_stream!(self, s => s.on_remote_event(kind, row))
    }

    fn attach_reply(&mut self, parent: MessageId, reply: MessageId) -> bool {
        each_stream!(self, s => s.attach_reply(parent, reply))
    }
}

struct OpenScope {
    stream: Stream,
    /// Distinguishes this opening from earlier ones of the same scope.
    epoch: u64,
    /// One subscription handle per attached view.
    views: HashMap<u64, SubscriptionHandle>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    sender: Arc<dyn MessageSender>,
    loader: Arc<dyn MessageLoader>,
    profiles: ProfileCache,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    subscriptions: SubscriptionManager,
    scopes: HashMap<Scope, OpenScope>,
    completions: mpsc::Sender<Completion>,
    profile_feed: Option<SubscriptionHandle>,
    next_view: u64,
    next_epoch: u64,
}

impl SyncEngine {
    /// Start the engine on the current runtime.
    pub fn spawn(deps: EngineDeps, config: SyncConfig) -> (SyncHandle, JoinHandle<()>) {
        let EngineDeps {
            sender,
            loader,
            profiles,
            transport_tx,
            transport_rx,
            clock,
        } = deps;

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.channel_capacity);
        let (completion_tx, completion_rx) = mpsc::channel::<Completion>(config.channel_capacity);

        let engine = Self {
            sender,
            loader,
            profiles: profiles.clone(),
            clock,
            config,
            subscriptions: SubscriptionManager::new(transport_tx, config.reconnect),
            scopes: HashMap::new(),
            completions: completion_tx,
            profile_feed: None,
            next_view: 1,
            next_epoch: 0,
        };

        let handle = SyncHandle {
            commands: cmd_tx,
            profiles,
        };
        let task = tokio::spawn(engine.run(cmd_rx, completion_rx, transport_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::Receiver<Completion>,
        mut transport: mpsc::Receiver<TransportEvent>,
    ) {
        info!("Sync engine started");

        match self.subscriptions.subscribe(Scope::Profiles).await {
            Ok(handle) => self.profile_feed = Some(handle),
            Err(e) => warn!(error = %e, "Could not subscribe to profile changes"),
        }

        let mut purge = tokio::time::interval(self.config.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        purge.tick().await;

        let mut transport_open = true;

        loop {
            tokio::select! {
                biased;

                Some(completion) = completions.recv() => {
                    self.on_completion(completion).await;
                }

                event = transport.recv(), if transport_open => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        warn!("Push transport closed, continuing without live updates");
                        transport_open = false;
                    }
                },

                command = commands.recv() => match command {
                    Some(Command::Shutdown) => {
                        info!("Sync engine shutdown requested");
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        info!("All sync handles dropped, stopping engine");
                        break;
                    }
                },

                _ = purge.tick() => {
                    self.profiles.purge_expired();
                }
            }
        }

        self.scopes.clear();
        if let Some(handle) = self.profile_feed.take() {
            self.subscriptions.unsubscribe(handle).await;
        }
        self.subscriptions.close_all().await;
        info!("Sync engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { scope, reply } => {
                let _ = reply.send(self.open(scope).await);
            }
            Command::Close { scope, view, reply } => {
                let _ = reply.send(self.close(scope, view).await);
            }
            Command::Send {
                scope,
                draft,
                reply,
            } => {
                let _ = reply.send(self.send(scope, draft));
            }
            Command::State { scope, reply } => {
                let _ = reply.send(self.subscriptions.state(scope));
            }
            Command::ClearSession { reply } => {
                self.clear_session().await;
                let _ = reply.send(());
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    async fn open(&mut self, scope: Scope) -> Result<ViewHandle> {
        let view = self.next_view;
        self.next_view += 1;

        if let Some(open) = self.scopes.get(&scope) {
            let snapshots = open.stream.subscribe();
            let handle = self.subscriptions.subscribe(scope).await?;
            if let Some(open) = self.scopes.get_mut(&scope) {
                open.views.insert(view, handle);
                debug!(scope = %scope, view, views = open.views.len(), "View attached to open stream");
            }
            return Ok(ViewHandle {
                id: view,
                scope,
                snapshots,
            });
        }

        let stream =
            Stream::open(scope, Arc::clone(&self.clock)).ok_or(SyncError::ScopeNotOpen(scope))?;
        let handle = self.subscriptions.subscribe(scope).await?;

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let snapshots = stream.subscribe();
        self.scopes.insert(
            scope,
            OpenScope {
                stream,
                epoch,
                views: HashMap::from([(view, handle)]),
            },
        );
        self.spawn_load(scope, epoch, None);

        info!(scope = %scope, view, "Stream opened");
        Ok(ViewHandle {
            id: view,
            scope,
            snapshots,
        })
    }

    async fn close(&mut self, scope: Scope, view: u64) -> bool {
        let Some(open) = self.scopes.get_mut(&scope) else {
            debug!(scope = %scope, view, "Close for stream that is not open");
            return false;
        };
        let Some(handle) = open.views.remove(&view) else {
            debug!(scope = %scope, view, "Close for unknown view");
            return false;
        };

        let last = open.views.is_empty();
        if last {
            self.scopes.remove(&scope);
            info!(scope = %scope, "Stream closed");
        }
        self.subscriptions.unsubscribe(handle).await;
        last
    }

    fn send(&mut self, scope: Scope, draft: MessageDraft) -> Result<SendTicket> {
        let open = self
            .scopes
            .get_mut(&scope)
            .ok_or(SyncError::ScopeNotOpen(scope))?;
        let request = open.stream.append_optimistic(draft);
        let epoch = open.epoch;
        let provisional_id = request.provisional_id;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let sender = Arc::clone(&self.sender);
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let result = sender.send_message(&request).await;
            let sent = Sent {
                scope,
                epoch,
                request,
                result,
                outcome: outcome_tx,
            };
            if completions.send(Completion::Sent(Box::new(sent))).await.is_err() {
                debug!(provisional = %provisional_id, "Engine stopped before send completed");
            }
        });

        Ok(SendTicket {
            provisional_id,
            outcome: outcome_rx,
        })
    }

    async fn clear_session(&mut self) {
        let streams = self.scopes.len();
        let scopes: Vec<OpenScope> = self.scopes.drain().map(|(_, open)| open).collect();
        for open in scopes {
            for (_, handle) in open.views {
                self.subscriptions.unsubscribe(handle).await;
            }
        }
        self.profiles.clear();
        info!(streams, "Session cleared");
    }

    // -- side-tasks ----------------------------------------------------------

    fn spawn_load(&self, scope: Scope, epoch: u64, resync: Option<LoadMark>) {
        let loader = Arc::clone(&self.loader);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = loader.load_messages(scope).await;
            let _ = completions
                .send(Completion::Loaded {
                    scope,
                    epoch,
                    resync,
                    result,
                })
                .await;
        });
    }

    fn schedule_retry(&self, scope: Scope, delay: Duration) {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.send(Completion::RetryDue(scope)).await;
        });
    }

    /// Fetch a sender's profile in the background so rendering finds it.
    fn warm_profile(&self, user_id: UserId) {
        if self.profiles.peek(user_id).is_some() {
            return;
        }
        let profiles = self.profiles.clone();
        tokio::spawn(async move {
            profiles.get(user_id).await;
        });
    }

    // -- completions ---------------------------------------------------------

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded {
                scope,
                epoch,
                resync,
                result,
            } => self.on_loaded(scope, epoch, resync, result),
            Completion::Sent(sent) => self.on_sent(*sent),
            Completion::RetryDue(scope) => {
                if let Err(e) = self.subscriptions.retry(scope).await {
                    warn!(scope = %scope, error = %e, "Subscription retry failed");
                }
            }
        }
    }

    fn on_loaded(
        &mut self,
        scope: Scope,
        epoch: u64,
        resync: Option<LoadMark>,
        result: std::result::Result<Vec<MessageRow>, FetchError>,
    ) {
        let Some(open) = self
            .scopes
            .get_mut(&scope)
            .filter(|open| open.epoch == epoch)
        else {
            debug!(scope = %scope, "Discarding load for closed stream");
            return;
        };

        match result {
            Ok(rows) => {
                let authors: HashSet<UserId> = rows.iter().map(|row| row.author_id).collect();
                match resync {
                    Some(since) => {
                        open.stream.resync(since, rows);
                    }
                    None => {
                        open.stream.initialize(rows);
                    }
                }
                for author in authors {
                    self.warm_profile(author);
                }
            }
            Err(e) => {
                warn!(
                    scope = %scope,
                    error = %e,
                    resync = resync.is_some(),
                    "Loading messages failed"
                );
                if resync.is_none() {
                    // Tell views loading is over; a later resync fills it.
                    open.stream.initialize(Vec::new());
                }
            }
        }
    }

    fn on_sent(&mut self, sent: Sent) {
        let Sent {
            scope,
            epoch,
            request,
            result,
            outcome,
        } = sent;
        let provisional_id = request.provisional_id;
        let open = self
            .scopes
            .get_mut(&scope)
            .filter(|open| open.epoch == epoch);

        let reply = match result {
            Ok(receipt) => {
                match open {
                    Some(open) => {
                        open.stream.confirm(provisional_id, receipt);
                    }
                    None => {
                        debug!(scope = %scope, id = %receipt.id, "Send confirmed for closed stream")
                    }
                }
                if let Some(parent) = request.parent_id {
                    let conversation = Scope::Conversation(request.channel_id);
                    if let Some(open) = self.scopes.get_mut(&conversation) {
                        open.stream.attach_reply(parent, receipt.id);
                    }
                }
                Ok(receipt.id)
            }
            Err(e) => {
                if let Some(open) = open {
                    open.stream.rollback(provisional_id);
                }
                warn!(scope = %scope, provisional = %provisional_id, error = %e, "Send failed");
                Err(SyncError::Send(e))
            }
        };

        if outcome.send(reply).is_err() {
            debug!(provisional = %provisional_id, "Send ticket dropped before outcome");
        }
    }

    // -- transport -----------------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Subscribed(scope) => {
                if self.subscriptions.on_subscribed(scope) {
                    self.resync(scope);
                }
            }
            TransportEvent::SubscribeFailed { scope, reason } => {
                if let Some(delay) = self.subscriptions.on_subscribe_failed(scope, &reason) {
                    self.schedule_retry(scope, delay);
                }
            }
            TransportEvent::Change(payload) => {
                if let Some(event) = self.subscriptions.route(&payload) {
                    self.apply_change(event);
                }
            }
            TransportEvent::Disconnected => {
                for (scope, delay) in self.subscriptions.on_disconnected() {
                    self.schedule_retry(scope, delay);
                }
            }
        }
    }

    /// Catch up on whatever the push channel dropped while a scope was down.
    fn resync(&mut self, scope: Scope) {
        if scope == Scope::Profiles {
            self.profiles.clear();
            info!("Profile feed recovered, cached profiles dropped");
            return;
        }

        match self
            .scopes
            .get(&scope)
            .map(|open| (open.epoch, open.stream.load_mark()))
        {
            Some((epoch, since)) => {
                info!(scope = %scope, "Resyncing stream after reconnect");
                self.spawn_load(scope, epoch, Some(since));
            }
            None => debug!(scope = %scope, "Recovered scope has no stream"),
        }
    }

    fn apply_change(&mut self, event: ChangeEvent) {
        let scope = event.scope;
        match event.row {
            ChangeRow::Profile(profile) => self.profiles.invalidate_from_event(profile),
            ChangeRow::Message(row) => {
                let Some(open) = self.scopes.get_mut(&scope) else {
                    debug!(scope = %scope, id = %row.id, "Change for scope without stream");
                    return;
                };
                if let Applied::Inserted(_) = open.stream.on_remote_event(event.kind, &row) {
                    self.warm_profile(row.author_id);
                }
            }
        }
    }
}
