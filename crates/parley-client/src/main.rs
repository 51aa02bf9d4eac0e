//! # parley-demo
//!
//! Runs the sync engine against the in-process loopback backend and prints
//! every stream update as the JSON a UI would receive:
//! - open a conversation seeded with history
//! - send a message (optimistic, then confirmed)
//! - a remote user replies in a thread
//! - a rejected send is rolled back
//! - the push channel drops and the conversation resyncs

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use parley_client::events::{
    encode_event, SendFailedPayload, StreamUpdatedPayload, EVENT_SEND_FAILED,
    EVENT_STREAM_UPDATED,
};
use parley_client::{init_tracing, EngineDeps, Loopback, SyncEngine, ViewHandle};
use parley_shared::constants::APP_NAME;
use parley_shared::models::{MessageDraft, MessageRow, Profile};
use parley_shared::types::{ChannelId, MessageId, Scope, UserId};
use parley_sync::clock::{Clock, SystemClock};
use parley_sync::config::SyncConfig;
use parley_sync::profile_cache::ProfileCache;

const SETTLE: Duration = Duration::from_millis(100);

fn profile(user_id: UserId, name: &str) -> Profile {
    Profile {
        user_id,
        display_name: name.to_string(),
        email: Some(format!("{}@example.org", name.to_lowercase())),
        external_auth_id: None,
        avatar_url: None,
        placeholder: false,
    }
}

fn print_view(profiles: &ProfileCache, view: &ViewHandle) {
    let payload = StreamUpdatedPayload::render(view.scope(), &view.snapshot(), profiles);
    if let Some(json) = encode_event(EVENT_STREAM_UPDATED, &payload) {
        println!("{json}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting {} sync demo v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Backend with some history
    // -----------------------------------------------------------------------
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = Loopback::new(Arc::clone(&clock));

    let me = UserId::new();
    let alice = UserId::new();
    backend.seed_profile(profile(me, "Me"));
    backend.seed_profile(profile(alice, "Alice"));

    let channel = ChannelId::new();
    let welcome = MessageRow {
        id: MessageId::new(),
        channel_id: channel,
        author_id: alice,
        body: "Welcome to the channel".to_string(),
        attachment: None,
        created_at: Utc::now() - chrono::Duration::minutes(5),
        parent_id: None,
        reply_ids: Vec::new(),
    };
    backend.seed_messages([welcome.clone()]);

    // -----------------------------------------------------------------------
    // 3. Engine
    // -----------------------------------------------------------------------
    let (transport_tx, transport_rx) = backend.spawn_transport(config.channel_capacity);
    let profiles = ProfileCache::new(
        Arc::new(backend.clone()),
        Arc::clone(&clock),
        config.profile_cache,
    );
    let deps = EngineDeps {
        sender: Arc::new(backend.clone()),
        loader: Arc::new(backend.clone()),
        profiles: profiles.clone(),
        transport_tx,
        transport_rx,
        clock,
    };
    let (handle, engine) = SyncEngine::spawn(deps, config);

    // -----------------------------------------------------------------------
    // 4. Scenario
    // -----------------------------------------------------------------------
    let conversation = handle
        .open_conversation(channel)
        .await
        .context("opening conversation")?;
    tokio::time::sleep(SETTLE).await;
    print_view(&profiles, &conversation);

    let ticket = handle
        .send(
            Scope::Conversation(channel),
            MessageDraft {
                channel_id: channel,
                author_id: me,
                body: "Hi everyone".to_string(),
                attachment: None,
            },
        )
        .await
        .context("sending message")?;
    print_view(&profiles, &conversation);
    let sent = ticket.outcome().await.context("message was not stored")?;
    info!(id = %sent, "Message confirmed");
    print_view(&profiles, &conversation);

    let thread = handle
        .open_thread(welcome.id)
        .await
        .context("opening thread")?;
    backend.insert_remote(MessageRow {
        id: MessageId::new(),
        channel_id: channel,
        author_id: alice,
        body: "Glad you're here".to_string(),
        attachment: None,
        created_at: Utc::now(),
        parent_id: Some(welcome.id),
        reply_ids: Vec::new(),
    });
    tokio::time::sleep(SETTLE).await;
    print_view(&profiles, &thread);
    print_view(&profiles, &conversation);

    backend.reject_next_sends(1);
    let scope = Scope::Conversation(channel);
    let ticket = handle
        .send(
            scope,
            MessageDraft {
                channel_id: channel,
                author_id: me,
                body: "This one will bounce".to_string(),
                attachment: None,
            },
        )
        .await
        .context("sending message")?;
    let provisional_id = ticket.provisional_id();
    if let Err(e) = ticket.outcome().await {
        warn!(error = %e, "Send failed as expected");
        let payload = SendFailedPayload {
            scope: scope.to_topic(),
            provisional_id: provisional_id.to_string(),
            reason: e.to_string(),
        };
        if let Some(json) = encode_event(EVENT_SEND_FAILED, &payload) {
            println!("{json}");
        }
    }
    print_view(&profiles, &conversation);

    backend.disconnect();
    backend.seed_messages([MessageRow {
        id: MessageId::new(),
        channel_id: channel,
        author_id: alice,
        body: "Posted while you were offline".to_string(),
        attachment: None,
        created_at: Utc::now(),
        parent_id: None,
        reply_ids: Vec::new(),
    }]);
    tokio::time::sleep(config.reconnect.max_delay.min(Duration::from_secs(2)) + SETTLE).await;
    print_view(&profiles, &conversation);

    // -----------------------------------------------------------------------
    // 5. Shutdown
    // -----------------------------------------------------------------------
    handle.close(thread).await?;
    handle.close(conversation).await?;
    handle.shutdown().await?;
    engine.await.context("engine task panicked")?;

    info!("Demo finished");
    Ok(())
}
