//! Interfaces to the external collaborators of the sync core.
//!
//! Request/response collaborators (send, seed load, profile fetch) are
//! async traits. The push transport is an actor reached over a typed
//! command / notification channel pair, so tests can drive it by hand.

use async_trait::async_trait;

use parley_shared::error::{FetchError, SendError};
use parley_shared::models::{MessageRow, Profile, SendReceipt, SendRequest};
use parley_shared::types::{Scope, UserId};

/// Persists a message and returns its durable identity.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, request: &SendRequest) -> Result<SendReceipt, SendError>;
}

/// Loads the current contents of a conversation or thread.
#[async_trait]
pub trait MessageLoader: Send + Sync {
    async fn load_messages(&self, scope: Scope) -> Result<Vec<MessageRow>, FetchError>;
}

/// Looks up a user profile. `Ok(None)` means the user does not exist.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<Profile>, FetchError>;
}

// ---------------------------------------------------------------------------
// Push transport
// ---------------------------------------------------------------------------

/// Commands sent *into* the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Start delivering change events for a scope.
    Subscribe(Scope),
    /// Stop delivering change events for a scope.
    Unsubscribe(Scope),
}

/// Notifications sent *from* the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A subscription is live.
    Subscribed(Scope),
    /// A subscription could not be opened.
    SubscribeFailed { scope: Scope, reason: String },
    /// A raw change event payload (JSON).
    Change(Vec<u8>),
    /// The connection dropped; every subscription is gone.
    Disconnected,
}
