//! Realtime sync core: profile cache, message streams and push
//! subscriptions.
//!
//! Nothing here spawns tasks or owns a runtime loop; the engine in
//! `parley-client` drives these types from a single event loop.

pub mod backend;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod message_log;
pub mod profile_cache;
pub mod stream;
pub mod subscriptions;
pub mod thread;

pub use backend::{MessageLoader, MessageSender, ProfileFetcher, TransportCommand, TransportEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ProfileCacheConfig, ReconnectConfig, SyncConfig};
pub use conversation::ConversationStream;
pub use message_log::{Applied, MessageLog, Promotion};
pub use profile_cache::ProfileCache;
pub use stream::{LoadMark, MessageStream, ScrollAnchor, StreamScope, StreamSnapshot};
pub use subscriptions::{ScopeState, SubscriptionHandle, SubscriptionManager};
pub use thread::ThreadStream;
