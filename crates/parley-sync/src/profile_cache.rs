//! Bounded, time-expiring cache of user profiles.
//!
//! One cache is shared by every open conversation and thread. Lookups are
//! coalesced: concurrent `get` calls for the same uncached user await a
//! single in-flight fetch. The fetch future itself writes its result back,
//! so there is exactly one writer per user per fetch episode. It is driven
//! by its own task, so a caller that stops waiting does not stall the
//! others.
//!
//! A sender whose profile cannot be loaded is rendered with a placeholder;
//! fetch errors never reach the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, trace, warn};

use parley_shared::error::FetchError;
use parley_shared::models::Profile;
use parley_shared::types::UserId;

use crate::backend::ProfileFetcher;
use crate::clock::Clock;
use crate::config::ProfileCacheConfig;

type ProfileFuture = Shared<BoxFuture<'static, Profile>>;

// ---------------------------------------------------------------------------
// Cached entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: Profile,
    /// When the profile data was fetched or last refreshed by an event.
    cached_at: DateTime<Utc>,
    /// When the entry was last served.
    last_accessed: DateTime<Utc>,
    /// Tie-breaker for entries accessed at the same instant.
    access_seq: u64,
}

impl CachedProfile {
    fn is_expired(&self, now: DateTime<Utc>, config: &ProfileCacheConfig) -> bool {
        // A negative age (clock stepped backwards) counts as fresh.
        (now - self.cached_at)
            .to_std()
            .map(|age| age > config.ttl)
            .unwrap_or(false)
    }
}

struct InFlight {
    episode: u64,
    future: ProfileFuture,
}

enum FetchOutcome {
    Found(Profile),
    NotFound,
    Failed,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<UserId, CachedProfile>,
    in_flight: HashMap<UserId, InFlight>,
    access_seq: u64,
    next_episode: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    /// Serve a fresh entry, dropping it if it has expired.
    fn hit(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
        config: &ProfileCacheConfig,
    ) -> Option<Profile> {
        let expired = self.entries.get(&user_id)?.is_expired(now, config);
        if expired {
            self.entries.remove(&user_id);
            debug!(user = %user_id, "Profile cache entry expired");
            return None;
        }

        let seq = self.next_seq();
        let entry = self.entries.get_mut(&user_id)?;
        entry.last_accessed = now;
        entry.access_seq = seq;
        Some(entry.profile.clone())
    }

    fn insert(
        &mut self,
        profile: Profile,
        now: DateTime<Utc>,
        capacity: usize,
    ) {
        let user_id = profile.user_id;
        if !self.entries.contains_key(&user_id) {
            while self.entries.len() >= capacity.max(1) {
                if !self.evict_lru() {
                    break;
                }
            }
        }

        let seq = self.next_seq();
        self.entries.insert(
            user_id,
            CachedProfile {
                profile,
                cached_at: now,
                last_accessed: now,
                access_seq: seq,
            },
        );
    }

    /// Remove the least recently accessed entry.
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_accessed, entry.access_seq))
            .map(|(user_id, _)| *user_id);

        match victim {
            Some(user_id) => {
                self.entries.remove(&user_id);
                debug!(user = %user_id, "Evicted least recently used profile");
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Profile cache
// ---------------------------------------------------------------------------

struct Inner {
    state: Mutex<CacheState>,
    fetcher: Arc<dyn ProfileFetcher>,
    clock: Arc<dyn Clock>,
    config: ProfileCacheConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state is never left half-updated, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch(&self, user_id: UserId) -> FetchOutcome {
        let fetch = self.fetcher.fetch_profile(user_id);
        let result = tokio::time::timeout(self.config.fetch_timeout, fetch)
            .await
            .unwrap_or(Err(FetchError::Timeout));

        match result {
            Ok(Some(profile)) => FetchOutcome::Found(profile),
            Ok(None) => {
                debug!(user = %user_id, "Profile not found, using placeholder");
                FetchOutcome::NotFound
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Profile fetch failed, using placeholder");
                FetchOutcome::Failed
            }
        }
    }

    /// Store the result of fetch `episode`, unless the episode was
    /// superseded by an event, an eviction or a clear in the meantime.
    fn complete(&self, user_id: UserId, episode: u64, outcome: FetchOutcome) -> Profile {
        let mut state = self.lock();

        let current = state
            .in_flight
            .get(&user_id)
            .is_some_and(|in_flight| in_flight.episode == episode);

        if !current {
            // Fresher data may have arrived while the fetch was running.
            if let Some(entry) = state.entries.get(&user_id) {
                return entry.profile.clone();
            }
            return match outcome {
                FetchOutcome::Found(profile) => profile,
                FetchOutcome::NotFound | FetchOutcome::Failed => Profile::placeholder(user_id),
            };
        }

        state.in_flight.remove(&user_id);
        let now = self.clock.now();

        match outcome {
            FetchOutcome::Found(profile) => {
                state.insert(profile.clone(), now, self.config.capacity);
                profile
            }
            FetchOutcome::NotFound => {
                let placeholder = Profile::placeholder(user_id);
                state.insert(placeholder.clone(), now, self.config.capacity);
                placeholder
            }
            // Not cached, so the next lookup retries.
            FetchOutcome::Failed => Profile::placeholder(user_id),
        }
    }
}

/// Process-wide profile cache. Cloning yields another handle to the same
/// cache.
#[derive(Clone)]
pub struct ProfileCache {
    inner: Arc<Inner>,
}

impl ProfileCache {
    pub fn new(
        fetcher: Arc<dyn ProfileFetcher>,
        clock: Arc<dyn Clock>,
        config: ProfileCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState::default()),
                fetcher,
                clock,
                config,
            }),
        }
    }

    /// Look up a profile, fetching it on a miss.
    ///
    /// Never fails: a missing user, a backend error or a timeout all yield
    /// [`Profile::placeholder`].
    pub async fn get(&self, user_id: UserId) -> Profile {
        let future = {
            let mut state = self.inner.lock();
            let now = self.inner.clock.now();

            if let Some(profile) = state.hit(user_id, now, &self.inner.config) {
                trace!(user = %user_id, "Profile served from cache");
                return profile;
            }

            match state.in_flight.get(&user_id) {
                Some(in_flight) => {
                    trace!(user = %user_id, "Joining in-flight profile fetch");
                    in_flight.future.clone()
                }
                None => self.start_fetch(&mut state, user_id),
            }
        };

        future.await
    }

    fn start_fetch(&self, state: &mut CacheState, user_id: UserId) -> ProfileFuture {
        state.next_episode += 1;
        let episode = state.next_episode;
        debug!(user = %user_id, episode, "Fetching profile");

        let inner = Arc::clone(&self.inner);
        let future = async move {
            let outcome = inner.fetch(user_id).await;
            inner.complete(user_id, episode, outcome)
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            user_id,
            InFlight {
                episode,
                future: future.clone(),
            },
        );
        tokio::spawn(future.clone());
        future
    }

    /// Apply a profile change reported by the push channel.
    ///
    /// Overwrites the entry and restarts its TTL. Any fetch still running
    /// for this user is orphaned so it cannot overwrite the fresher data.
    pub fn invalidate_from_event(&self, profile: Profile) {
        let mut state = self.inner.lock();
        let now = self.inner.clock.now();
        let user_id = profile.user_id;

        state.in_flight.remove(&user_id);
        state.insert(profile, now, self.inner.config.capacity);
        debug!(user = %user_id, "Profile refreshed from change event");
    }

    /// Cached profile without fetching and without touching recency.
    pub fn peek(&self, user_id: UserId) -> Option<Profile> {
        let state = self.inner.lock();
        let now = self.inner.clock.now();
        state
            .entries
            .get(&user_id)
            .filter(|entry| !entry.is_expired(now, &self.inner.config))
            .map(|entry| entry.profile.clone())
    }

    pub fn evict(&self, user_id: UserId) -> bool {
        let mut state = self.inner.lock();
        state.in_flight.remove(&user_id);
        state.entries.remove(&user_id).is_some()
    }

    /// Drop every entry and orphan every in-flight fetch (session end).
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        debug!(removed, "Profile cache cleared");
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.inner.lock();
        let now = self.inner.clock.now();
        let config = self.inner.config;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !entry.is_expired(now, &config));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired profile cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
