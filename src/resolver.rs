//! Maps logical target hosts to running containers.
//!
//! Lookups are cached per cluster for a fixed TTL and concurrent lookups for
//! the same cluster share one runtime query.

use crate::runtime::{ContainerName, ContainerRuntime};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Source of the current time, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cache key derived from a target host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolveKey {
    /// Host follows `<prefix>-<cluster>-node<N>`
    Cluster(String),
    /// Host does not follow the naming convention; any cluster container will do
    Any,
}

impl ResolveKey {
    pub fn cluster(&self) -> Option<&str> {
        match self {
            ResolveKey::Cluster(name) => Some(name),
            ResolveKey::Any => None,
        }
    }
}

impl fmt::Display for ResolveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveKey::Cluster(name) => f.write_str(name),
            ResolveKey::Any => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    container: Option<String>,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(container: Option<String>, now: Instant, ttl: Duration) -> Self {
        Self {
            container,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Owns a key's in-flight entry for the duration of its lookup task.
///
/// Dropped without [`LookupGuard::publish`] (the task panicked or was
/// aborted), it still removes the in-flight entry so the next request
/// starts a fresh lookup.
struct LookupGuard {
    state: Arc<Mutex<ResolverState>>,
    key: ResolveKey,
    published: bool,
}

impl LookupGuard {
    /// Cache the result and retire the in-flight entry in one critical section
    fn publish(mut self, container: Option<String>, now: Instant, ttl: Duration) {
        let mut state = self.state.lock();
        state
            .cache
            .insert(self.key.clone(), CacheEntry::new(container, now, ttl));
        state.in_flight.remove(&self.key);
        self.published = true;
    }
}

impl Drop for LookupGuard {
    fn drop(&mut self) {
        if !self.published {
            warn!(key = %self.key, "Container lookup did not finish, dropping in-flight entry");
            self.state.lock().in_flight.remove(&self.key);
        }
    }
}

type Lookup = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct ResolverState {
    cache: HashMap<ResolveKey, CacheEntry>,
    in_flight: HashMap<ResolveKey, Lookup>,
}

/// Resolves target hosts to the name of a running container that can reach them
pub struct ContainerResolver {
    runtime: ContainerRuntime,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<ResolverState>>,
}

impl ContainerResolver {
    pub fn new(runtime: ContainerRuntime, ttl: Duration) -> Self {
        Self::with_clock(runtime, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(runtime: ContainerRuntime, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            runtime,
            ttl,
            clock,
            state: Arc::new(Mutex::new(ResolverState::default())),
        }
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derive the cache key for a target host
    pub fn key_for(&self, target_host: &str) -> ResolveKey {
        match ContainerName::parse(target_host, self.runtime.prefix()) {
            Some(name) => ResolveKey::Cluster(name.cluster),
            None => ResolveKey::Any,
        }
    }

    /// Resolve a target host to a running container name.
    ///
    /// Returns `None` when no container is running or the runtime query
    /// failed; both outcomes are cached for the TTL.
    pub async fn resolve(&self, target_host: &str) -> Option<String> {
        let key = self.key_for(target_host);

        let lookup = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            let cached = state
                .cache
                .get(&key)
                .map(|entry| (entry.is_fresh(now), entry.container.clone()));
            match cached {
                Some((true, container)) => {
                    debug!(target_host, key = %key, container = ?container, "Resolver cache hit");
                    return container;
                }
                Some((false, _)) => {
                    state.cache.remove(&key);
                }
                None => {}
            }

            match state.in_flight.get(&key) {
                Some(lookup) => {
                    debug!(target_host, key = %key, "Joining in-flight lookup");
                    lookup.clone()
                }
                None => {
                    let lookup = self.start_lookup(key.clone());
                    state.in_flight.insert(key.clone(), lookup.clone());
                    lookup
                }
            }
        };

        lookup.await
    }

    /// Spawn the runtime query for `key`.
    ///
    /// Must be called with the state lock held so the in-flight entry is
    /// registered before the task can publish its result.
    fn start_lookup(&self, key: ResolveKey) -> Lookup {
        let runtime = self.runtime.clone();
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let ttl = self.ttl;

        let task = tokio::spawn(async move {
            let guard = LookupGuard {
                state,
                key: key.clone(),
                published: false,
            };

            let name_prefix = match &key {
                ResolveKey::Cluster(cluster) => {
                    ContainerName::cluster_prefix(runtime.prefix(), cluster)
                }
                ResolveKey::Any => format!("{}-", runtime.prefix()),
            };

            let container = match runtime.first_running(&name_prefix).await {
                Ok(container) => container,
                Err(e) => {
                    warn!(key = %key, error = %e, "Container lookup failed, caching as not found");
                    None
                }
            };
            debug!(key = %key, container = ?container, "Container lookup finished");

            guard.publish(container.clone(), clock.now(), ttl);
            container
        });

        async move { task.await.ok().flatten() }.boxed().shared()
    }

    /// Number of unexpired cache entries
    pub fn cached_entries(&self) -> usize {
        let now = self.clock.now();
        self.state
            .lock()
            .cache
            .values()
            .filter(|entry| entry.is_fresh(now))
            .count()
    }

    /// Drop all cached resolutions; in-flight lookups still complete
    pub fn clear(&self) {
        self.state.lock().cache.clear();
    }
}
