//! # Connection management
//!
//! The [PoolingConnectionManager] decides how many connections may be in flight per route and in total and
//! tracks the lifetime of every pooled slot. Sockets themselves are kept by the transport, which is configured
//! with the same limits and time to live.
pub mod observed;
pub mod reaper;

use crate::config::ClientConfiguration;
use crate::pool::reaper::IdleConnectionReaper;
use crate::socket::{HTTP_SCHEME, HTTPS_SCHEME, SocketFactoryRegistry};
use http::Uri;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PoolError {
    #[error("invalid route for `{uri}`: {reason}")]
    InvalidRoute { uri: String, reason: String },
    #[error("no socket factory registered for scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("timeout waiting for a connection to `{route}` after {timeout:?}")]
    LeaseTimeout { route: Route, timeout: Duration },
    #[error("connection manager is shut down")]
    ShutDown,
}

/// Destination of a connection: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
}

impl Route {
    pub fn new<S: AsRef<str>, H: AsRef<str>>(scheme: S, host: H, port: u16) -> Self {
        Self {
            scheme: scheme.as_ref().to_ascii_lowercase(),
            host: host.as_ref().to_ascii_lowercase(),
            port,
        }
    }

    /// Builds the route of the provided uri, using the scheme default port when the uri has none.
    pub fn from_uri(uri: &Uri) -> Result<Self, PoolError> {
        let invalid = |reason: &str| PoolError::InvalidRoute {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let scheme = uri.scheme_str().ok_or_else(|| invalid("missing scheme"))?;
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = uri
            .port_u16()
            .or_else(|| default_port(scheme))
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        HTTP_SCHEME => Some(80),
        HTTPS_SCHEME => Some(443),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_total: usize,
    pub max_per_route: usize,
    /// Pooled slots are discarded once they are older than this.
    pub time_to_live: Option<Duration>,
}

impl PoolLimits {
    /// Limits where the total and the per route maximums are the same value.
    pub fn uniform(max_connections: usize, time_to_live: Option<Duration>) -> Self {
        Self {
            max_total: max_connections,
            max_per_route: max_connections,
            time_to_live,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub leased: usize,
    pub available: usize,
    pub routes: usize,
}

/// A pooled slot handed out to a single request until it is released.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionLease {
    id: u64,
    route: Route,
    created: Instant,
    expiry: Option<Instant>,
}

impl ConnectionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ConnectionManager: Send + Sync {
    /// Leases a slot for the route, waiting up to `timeout` for one to be released when the limits are reached.
    fn lease(&self, route: &Route, timeout: Duration) -> Result<ConnectionLease, PoolError>;
    /// Returns the slot to the pool. Non reusable slots are discarded.
    fn release(&self, lease: ConnectionLease, reusable: bool);
    /// Discards available slots whose time to live elapsed.
    fn close_expired(&self);
    /// Discards available slots that have not been used for at least `idle_for`.
    fn close_idle(&self, idle_for: Duration);
    fn limits(&self) -> PoolLimits;
    fn stats(&self) -> PoolStats;
    fn shutdown(&self);
}

#[derive(Debug, Clone)]
struct PoolEntry {
    id: u64,
    created: Instant,
    updated: Instant,
    expiry: Option<Instant>,
}

impl PoolEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }
}

#[derive(Debug, Default)]
struct RoutePool {
    leased: usize,
    available: VecDeque<PoolEntry>,
}

impl RoutePool {
    fn allocated(&self) -> usize {
        self.leased + self.available.len()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    routes: HashMap<Route, RoutePool>,
    leased: usize,
    available: usize,
    next_id: u64,
    shut_down: bool,
}

impl PoolState {
    /// Takes the most recently released, non expired slot of the route, discarding the expired ones found.
    fn take_available(&mut self, route: &Route, now: Instant) -> Option<PoolEntry> {
        let pool = self.routes.get_mut(route)?;
        while let Some(entry) = pool.available.pop_back() {
            self.available -= 1;
            if !entry.is_expired(now) {
                return Some(entry);
            }
        }
        None
    }

    fn allocated(&self) -> usize {
        self.leased + self.available
    }

    fn route_allocated(&self, route: &Route) -> usize {
        self.routes.get(route).map_or(0, RoutePool::allocated)
    }

    /// Discards the least recently used available slot of any route.
    fn evict_least_recently_used(&mut self) -> bool {
        let candidate = self
            .routes
            .iter()
            .filter_map(|(route, pool)| pool.available.front().map(|entry| (route, entry.updated)))
            .min_by_key(|(_, updated)| *updated)
            .map(|(route, _)| route.clone());
        let Some(route) = candidate else {
            return false;
        };
        if let Some(pool) = self.routes.get_mut(&route) {
            pool.available.pop_front();
            self.available -= 1;
        }
        self.remove_if_unused(&route);
        true
    }

    fn new_entry(&mut self, now: Instant, time_to_live: Option<Duration>) -> PoolEntry {
        self.next_id += 1;
        PoolEntry {
            id: self.next_id,
            created: now,
            updated: now,
            expiry: time_to_live.and_then(|ttl| now.checked_add(ttl)),
        }
    }

    fn mark_leased(&mut self, route: &Route) {
        self.routes.entry(route.clone()).or_default().leased += 1;
        self.leased += 1;
    }

    fn retain_available<F>(&mut self, keep: F)
    where
        F: Fn(&PoolEntry) -> bool,
    {
        let mut discarded = 0;
        for pool in self.routes.values_mut() {
            let before = pool.available.len();
            pool.available.retain(|entry| keep(entry));
            discarded += before - pool.available.len();
        }
        self.available -= discarded;
        self.routes.retain(|_, pool| pool.allocated() > 0);
    }

    fn remove_if_unused(&mut self, route: &Route) {
        if self.routes.get(route).is_some_and(|pool| pool.allocated() == 0) {
            self.routes.remove(route);
        }
    }
}

/// Connection manager bounding the slots per route and in total.
/// It is safe to lease and release from multiple threads.
pub struct PoolingConnectionManager {
    limits: PoolLimits,
    socket_factories: SocketFactoryRegistry,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolingConnectionManager {
    pub fn new(socket_factories: SocketFactoryRegistry, limits: PoolLimits) -> Self {
        Self {
            limits,
            socket_factories,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    pub fn socket_factories(&self) -> &SocketFactoryRegistry {
        &self.socket_factories
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionManager for PoolingConnectionManager {
    fn lease(&self, route: &Route, timeout: Duration) -> Result<ConnectionLease, PoolError> {
        if self.socket_factories.lookup(route.scheme()).is_none() {
            return Err(PoolError::UnsupportedScheme(route.scheme().to_string()));
        }
        // An unrepresentable deadline means waiting without limit.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        loop {
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            let now = Instant::now();

            let entry = match state.take_available(route, now) {
                Some(entry) => Some(entry),
                None if state.route_allocated(route) < self.limits.max_per_route => {
                    if state.allocated() < self.limits.max_total
                        || state.evict_least_recently_used()
                    {
                        Some(state.new_entry(now, self.limits.time_to_live))
                    } else {
                        None
                    }
                }
                None => None,
            };

            if let Some(entry) = entry {
                state.mark_leased(route);
                return Ok(ConnectionLease {
                    id: entry.id,
                    route: route.clone(),
                    created: entry.created,
                    expiry: entry.expiry,
                });
            }

            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(now);
                    if remaining.is_zero() {
                        return Err(PoolError::LeaseTimeout {
                            route: route.clone(),
                            timeout,
                        });
                    }
                    self.released
                        .wait_timeout(state, remaining)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|err| err.into_inner().0)
                }
                None => self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn release(&self, lease: ConnectionLease, reusable: bool) {
        let mut state = self.lock_state();
        let now = Instant::now();
        let keep = reusable && !state.shut_down && !lease.is_expired(now);
        state.leased = state.leased.saturating_sub(1);
        if let Some(pool) = state.routes.get_mut(&lease.route) {
            pool.leased = pool.leased.saturating_sub(1);
            if keep {
                pool.available.push_back(PoolEntry {
                    id: lease.id,
                    created: lease.created,
                    updated: now,
                    expiry: lease.expiry,
                });
            }
        }
        if keep {
            state.available += 1;
        }
        state.remove_if_unused(&lease.route);
        drop(state);
        self.released.notify_all();
    }

    fn close_expired(&self) {
        let now = Instant::now();
        self.lock_state()
            .retain_available(|entry| !entry.is_expired(now));
        self.released.notify_all();
    }

    fn close_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        self.lock_state()
            .retain_available(|entry| now.saturating_duration_since(entry.updated) < idle_for);
        self.released.notify_all();
    }

    fn limits(&self) -> PoolLimits {
        self.limits
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            leased: state.leased,
            available: state.available,
            routes: state.routes.len(),
        }
    }

    fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shut_down = true;
        state.retain_available(|_| false);
        drop(state);
        self.released.notify_all();
    }
}

/// Creates the connection manager of a client: both the per route and total limits are `max_connections` and
/// slots live at most `connection_ttl`. The manager is registered in the global [IdleConnectionReaper] when the
/// configuration asks for it.
pub fn create_pooling_connection_manager(
    config: &ClientConfiguration,
    socket_factories: SocketFactoryRegistry,
) -> Arc<PoolingConnectionManager> {
    let limits = PoolLimits::uniform(config.max_connections(), config.connection_ttl);
    let manager = Arc::new(PoolingConnectionManager::new(socket_factories, limits));
    if config.use_reaper() {
        IdleConnectionReaper::global().register(manager.clone());
    }
    debug!(
        max_connections = limits.max_total,
        ttl = ?limits.time_to_live,
        reaper = config.use_reaper(),
        "connection manager created"
    );
    manager
}
