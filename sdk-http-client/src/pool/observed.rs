use crate::pool::{ConnectionLease, ConnectionManager, PoolError, PoolLimits, PoolStats, Route};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Notified of every lease and release going through an [ObservedConnectionManager].
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionLifecycleListener: Send + Sync {
    fn on_lease(&self, route: &Route, result: &Result<ConnectionLease, PoolError>);
    fn on_release(&self, lease: &ConnectionLease, reusable: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLifecycleListener;

impl ConnectionLifecycleListener for TracingLifecycleListener {
    fn on_lease(&self, route: &Route, result: &Result<ConnectionLease, PoolError>) {
        match result {
            Ok(lease) => trace!(%route, connection = lease.id(), "connection leased"),
            Err(err) => trace!(%route, "connection lease failed: {err}"),
        }
    }

    fn on_release(&self, lease: &ConnectionLease, reusable: bool) {
        trace!(route = %lease.route(), connection = lease.id(), reusable, "connection released");
    }
}

/// Connection manager forwarding every call to the wrapped one, notifying lease and release calls to the
/// listener. Pooling behaviour is the one of the wrapped manager.
pub struct ObservedConnectionManager<M: ?Sized = dyn ConnectionManager> {
    inner: Arc<M>,
    listener: Arc<dyn ConnectionLifecycleListener>,
}

impl<M: ConnectionManager + ?Sized> ObservedConnectionManager<M> {
    pub fn new(inner: Arc<M>) -> Self {
        Self::with_listener(inner, Arc::new(TracingLifecycleListener))
    }

    pub fn with_listener(inner: Arc<M>, listener: Arc<dyn ConnectionLifecycleListener>) -> Self {
        Self { inner, listener }
    }

    pub fn inner(&self) -> &Arc<M> {
        &self.inner
    }
}

impl<M: ConnectionManager + ?Sized> ConnectionManager for ObservedConnectionManager<M> {
    fn lease(&self, route: &Route, timeout: Duration) -> Result<ConnectionLease, PoolError> {
        let result = self.inner.lease(route, timeout);
        self.listener.on_lease(route, &result);
        result
    }

    fn release(&self, lease: ConnectionLease, reusable: bool) {
        self.listener.on_release(&lease, reusable);
        self.inner.release(lease, reusable)
    }

    fn close_expired(&self) {
        self.inner.close_expired()
    }

    fn close_idle(&self, idle_for: Duration) {
        self.inner.close_idle(idle_for)
    }

    fn limits(&self) -> PoolLimits {
        self.inner.limits()
    }

    fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}
