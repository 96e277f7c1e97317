//! Process wide service closing expired and idle pooled connections in the background.
use crate::pool::ConnectionManager;
use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

pub const REAPER_THREAD_NAME: &str = "idle-connection-reaper";
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

type Managers = Vec<Arc<dyn ConnectionManager>>;

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ReaperState {
    managers: Managers,
    worker: Option<Worker>,
}

/// Periodically calls [ConnectionManager::close_expired] and [ConnectionManager::close_idle] on every
/// registered manager.
///
/// The worker thread is started when the first manager is registered and stopped once the last one is
/// deregistered. [IdleConnectionReaper::global] is the instance used by
/// [crate::pool::create_pooling_connection_manager].
pub struct IdleConnectionReaper {
    interval: Duration,
    max_idle: Duration,
    state: Arc<Mutex<ReaperState>>,
}

impl IdleConnectionReaper {
    pub fn new(interval: Duration, max_idle: Duration) -> Self {
        Self {
            interval,
            max_idle,
            state: Arc::default(),
        }
    }

    pub fn global() -> &'static IdleConnectionReaper {
        static GLOBAL: OnceLock<IdleConnectionReaper> = OnceLock::new();
        GLOBAL.get_or_init(|| IdleConnectionReaper::new(DEFAULT_REAP_INTERVAL, DEFAULT_MAX_IDLE))
    }

    /// Registers the manager, starting the worker if it is not running. Registering a manager twice has no effect.
    pub fn register(&self, manager: Arc<dyn ConnectionManager>) {
        let mut state = self.lock_state();
        if state
            .managers
            .iter()
            .any(|registered| same_manager(registered, &manager))
        {
            return;
        }
        state.managers.push(manager);
        debug!(managers = state.managers.len(), "connection manager registered in reaper");
        if state.worker.is_none() {
            state.worker = self.start_worker();
        }
    }

    /// Deregisters the manager, stopping the worker when no managers remain.
    /// Returns false if the manager was not registered.
    pub fn deregister<M: ?Sized>(&self, manager: &Arc<M>) -> bool {
        let mut state = self.lock_state();
        let before = state.managers.len();
        state
            .managers
            .retain(|registered| !same_manager(registered, manager));
        let removed = state.managers.len() < before;
        let worker = if state.managers.is_empty() {
            state.worker.take()
        } else {
            None
        };
        drop(state);

        if let Some(worker) = worker {
            stop_worker(worker);
        }
        removed
    }

    /// Deregisters every manager and stops the worker.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.managers.clear();
        let worker = state.worker.take();
        drop(state);

        if let Some(worker) = worker {
            stop_worker(worker);
        }
    }

    pub fn is_registered<M: ?Sized>(&self, manager: &Arc<M>) -> bool {
        self.lock_state()
            .managers
            .iter()
            .any(|registered| same_manager(registered, manager))
    }

    /// Time after which the worker closes connections that were not used.
    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().worker.is_some()
    }

    pub fn registered(&self) -> usize {
        self.lock_state().managers.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, ReaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_worker(&self) -> Option<Worker> {
        let (stop, stop_consumer) = bounded::<()>(1);
        let state = self.state.clone();
        let interval = self.interval;
        let max_idle = self.max_idle;

        let spawned = thread::Builder::new()
            .name(REAPER_THREAD_NAME.to_string())
            .spawn(move || {
                loop {
                    match stop_consumer.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let managers = state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .managers
                        .clone();
                    for manager in managers {
                        manager.close_expired();
                        manager.close_idle(max_idle);
                    }
                }
                debug!("{REAPER_THREAD_NAME} finished");
            });

        match spawned {
            Ok(handle) => {
                info!(interval = ?self.interval, "idle connection reaper started");
                Some(Worker { stop, handle })
            }
            Err(err) => {
                error!("could not start the idle connection reaper: {err}");
                None
            }
        }
    }
}

fn same_manager<M: ?Sized>(registered: &Arc<dyn ConnectionManager>, manager: &Arc<M>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(registered), Arc::as_ptr(manager))
}

fn stop_worker(worker: Worker) {
    // The worker also stops if the channel is disconnected.
    let _ = worker.stop.try_send(());
    if worker.handle.join().is_err() {
        error!("{REAPER_THREAD_NAME} panicked");
    }
    info!("idle connection reaper stopped");
}
