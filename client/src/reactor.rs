//! Single-threaded event loop shared by factories and receivers.
//!
//! Engine callbacks, retry timers and operation timers all run on one tokio
//! `current_thread` runtime. [`Reactor::shared`] hands out a process-wide
//! instance that lives on a dedicated thread for as long as any handle to it
//! exists; dropping the last handle stops the thread.

use crate::common::{MessagingError, MessagingResult};
use crate::utils::sync::lock;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REACTOR_THREAD_NAME: &str = "hubstream-reactor";

static SHARED_REACTOR: Lazy<Mutex<Weak<ReactorInner>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct ReactorInner {
    handle: Handle,
    shutdown: Option<CancellationToken>,
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.shutdown {
            log::debug!("Last reactor handle dropped, stopping reactor thread");
            shutdown.cancel();
        }
    }
}

/// Cloneable handle to the event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

/// A scheduled action that has not run yet.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Prevent the action from running. No effect once it has started.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Reactor {
    /// The process-wide reactor, started on first use.
    pub fn shared() -> MessagingResult<Self> {
        let mut slot = lock(&SHARED_REACTOR);
        if let Some(inner) = slot.upgrade() {
            return Ok(Self { inner });
        }

        let reactor = Self::start(REACTOR_THREAD_NAME)?;
        *slot = Arc::downgrade(&reactor.inner);
        Ok(reactor)
    }

    /// Start a private reactor on a new thread.
    pub fn start(thread_name: &str) -> MessagingResult<Self> {
        let (handle_tx, handle_rx) = flume::bounded(1);
        let shutdown = CancellationToken::new();
        let thread_shutdown = shutdown.clone();
        let name = thread_name.to_string();

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }

                let span = tracing::info_span!("reactor", thread = %name);
                let _entered = span.enter();
                log::debug!("Reactor thread started");
                runtime.block_on(thread_shutdown.cancelled());
                log::debug!("Reactor thread stopped");
            })
            .map_err(|e| MessagingError::Internal(format!("failed to spawn reactor thread: {e}")))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| MessagingError::Internal("reactor thread exited during startup".into()))?
            .map_err(|e| MessagingError::Internal(format!("failed to build reactor runtime: {e}")))?;

        Ok(Self {
            inner: Arc::new(ReactorInner {
                handle,
                shutdown: Some(shutdown),
            }),
        })
    }

    /// Run on an existing runtime. The runtime's lifetime stays with its owner.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                handle,
                shutdown: None,
            }),
        }
    }

    /// Run `action` after `delay`.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        TimerHandle { task }
    }

    /// Run `action` on the reactor as soon as possible.
    pub fn dispatch<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handle.spawn(async move { action() });
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn ptr_eq(&self, other: &Reactor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("owns_thread", &self.inner.shutdown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_shared_reactor_is_reused_while_alive() {
        let first = assert_ok!(Reactor::shared());
        let second = assert_ok!(Reactor::shared());
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn test_dispatch_runs_on_reactor_thread() {
        let reactor = assert_ok!(Reactor::start("hubstream-test-reactor"));
        let (tx, rx) = flume::bounded(1);

        reactor.dispatch(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = assert_ok!(rx.recv_timeout(Duration::from_secs(5)));
        assert_eq!(name.as_deref(), Some("hubstream-test-reactor"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_does_not_fire() {
        let reactor = Reactor::with_handle(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let timer = reactor.schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        reactor.schedule(Duration::from_secs(2), move || {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
