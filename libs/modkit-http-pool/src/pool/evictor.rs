use crate::error::HttpError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Something an [`IdleEvictor`] can sweep.
pub trait SweepTarget: Send + Sync {
    /// Close connections past their lifetime or reuse window.
    ///
    /// # Errors
    ///
    /// [`HttpError::PoolClosed`] stops the evictor; any other error is logged
    /// and the next sweep proceeds as usual.
    fn close_expired(&self) -> Result<usize, HttpError>;

    /// Close free connections idle for longer than `max_idle`.
    ///
    /// # Errors
    ///
    /// Same contract as [`SweepTarget::close_expired`].
    fn close_idle(&self, max_idle: Duration) -> Result<usize, HttpError>;
}

/// Lifecycle of an [`IdleEvictor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictorState {
    /// Constructed, not started
    Idle,
    /// Sweep loop running
    Running,
    /// Stopped; never restarted
    Stopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

fn decode(state: u8) -> EvictorState {
    match state {
        IDLE => EvictorState::Idle,
        RUNNING => EvictorState::Running,
        _ => EvictorState::Stopped,
    }
}

/// Background task that periodically sweeps a pool.
///
/// Each iteration sleeps for `interval`, then calls
/// [`close_expired`](SweepTarget::close_expired) followed by
/// [`close_idle`](SweepTarget::close_idle). The target is held weakly: the
/// loop ends on [`stop`](Self::stop), when the target is dropped, or when it
/// reports [`HttpError::PoolClosed`].
pub struct IdleEvictor {
    target: Weak<dyn SweepTarget>,
    interval: Duration,
    max_idle: Duration,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleEvictor {
    #[must_use]
    pub fn new(target: Weak<dyn SweepTarget>, interval: Duration, max_idle: Duration) -> Self {
        Self {
            target,
            interval,
            max_idle,
            state: Arc::new(AtomicU8::new(IDLE)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> EvictorState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Spawn the sweep loop on the current Tokio runtime.
    ///
    /// Calling `start` on an evictor that is already running or stopped is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Configuration`] when called outside a Tokio
    /// runtime.
    pub fn start(&self) -> Result<(), HttpError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            HttpError::Configuration(format!("idle evictor requires a Tokio runtime: {e}"))
        })?;

        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(state = ?self.state(), "idle evictor already started; ignoring");
            return Ok(());
        }

        let task = handle.spawn(run_sweeps(
            self.target.clone(),
            self.interval,
            self.max_idle,
            self.cancel.clone(),
            Arc::clone(&self.state),
        ));
        *self.task.lock() = Some(task);

        tracing::debug!(
            interval_ms = self.interval.as_millis(),
            max_idle_ms = self.max_idle.as_millis(),
            "idle evictor started"
        );
        Ok(())
    }

    /// Signal the sweep loop to exit. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state.store(STOPPED, Ordering::Release);
    }

    /// Stop the loop and wait for the task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "idle evictor task panicked");
        }
    }
}

impl Drop for IdleEvictor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_sweeps(
    target: Weak<dyn SweepTarget>,
    interval: Duration,
    max_idle: Duration,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        let swept = target
            .close_expired()
            .and_then(|expired| target.close_idle(max_idle).map(|idle| (expired, idle)));

        match swept {
            Ok((expired, idle)) => {
                if expired + idle > 0 {
                    tracing::debug!(expired, idle, "evicted pooled connections");
                }
            }
            Err(HttpError::PoolClosed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "idle connection sweep failed; retrying next interval");
            }
        }
    }

    state.store(STOPPED, Ordering::Release);
    tracing::debug!("idle evictor stopped");
}
