//! Start/stop plumbing for a long-lived background routine.
//!
//! ```rust
//! use std::time::Duration;
//! use corelink_framework::Runner;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), corelink_framework::FrameworkError> {
//! let runner = Runner::new("ticker");
//! runner.start(|mut controller| async move {
//!     let mut tick = tokio::time::interval(Duration::from_millis(10));
//!     loop {
//!         tokio::select! {
//!             _ = controller.notified() => break,
//!             _ = tick.tick() => {}
//!         }
//!     }
//! })?;
//! runner.stop().await?;
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::FrameworkError;

/// Handed to the routine: tells it when to wind down and acknowledges
/// its exit when dropped.
pub struct RoutineController {
    notify: mpsc::Receiver<()>,
    stopping: Arc<AtomicBool>,
    exit: Option<oneshot::Sender<()>>,
}

impl RoutineController {
    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Wait for a stop notification. Also returns once the runner is gone.
    pub async fn notified(&mut self) {
        if self.is_stopping() {
            return;
        }
        let _ = self.notify.recv().await;
    }

    /// Acknowledge the exit explicitly.
    pub fn exit(mut self) {
        self.acknowledge();
    }

    fn acknowledge(&mut self) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(());
        }
    }
}

impl Drop for RoutineController {
    fn drop(&mut self) {
        self.acknowledge();
    }
}

struct Active {
    notify: mpsc::Sender<()>,
    stopping: Arc<AtomicBool>,
    exit: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

/// Runs at most one routine at a time.
pub struct Runner {
    name: String,
    active: Mutex<Option<Active>>,
}

impl Runner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Spawn `routine` with a fresh controller.
    pub fn start<F, Fut>(&self, routine: F) -> Result<(), FrameworkError>
    where
        F: FnOnce(RoutineController) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
            return Err(FrameworkError::RoutineRunning);
        }
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let controller = RoutineController {
            notify: notify_rx,
            stopping: stopping.clone(),
            exit: Some(exit_tx),
        };
        let task = tokio::spawn(routine(controller));
        *active = Some(Active {
            notify: notify_tx,
            stopping,
            exit: exit_rx,
            task,
        });
        tracing::debug!("runner: '{}' started", self.name);
        Ok(())
    }

    /// Ask the routine to stop and wait until it acknowledged.
    pub async fn stop(&self) -> Result<(), FrameworkError> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(FrameworkError::RoutineStopped)?;
        active.stopping.store(true, Ordering::Release);
        let _ = active.notify.try_send(());
        // A dropped sender means the routine already exited.
        let _ = active.exit.await;
        if let Err(e) = active.task.await {
            tracing::warn!("runner: '{}' ended abnormally: {e}", self.name);
        }
        tracing::debug!("runner: '{}' stopped", self.name);
        Ok(())
    }
}
