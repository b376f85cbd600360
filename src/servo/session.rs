use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::DetectionFeed;

use super::controller::{ServoController, ServoRig, ServoSettings};
use super::state::{Phase, ServoState, ServoStatus};

/// Builds a fresh detection feed for each session.
pub type FeedFactory = Arc<dyn Fn() -> Box<dyn DetectionFeed> + Send + Sync>;

/// Zero-argument hook run once per completed grasp.
pub type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// Start/stop/status surface used by the control API.
pub trait ServoControl: Send + Sync {
    fn start(&self, target: &str) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn status(&self) -> ServoStatus;
}

struct Worker {
    cancel: Arc<AtomicBool>,
    done: Receiver<ServoState>,
    join: JoinHandle<()>,
}

impl Worker {
    fn is_stopping(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Join a worker whose thread has already exited.
fn reap(worker: Worker) -> Result<()> {
    worker
        .join
        .join()
        .map_err(|_| anyhow!("servoing thread panicked"))
}

/// Owns at most one servoing session thread at a time.
pub struct ServoingService {
    settings: ServoSettings,
    rig: ServoRig,
    feeds: FeedFactory,
    on_complete: Option<CompletionHook>,
    status: Arc<Mutex<ServoStatus>>,
    worker: Mutex<Option<Worker>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServoingService {
    pub fn new(settings: ServoSettings, rig: ServoRig, feeds: FeedFactory) -> Self {
        Self {
            settings,
            rig,
            feeds,
            on_complete: None,
            status: Arc::new(Mutex::new(ServoStatus::idle())),
            worker: Mutex::new(None),
        }
    }

    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Block until the current session ends. Returns its final state, or None
    /// when no session was running or `timeout` elapsed first.
    pub fn wait(&self, timeout: Duration) -> Option<ServoState> {
        let mut slot = guard(&self.worker);
        let worker = slot.as_ref()?;
        match worker.done.recv_timeout(timeout) {
            Ok(state) => {
                if let Some(worker) = slot.take() {
                    let _ = reap(worker);
                }
                Some(state)
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = slot.take() {
                    let _ = reap(worker);
                }
                None
            }
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    /// True while a session thread is alive, including one still winding down
    /// after a stop request.
    pub fn is_busy(&self) -> bool {
        guard(&self.worker)
            .as_ref()
            .map_or(false, |worker| !worker.join.is_finished())
    }
}

impl ServoControl for ServoingService {
    fn start(&self, target: &str) -> Result<()> {
        let target = target.trim();
        if target.is_empty() {
            return Err(anyhow!("servoing target must not be empty"));
        }
        let mut slot = guard(&self.worker);
        if let Some(worker) = slot.as_ref() {
            if !worker.join.is_finished() {
                if worker.is_stopping() {
                    return Err(anyhow!(
                        "servoing already running: previous session is still stopping"
                    ));
                }
                return Err(anyhow!("servoing already running"));
            }
        }
        if let Some(finished) = slot.take() {
            if let Err(err) = reap(finished) {
                log::error!("ServoingService: {:#}", err);
            }
        }

        *guard(&self.status) = ServoStatus {
            phase: Phase::Searching,
            target: Some(target.to_string()),
            running: true,
            ..ServoStatus::idle()
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let mut controller = ServoController::new(
            self.settings.clone(),
            self.rig.clone(),
            (self.feeds)(),
            target,
        )
        .with_cancel(cancel.clone());
        let status = self.status.clone();
        let hook = self.on_complete.clone();
        let join = std::thread::Builder::new()
            .name("servoing".into())
            .spawn(move || {
                controller.begin();
                let cancelled = controller.run(|snapshot| {
                    *guard(&status) = snapshot.clone();
                });
                let mut last = controller.status(false);
                if cancelled {
                    last.phase = Phase::Stopped;
                    log::info!(
                        "ServoingService: stopped '{}' during step {}",
                        controller.session().target,
                        controller.session().steps
                    );
                }
                *guard(&status) = last;
                let state = controller.state().clone();
                if state == ServoState::Complete {
                    if let Some(hook) = hook {
                        hook();
                    }
                }
                let _ = done_tx.send(state);
            })?;

        *slot = Some(Worker { cancel, done, join });
        log::info!("ServoingService: started for '{}'", target);
        Ok(())
    }

    /// Cancel the session and wait up to the configured join timeout.
    /// Calling it with no session running is a no-op.
    ///
    /// A session still inside a step when the timeout expires stays in the slot,
    /// cancelled, and `start` refuses until its thread has exited.
    fn stop(&self) -> Result<()> {
        let mut slot = guard(&self.worker);
        let Some(worker) = slot.take() else {
            return Ok(());
        };
        worker.cancel.store(true, Ordering::SeqCst);
        let timeout = Duration::from_millis(self.settings.stop_join_timeout_ms);
        match worker.done.recv_timeout(timeout) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => reap(worker),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "ServoingService: session still finishing a step after {:?}; it stops at the next step boundary",
                    timeout
                );
                *slot = Some(worker);
                Ok(())
            }
        }
    }

    fn status(&self) -> ServoStatus {
        guard(&self.status).clone()
    }
}

impl Drop for ServoingService {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("ServoingService: {:#}", err);
        }
        // A cancelled session exits at its next step boundary.
        if let Some(worker) = guard(&self.worker).take() {
            if let Err(err) = reap(worker) {
                log::error!("ServoingService: {:#}", err);
            }
        }
    }
}
