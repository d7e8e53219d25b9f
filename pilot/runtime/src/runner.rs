use mesh_pilot_core::{Controller, Error, StopSignal};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info_span, Instrument};

/// The lifecycle of a managed loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopState {
    Created,
    Starting,
    /// The loop completed its first full sync.
    Running,
    /// The stop signal fired and the loop has not yet returned.
    Stopping,
    Stopped,
}

/// Drives a single [`Controller`] through its [`LoopState`]s.
pub struct ControllerRunner {
    name: String,
    controller: Arc<dyn Controller>,
    state: Arc<watch::Sender<LoopState>>,
    task: Option<JoinHandle<()>>,
}

// === impl LoopState ===

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// === impl ControllerRunner ===

impl ControllerRunner {
    pub fn new(name: impl ToString, controller: Arc<dyn Controller>) -> Self {
        Self {
            name: name.to_string(),
            controller,
            state: Arc::new(watch::channel(LoopState::Created).0),
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Spawns the loop. Has no effect unless the runner is `Created`.
    pub fn start(&mut self, stop: StopSignal) {
        if !self.state.send_if_modified(|s| transition(s, LoopState::Created, LoopState::Starting)) {
            return;
        }

        let controller = self.controller.clone();
        let state = self.state.clone();
        let task = async move {
            let synced = controller.synced();
            let run = controller.run(stop.clone());
            tokio::pin!(run);
            let synced = synced.wait();
            tokio::pin!(synced);
            let signaled = stop.signaled();
            tokio::pin!(signaled);

            let (mut is_synced, mut is_signaled) = (false, false);
            loop {
                tokio::select! {
                    () = &mut run => break,

                    () = &mut synced, if !is_synced => {
                        is_synced = true;
                        if state.send_if_modified(|s| transition(s, LoopState::Starting, LoopState::Running)) {
                            tracing::debug!("Running");
                        }
                    }

                    release = &mut signaled, if !is_signaled => {
                        is_signaled = true;
                        drop(release);
                        state.send_if_modified(|s| {
                            transition(s, LoopState::Starting, LoopState::Stopping)
                                || transition(s, LoopState::Running, LoopState::Stopping)
                        });
                    }
                }
            }

            if !is_signaled {
                tracing::warn!(state = %*state.borrow(), "Loop exited before shutdown");
            }
            state.send_replace(LoopState::Stopped);
            tracing::debug!("Stopped");
        };
        self.task = Some(tokio::spawn(
            task.instrument(info_span!("loop", name = %self.name)),
        ));
    }

    /// Waits for the loop to reach `Running`.
    ///
    /// Fails if it does not within `timeout`, or if it returns first.
    pub async fn wait_running(&self, timeout: Duration) -> Result<(), Error> {
        let mut states = self.state.subscribe();
        let reached = async move {
            states
                .wait_for(|s| *s >= LoopState::Running)
                .await
                .map(|s| *s)
        };
        match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(LoopState::Running)) => Ok(()),
            Ok(_) => Err(Error::LoopExited {
                name: self.name.clone(),
            }),
            Err(_) => Err(Error::StartupTimeout {
                name: self.name.clone(),
                timeout,
            }),
        }
    }

    /// Waits for a started loop's task to complete.
    ///
    /// The task stays abortable if the wait is cancelled.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let res = task.await;
            self.task = None;
            if let Err(error) = res {
                tracing::error!(name = %self.name, %error, "Loop failed");
                self.state.send_replace(LoopState::Stopped);
            }
        }
    }

    /// Cancels the loop's task without waiting for it to observe the stop
    /// signal.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.send_replace(LoopState::Stopped);
    }
}

fn transition(state: &mut LoopState, from: LoopState, to: LoopState) -> bool {
    if *state != from {
        return false;
    }
    *state = to;
    true
}
