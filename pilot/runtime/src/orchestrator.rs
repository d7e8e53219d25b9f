use crate::runner::{ControllerRunner, LoopState};
use futures::future;
use mesh_pilot_core::{Controller, Error, StopSignal};
use std::{sync::Arc, time::Duration};

/// Starts managed loops in dependency order and stops them together.
///
/// Dependencies (service registries and the config cache) are started first;
/// consumers are started only once every dependency is running. If any loop
/// fails to reach running within the startup timeout, every started loop is
/// stopped before the error is returned.
pub struct Orchestrator {
    dependencies: Vec<ControllerRunner>,
    consumers: Vec<ControllerRunner>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
    signal: Option<drain::Signal>,
    stop: Option<StopSignal>,
}

// === impl Orchestrator ===

impl Orchestrator {
    pub fn new(startup_timeout: Duration, shutdown_grace: Duration) -> Self {
        let (signal, stop) = drain::channel();
        Self {
            dependencies: vec![],
            consumers: vec![],
            startup_timeout,
            shutdown_grace,
            signal: Some(signal),
            stop: Some(stop),
        }
    }

    pub fn dependency(mut self, name: impl ToString, controller: Arc<dyn Controller>) -> Self {
        self.dependencies
            .push(ControllerRunner::new(name, controller));
        self
    }

    pub fn consumer(mut self, name: impl ToString, controller: Arc<dyn Controller>) -> Self {
        self.consumers.push(ControllerRunner::new(name, controller));
        self
    }

    /// A handle on the stop signal for tasks that are not managed loops.
    ///
    /// Shutdown waits for every handle to be released.
    pub fn stop_signal(&self) -> Option<StopSignal> {
        self.stop.clone()
    }

    pub fn states(&self) -> Vec<(&str, LoopState)> {
        self.runners().map(|r| (r.name(), r.state())).collect()
    }

    fn runners(&self) -> impl Iterator<Item = &ControllerRunner> {
        self.dependencies.iter().chain(&self.consumers)
    }

    /// Starts every loop, returning once all of them are running.
    pub async fn start(&mut self) -> Result<(), Error> {
        let Some(stop) = self.stop.clone() else {
            return Err(Error::LoopExited {
                name: "orchestrator".to_string(),
            });
        };

        if let Err(error) = Self::start_phase(&mut self.dependencies, &stop, self.startup_timeout).await {
            tracing::error!(%error, "Dependencies failed to start");
            drop(stop);
            self.rollback().await;
            return Err(error);
        }
        tracing::info!(loops = self.dependencies.len(), "Dependencies running");

        if let Err(error) = Self::start_phase(&mut self.consumers, &stop, self.startup_timeout).await {
            tracing::error!(%error, "Consumers failed to start");
            drop(stop);
            self.rollback().await;
            return Err(error);
        }
        tracing::info!(loops = self.consumers.len(), "Consumers running");
        Ok(())
    }

    async fn start_phase(
        runners: &mut [ControllerRunner],
        stop: &StopSignal,
        timeout: Duration,
    ) -> Result<(), Error> {
        for runner in runners.iter_mut() {
            runner.start(stop.clone());
        }
        future::try_join_all(runners.iter().map(|r| r.wait_running(timeout))).await?;
        Ok(())
    }

    async fn rollback(&mut self) {
        if let Err(error) = self.shutdown().await {
            tracing::warn!(%error, "Rollback did not complete");
        }
    }

    /// Fires the stop signal and waits for every loop to stop.
    ///
    /// Loops still running after the grace period are aborted.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let Some(signal) = self.signal.take() else {
            return Ok(());
        };
        drop(self.stop.take());

        let grace = self.shutdown_grace;
        let runners = self.dependencies.iter_mut().chain(&mut self.consumers);
        let stopped = async move {
            signal.drain().await;
            future::join_all(runners.map(|r| r.join())).await;
        };
        if tokio::time::timeout(grace, stopped).await.is_ok() {
            tracing::info!("All loops stopped");
            return Ok(());
        }

        for runner in self.dependencies.iter_mut().chain(&mut self.consumers) {
            if runner.state() != LoopState::Stopped {
                tracing::warn!(name = %runner.name(), state = %runner.state(), "Aborting loop");
                runner.abort();
            }
        }
        Err(Error::ShutdownTimeout(grace))
    }
}
