//! Application state: the simulated SDK and the session directory

use anyhow::{bail, Context, Result};
use shutter_core::{DirectoryOutput, ObjectId, SdkEvent};
use shutter_session::{RunExit, Session, SessionDirectory, SessionEvent, SimFrameDecoder, SimManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;

/// How long each pump slice runs while waiting on session events
const POLL_SLICE: Duration = Duration::from_millis(20);

pub struct AppState {
    pub manager: Arc<SimManager>,
    pub directory: SessionDirectory,
    pub config: Config,
    events: mpsc::UnboundedReceiver<SdkEvent>,
    wait: Duration,
}

impl AppState {
    /// Bring up the SDK, open the manager session and plug in the camera
    pub fn new(config: Config, wait: Duration) -> Self {
        let (manager, events) = SimManager::new("Shutter Simulator");
        let outputs = Arc::new(DirectoryOutput::new(&config.output.video_dir));
        let mut directory = SessionDirectory::new(
            config.to_directory_config(),
            Arc::new(SimFrameDecoder),
            outputs,
        );
        directory.open_manager(manager.clone());

        let camera = manager.attach(config.simulator.clone());
        info!(device = %camera.id(), "Camera plugged in");

        Self {
            manager,
            directory,
            config,
            events,
            wait,
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn session(&mut self, id: &ObjectId) -> Result<&mut Session> {
        self.directory
            .get_mut(id)
            .with_context(|| format!("Device {} is no longer attached", id))
    }

    /// Apply queued notifications without waiting
    pub fn pump_pending(&mut self) -> usize {
        self.directory.pump_pending(&mut self.events)
    }

    /// Run the event pump for `duration`
    pub async fn pump(&mut self, duration: Duration) -> Result<()> {
        match self.directory.run_for(&mut self.events, duration).await {
            RunExit::Done => Ok(()),
            RunExit::EventsClosed => bail!("SDK event stream closed"),
        }
    }

    /// Run the event pump until `done` holds, bounded by the wait limit
    pub async fn wait_until<F>(&mut self, done: F) -> Result<()>
    where
        F: FnMut(&SessionDirectory) -> bool,
    {
        let run = self.directory.run_until(&mut self.events, done);
        match tokio::time::timeout(self.wait, run).await {
            Ok(RunExit::Done) => Ok(()),
            Ok(RunExit::EventsClosed) => bail!("SDK event stream closed"),
            Err(_) => bail!("Timed out after {:?}", self.wait),
        }
    }

    /// Wait for a device session and return its id
    pub async fn wait_for_device(&mut self) -> Result<ObjectId> {
        self.wait_until(|d| d.device_count() > 0)
            .await
            .context("No camera attached")?;
        self.directory
            .iter()
            .rev()
            .find(|s| s.is_device())
            .map(|s| s.id().clone())
            .context("No camera attached")
    }

    /// Pump events until `pick` accepts one from `rx`
    pub async fn wait_for_event<T, F>(
        &mut self,
        rx: &mut broadcast::Receiver<SessionEvent>,
        mut pick: F,
    ) -> Result<T>
    where
        F: FnMut(SessionEvent) -> Option<T>,
    {
        let deadline = Instant::now() + self.wait;
        loop {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        if let Some(picked) = pick(event) {
                            return Ok(picked);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!(missed, "Session events dropped");
                    }
                    Err(TryRecvError::Closed) => bail!("Session closed"),
                }
            }

            if Instant::now() >= deadline {
                bail!("Timed out after {:?}", self.wait);
            }
            self.pump(POLL_SLICE).await?;
        }
    }

    /// Stop everything before the SDK handles go away
    pub fn shutdown(&mut self) {
        self.directory.shutdown();
    }
}
