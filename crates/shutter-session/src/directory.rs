//! Session directory
//!
//! Owns every open session and the event pump that feeds them: SDK
//! notifications, decode results coming back from live-view workers, and the
//! one interval timer that ticks every running live-view loop.

use shutter_core::{
    CapabilityBackend, DeviceBackend, FrameDecoder, InterruptReason, ObjectId, OutputProvider,
    SdkEvent,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::liveview::{DecodeOutcome, LiveViewConfig, TickOutcome};
use crate::session::{DeviceResources, Session};

const EVENT_CAPACITY: usize = 64;

/// Session directory configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub live_view: LiveViewConfig,
}

/// Attach/detach notifications published by the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Attached { id: ObjectId, name: String },
    Detached { id: ObjectId },
}

/// Why `run_until` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The caller's condition was met
    Done,
    /// The SDK event stream closed
    EventsClosed,
}

/// All open sessions, keyed by SDK object identity
///
/// Manager sessions come first, followed by device sessions in attach order.
pub struct SessionDirectory {
    sessions: Vec<Session>,
    config: DirectoryConfig,
    decoder: Arc<dyn FrameDecoder>,
    outputs: Arc<dyn OutputProvider>,
    results_tx: mpsc::UnboundedSender<DecodeOutcome>,
    results_rx: mpsc::UnboundedReceiver<DecodeOutcome>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl SessionDirectory {
    pub fn new(
        config: DirectoryConfig,
        decoder: Arc<dyn FrameDecoder>,
        outputs: Arc<dyn OutputProvider>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Vec::new(),
            config,
            decoder,
            outputs,
            results_tx,
            results_rx,
            events,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Subscribe to attach/detach notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_device()).count()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.sessions.iter().any(|s| s.id() == id)
    }

    /// Sessions in directory order: managers, then devices by attach time
    pub fn iter(&self) -> std::slice::Iter<'_, Session> {
        self.sessions.iter()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    /// The most recently opened session
    pub fn newest(&self) -> Option<&Session> {
        self.sessions.last()
    }

    pub fn newest_mut(&mut self) -> Option<&mut Session> {
        self.sessions.last_mut()
    }

    fn resources(&self) -> DeviceResources {
        DeviceResources {
            decoder: self.decoder.clone(),
            outputs: self.outputs.clone(),
            results: self.results_tx.clone(),
            live_view: self.config.live_view.clone(),
        }
    }

    /// Open the session for the SDK manager object
    pub fn open_manager(&mut self, backend: Arc<dyn CapabilityBackend>) -> bool {
        let id = backend.object_id();
        if self.contains(&id) {
            warn!(object = %id, "Manager session already open");
            return false;
        }

        let session = Session::open_manager(backend);
        let at = self.sessions.iter().take_while(|s| !s.is_device()).count();
        self.sessions.insert(at, session);
        info!(object = %id, "Manager session opened");
        true
    }

    /// Open a session for a newly attached device
    ///
    /// A second attach for an identity that already has a session is ignored.
    pub fn attach(&mut self, device: Arc<dyn DeviceBackend>) -> bool {
        let id = device.object_id();
        if self.contains(&id) {
            warn!(device = %id, "Duplicate attach ignored");
            return false;
        }

        let session = Session::open_device(device, &self.resources());
        let name = session.name().to_string();
        self.sessions.push(session);
        info!(device = %id, name = %name, sessions = self.sessions.len(), "Device attached");

        let _ = self.events.send(DirectoryEvent::Attached { id, name });
        true
    }

    /// Tear down and remove a device's session
    pub fn detach(&mut self, id: &ObjectId) -> bool {
        let Some(pos) = self
            .sessions
            .iter()
            .position(|s| s.is_device() && s.id() == id)
        else {
            warn!(device = %id, "Detach for unknown device ignored");
            return false;
        };

        let mut session = self.sessions.remove(pos);
        session.teardown(InterruptReason::Detached);
        drop(session);
        info!(device = %id, sessions = self.sessions.len(), "Device detached");

        let _ = self.events.send(DirectoryEvent::Detached { id: id.clone() });
        true
    }

    /// Route one SDK notification
    pub fn handle(&mut self, event: SdkEvent) {
        match event {
            SdkEvent::Attached { device } => {
                self.attach(device);
            }
            SdkEvent::Detached { id } => {
                self.detach(&id);
            }
            other => {
                let id = other.object_id();
                match self.get_mut(&id) {
                    Some(session) => session.handle(other),
                    None => warn!(object = %id, event = ?other, "Event for unknown object ignored"),
                }
            }
        }
    }

    /// Tick every running live-view loop once
    ///
    /// Returns how many decodes were dispatched.
    pub fn tick_live_views(&mut self) -> usize {
        self.sessions
            .iter_mut()
            .filter_map(|s| s.tick_live_view())
            .filter(|outcome| matches!(outcome, TickOutcome::Dispatched { .. }))
            .count()
    }

    /// Route a decode result to its session
    pub fn apply_decoded(&mut self, outcome: DecodeOutcome) {
        match self.get_mut(&outcome.device) {
            Some(session) => {
                session.apply_decoded(outcome);
            }
            None => debug!(device = %outcome.device, "Decode result for a closed session dropped"),
        }
    }

    /// Apply everything already queued without waiting
    ///
    /// Returns the number of SDK events and decode results applied.
    pub fn pump_pending(&mut self, events: &mut mpsc::UnboundedReceiver<SdkEvent>) -> usize {
        let mut applied = 0;
        while let Ok(event) = events.try_recv() {
            self.handle(event);
            applied += 1;
        }
        while let Ok(outcome) = self.results_rx.try_recv() {
            self.apply_decoded(outcome);
            applied += 1;
        }
        applied
    }

    /// Run the event pump until `done` holds or the SDK event stream closes
    pub async fn run_until<F>(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SdkEvent>,
        mut done: F,
    ) -> RunExit
    where
        F: FnMut(&Self) -> bool,
    {
        let mut ticker = tokio::time::interval(self.config.live_view.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if done(self) {
                return RunExit::Done;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        info!("SDK event stream closed");
                        return RunExit::EventsClosed;
                    }
                },
                Some(outcome) = self.results_rx.recv() => self.apply_decoded(outcome),
                _ = ticker.tick() => {
                    self.tick_live_views();
                }
            }
        }
    }

    /// Run the event pump for a fixed time
    pub async fn run_for(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SdkEvent>,
        duration: std::time::Duration,
    ) -> RunExit {
        tokio::time::timeout(duration, self.run_until(events, |_| false))
            .await
            .unwrap_or(RunExit::Done)
    }

    /// Tear down every session: live views stop and open recordings close
    /// before any SDK handle is released
    ///
    /// Device sessions go first, in reverse attach order; manager sessions last.
    pub fn shutdown(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        info!(sessions = self.sessions.len(), "Shutting down session directory");
        while let Some(mut session) = self.sessions.pop() {
            session.teardown(InterruptReason::Shutdown);
        }
    }
}

impl Drop for SessionDirectory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
