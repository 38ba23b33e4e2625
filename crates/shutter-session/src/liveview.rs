//! Live-view acquisition loop
//!
//! Each tick pulls one raw frame from the device and hands it to a blocking
//! decode worker. Decode results come back over a channel owned by the
//! session directory and are applied on the owning context, where only the
//! newest frame of the current run is ever published.

use shutter_core::{
    DecodeError, DecodedImage, DeviceBackend, FrameDecoder, FrameError, LiveFrame, ObjectId,
    RawFrame,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Span};

/// Live-view loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveViewConfig {
    /// Time between frame requests
    pub interval: Duration,
    /// Consecutive fetch failures tolerated before the loop stops
    pub transient_retries: u32,
}

impl Default for LiveViewConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            transient_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveViewState {
    Stopped,
    Running,
}

/// Why a running loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveViewStop {
    /// Stopped by the owner
    Requested,
    /// The device has no more frames
    StreamEnded,
    /// Too many consecutive fetch failures
    FetchFailed(String),
    DecodeFailed(String),
    /// The device went away
    Detached,
}

impl fmt::Display for LiveViewStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stopped"),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::FetchFailed(e) => write!(f, "frame fetch failed: {}", e),
            Self::DecodeFailed(e) => write!(f, "frame decode failed: {}", e),
            Self::Detached => write!(f, "device detached"),
        }
    }
}

/// Result of one decode, marshalled back to the owning context
#[derive(Debug)]
pub struct DecodeOutcome {
    pub device: ObjectId,
    /// Run the frame was requested in
    pub epoch: u64,
    pub sequence: u64,
    pub result: Result<DecodedImage, DecodeError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The loop is not running
    Idle,
    /// A frame was fetched and its decode dispatched
    Dispatched { sequence: u64 },
    /// A fetch failed but the loop keeps going
    Retrying { failures: u32, error: String },
    Stopped(LiveViewStop),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { sequence: u64 },
    /// A newer frame was already published
    Stale,
    /// The result belongs to a run that has since stopped
    Discarded,
    Stopped(LiveViewStop),
}

/// Live-view loop for one device
pub struct LiveView {
    device: ObjectId,
    config: LiveViewConfig,
    state: LiveViewState,
    /// Bumped on every start and stop; results from older epochs are dropped
    epoch: u64,
    next_sequence: u64,
    failures: u32,
    decoder: Arc<dyn FrameDecoder>,
    results: mpsc::UnboundedSender<DecodeOutcome>,
    current: watch::Sender<Option<Arc<LiveFrame>>>,
    span: Span,
}

impl LiveView {
    pub fn new(
        device: ObjectId,
        config: LiveViewConfig,
        decoder: Arc<dyn FrameDecoder>,
        results: mpsc::UnboundedSender<DecodeOutcome>,
        span: Span,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            device,
            config,
            state: LiveViewState::Stopped,
            epoch: 0,
            next_sequence: 0,
            failures: 0,
            decoder,
            results,
            current,
            span,
        }
    }

    pub fn state(&self) -> LiveViewState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LiveViewState::Running
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn config(&self) -> &LiveViewConfig {
        &self.config
    }

    /// Begin a new run. Returns false if already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.state = LiveViewState::Running;
        self.epoch += 1;
        self.failures = 0;
        info!(parent: &self.span, epoch = self.epoch, "Live view started");
        true
    }

    /// End the current run and clear the published frame
    ///
    /// Idempotent: returns false if the loop was not running. Decodes still in
    /// flight finish on their worker but are never published.
    pub fn stop(&mut self) -> bool {
        self.halt(LiveViewStop::Requested)
    }

    fn halt(&mut self, reason: LiveViewStop) -> bool {
        if !self.is_running() {
            return false;
        }
        self.state = LiveViewState::Stopped;
        self.epoch += 1;
        self.current.send_replace(None);
        match &reason {
            LiveViewStop::Requested | LiveViewStop::Detached => {
                info!(parent: &self.span, reason = %reason, "Live view stopped")
            }
            _ => warn!(parent: &self.span, reason = %reason, "Live view stopped"),
        }
        true
    }

    /// Stop with an explicit reason, e.g. on detach
    pub fn abort(&mut self, reason: LiveViewStop) -> bool {
        self.halt(reason)
    }

    /// Fetch one frame and dispatch its decode
    pub fn tick<D>(&mut self, device: &D) -> TickOutcome
    where
        D: DeviceBackend + ?Sized,
    {
        if !self.is_running() {
            return TickOutcome::Idle;
        }

        match device.request_live_frame() {
            Ok(raw) => {
                self.failures = 0;
                let sequence = self.dispatch(raw);
                TickOutcome::Dispatched { sequence }
            }
            Err(FrameError::StreamEnded) => {
                self.halt(LiveViewStop::StreamEnded);
                TickOutcome::Stopped(LiveViewStop::StreamEnded)
            }
            Err(FrameError::Transport(e)) => {
                self.failures += 1;
                if self.failures > self.config.transient_retries {
                    let reason = LiveViewStop::FetchFailed(e.to_string());
                    self.halt(reason.clone());
                    TickOutcome::Stopped(reason)
                } else {
                    debug!(
                        parent: &self.span,
                        failures = self.failures,
                        error = %e,
                        "Live view fetch failed, retrying"
                    );
                    TickOutcome::Retrying {
                        failures: self.failures,
                        error: e.to_string(),
                    }
                }
            }
        }
    }

    /// Hand a raw frame to a blocking decode worker
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn dispatch(&mut self, raw: RawFrame) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let epoch = self.epoch;
        let device = self.device.clone();
        let decoder = self.decoder.clone();
        let results = self.results.clone();

        tokio::task::spawn_blocking(move || {
            let result = decoder.decode(&raw);
            // Nobody left to publish to once the directory is gone
            let _ = results.send(DecodeOutcome {
                device,
                epoch,
                sequence,
                result,
            });
        });

        sequence
    }

    /// Apply a decode result on the owning context
    pub fn publish(&mut self, outcome: DecodeOutcome) -> PublishOutcome {
        if !self.is_running() || outcome.epoch != self.epoch {
            debug!(
                parent: &self.span,
                sequence = outcome.sequence,
                "Dropping decode result from a finished run"
            );
            return PublishOutcome::Discarded;
        }

        let superseded = self
            .current
            .borrow()
            .as_ref()
            .is_some_and(|current| outcome.sequence <= current.sequence);

        let image = match outcome.result {
            Ok(image) => image,
            Err(e) if superseded => {
                debug!(
                    parent: &self.span,
                    sequence = outcome.sequence,
                    error = %e,
                    "Decode failure for a superseded frame ignored"
                );
                return PublishOutcome::Stale;
            }
            Err(e) => {
                let reason = LiveViewStop::DecodeFailed(e.to_string());
                self.halt(reason.clone());
                return PublishOutcome::Stopped(reason);
            }
        };

        let sequence = outcome.sequence;
        let frame = Arc::new(LiveFrame::from_decoded(image, sequence));
        let published = self.current.send_if_modified(move |slot| {
            let newer = slot.as_ref().map_or(true, |current| sequence > current.sequence);
            if newer {
                *slot = Some(frame);
            }
            newer
        });

        if published {
            PublishOutcome::Published { sequence }
        } else {
            debug!(parent: &self.span, sequence, "Decoded frame superseded by a newer one");
            PublishOutcome::Stale
        }
    }

    /// The newest published frame of the current run
    pub fn current(&self) -> Option<Arc<LiveFrame>> {
        self.current.borrow().clone()
    }

    /// Observe published frames
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<LiveFrame>>> {
        self.current.subscribe()
    }
}
