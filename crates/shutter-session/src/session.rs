//! Manager and device sessions
//!
//! A session owns one SDK object's capability registry and, for capturing
//! devices, its live-view loop and video assembler. SDK notifications for the
//! object are applied here, on the owning context, and re-published to
//! observers as [`SessionEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shutter_core::{
    well_known as wk, AssemblerError, CapabilityBackend, CapabilityError, CapabilityId,
    CapabilityRegistry, CapabilitySet, CapabilityType, CapabilityValue, CapturedImage,
    DecodedImage, DeviceBackend, FragmentOutcome, FrameDecoder, FrameError, InterruptReason,
    LiveFrame, ObjectId, OutputProvider, PreviewImage, PreviewResolution, RawFrame, SdkError,
    SdkEvent, VideoAssembler, VideoCompleted, VideoFragment, VideoInterrupted,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, info_span, warn, Span};

use crate::liveview::{
    DecodeOutcome, LiveView, LiveViewConfig, LiveViewState, LiveViewStop, PublishOutcome,
    TickOutcome,
};

/// Buffered session events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("Session {0} is not a capturing device")]
    NotADevice(ObjectId),
    #[error("SDK call failed: {0}")]
    Sdk(#[from] SdkError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Manager,
    Device,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manager => write!(f, "manager"),
            Self::Device => write!(f, "device"),
        }
    }
}

/// Optional per-capture image streams a device session can relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageDelivery {
    Preview,
    LowResPreview,
    Thumbnail,
}

impl ImageDelivery {
    fn for_preview(resolution: PreviewResolution) -> Self {
        match resolution {
            PreviewResolution::Normal => Self::Preview,
            PreviewResolution::Low => Self::LowResPreview,
        }
    }
}

/// Relayed image streams; all off until an observer asks for them
#[derive(Debug, Clone, Copy, Default)]
struct Deliveries {
    preview: bool,
    low_res_preview: bool,
    thumbnail: bool,
}

impl Deliveries {
    fn slot(&mut self, kind: ImageDelivery) -> &mut bool {
        match kind {
            ImageDelivery::Preview => &mut self.preview,
            ImageDelivery::LowResPreview => &mut self.low_res_preview,
            ImageDelivery::Thumbnail => &mut self.thumbnail,
        }
    }

    fn get(&self, kind: ImageDelivery) -> bool {
        match kind {
            ImageDelivery::Preview => self.preview,
            ImageDelivery::LowResPreview => self.low_res_preview,
            ImageDelivery::Thumbnail => self.thumbnail,
        }
    }
}

/// Notification published to a session's observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The capability set was re-enumerated
    CapabilitiesRebuilt { generation: u64, count: usize },
    /// One capability's value was refreshed from the device
    CapabilityChanged { id: CapabilityId },
    CaptureComplete { data: i32 },
    ImageReady(Arc<CapturedImage>),
    /// Only while the matching [`ImageDelivery`] is on
    PreviewReady(Arc<PreviewImage>),
    ThumbnailReady(Arc<DecodedImage>),
    LiveViewStarted,
    LiveViewStopped { reason: LiveViewStop },
    RecordingStarted { path: PathBuf },
    RecordingProgress { percent: f32, bytes_written: u64 },
    RecordingCompleted(VideoCompleted),
    /// `partial` is `None` when no output was open
    RecordingInterrupted {
        reason: InterruptReason,
        partial: Option<VideoInterrupted>,
    },
    /// A recoverable failure, already logged
    Warning { message: String },
    /// The session was torn down; no further events follow
    Closed,
}

/// What a device session needs from the directory
pub struct DeviceResources {
    pub decoder: Arc<dyn FrameDecoder>,
    pub outputs: Arc<dyn OutputProvider>,
    pub results: mpsc::UnboundedSender<DecodeOutcome>,
    pub live_view: LiveViewConfig,
}

struct DeviceParts {
    backend: Arc<dyn DeviceBackend>,
    live_view: LiveView,
    video: VideoAssembler,
    /// Device live-view mode was switched on through this session
    device_live_view: bool,
    deliveries: Deliveries,
}

impl DeviceParts {
    /// Switch the device out of live view if this session put it there
    fn disable_device_live_view(&mut self, span: &Span) {
        if !self.device_live_view {
            return;
        }
        self.device_live_view = false;
        if let Err(e) = self.backend.set_live_view(false) {
            warn!(parent: span, error = %e, "Failed to disable live view");
        }
    }
}

enum Role {
    Manager(Arc<dyn CapabilityBackend>),
    Device(DeviceParts),
}

/// Run `$body` with `$b` bound to the session's backend as a capability backend
macro_rules! with_backend {
    ($session:expr, $b:ident => $body:expr) => {
        match &$session.role {
            Role::Manager(backend) => {
                let $b = backend.as_ref();
                $body
            }
            Role::Device(parts) => {
                let $b = parts.backend.as_ref();
                $body
            }
        }
    };
}

/// Session for one SDK object
pub struct Session {
    id: ObjectId,
    name: String,
    attached_at: DateTime<Utc>,
    registry: CapabilityRegistry,
    role: Role,
    events: broadcast::Sender<SessionEvent>,
    span: Span,
}

impl Session {
    /// Open a session for the SDK manager object
    pub fn open_manager(backend: Arc<dyn CapabilityBackend>) -> Self {
        let id = backend.object_id();
        let name = backend.name();
        let span = info_span!("session", id = %id, name = %name, kind = "manager");
        let mut session = Self::with_role(id, name, span, Role::Manager(backend));
        session.initial_rebuild();
        session
    }

    /// Open a session for an attached capturing device
    pub fn open_device(backend: Arc<dyn DeviceBackend>, resources: &DeviceResources) -> Self {
        let id = backend.object_id();
        let name = backend.name();
        let span = info_span!("session", id = %id, name = %name, kind = "device");
        let live_view = LiveView::new(
            id.clone(),
            resources.live_view.clone(),
            resources.decoder.clone(),
            resources.results.clone(),
            span.clone(),
        );
        let parts = DeviceParts {
            backend,
            live_view,
            video: VideoAssembler::new(resources.outputs.clone()),
            device_live_view: false,
            deliveries: Deliveries::default(),
        };
        let mut session = Self::with_role(id, name, span, Role::Device(parts));
        session.initial_rebuild();
        session
    }

    fn with_role(id: ObjectId, name: String, span: Span, role: Role) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            name,
            attached_at: Utc::now(),
            registry: CapabilityRegistry::new(),
            role,
            events,
            span,
        }
    }

    fn initial_rebuild(&mut self) {
        // Failure is already reported; the session stays open with an empty registry
        let _ = self.refresh_capabilities();
        info!(parent: &self.span, capabilities = self.registry.len(), "Session opened");
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SessionKind {
        match self.role {
            Role::Manager(_) => SessionKind::Manager,
            Role::Device(_) => SessionKind::Device,
        }
    }

    pub fn is_device(&self) -> bool {
        self.kind() == SessionKind::Device
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    /// Read-only view of the registry
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> Arc<CapabilitySet> {
        self.registry.snapshot()
    }

    pub fn supports(&self, id: CapabilityId) -> bool {
        self.registry.contains(id)
    }

    pub fn supports_capture(&self) -> bool {
        self.supports(wk::CAPTURE)
    }

    pub fn supports_preview(&self) -> bool {
        self.supports(wk::PREVIEW_IMAGE)
    }

    pub fn supports_low_res_preview(&self) -> bool {
        self.supports(wk::PREVIEW_IMAGE_LOW)
    }

    pub fn supports_live_view(&self) -> bool {
        self.is_device() && self.supports(wk::LIVE_VIEW_ENABLED)
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Change notifications for a single capability
    pub fn watch_capability(&self, id: CapabilityId) -> CapabilityWatch {
        CapabilityWatch {
            id,
            events: self.events.subscribe(),
        }
    }

    /// Turn relaying of an optional image stream on or off
    pub fn set_delivery(&mut self, kind: ImageDelivery, enabled: bool) -> Result<(), SessionError> {
        *self.device_mut()?.deliveries.slot(kind) = enabled;
        debug!(parent: &self.span, kind = ?kind, enabled, "Image delivery switched");
        Ok(())
    }

    /// Whether an optional image stream is relayed; always false for managers
    pub fn delivers(&self, kind: ImageDelivery) -> bool {
        match &self.role {
            Role::Device(parts) => parts.deliveries.get(kind),
            Role::Manager(_) => false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, message: String) {
        warn!(parent: &self.span, "{}", message);
        self.emit(SessionEvent::Warning { message });
    }

    fn fail(&self, error: CapabilityError) -> SessionError {
        self.report(error.to_string());
        error.into()
    }

    // ------------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------------

    /// Re-enumerate capabilities and rebuild the registry
    ///
    /// On failure the previous registry is kept.
    pub fn refresh_capabilities(&mut self) -> Result<u64, SessionError> {
        let infos = with_backend!(self, b => b.capabilities());
        match infos {
            Ok(infos) => {
                let generation = self.registry.rebuild(infos);
                let count = self.registry.len();
                debug!(parent: &self.span, generation, count, "Capabilities rebuilt");
                self.emit(SessionEvent::CapabilitiesRebuilt { generation, count });
                Ok(generation)
            }
            Err(e) => {
                self.report(format!("Failed to enumerate capabilities: {}", e));
                Err(e.into())
            }
        }
    }

    pub fn read(&mut self, id: CapabilityId) -> Result<CapabilityValue, SessionError> {
        let result = with_backend!(self, b => self.registry.read(b, id));
        result.map_err(|e| self.fail(e))
    }

    pub fn write(&mut self, id: CapabilityId, value: CapabilityValue) -> Result<(), SessionError> {
        let result = with_backend!(self, b => self.registry.write(b, id, value));
        result.map_err(|e| self.fail(e))
    }

    pub fn start(&mut self, id: CapabilityId) -> Result<(), SessionError> {
        let result = with_backend!(self, b => self.registry.start(b, id));
        result.map_err(|e| self.fail(e))?;
        debug!(parent: &self.span, capability = %id, "Action started");
        Ok(())
    }

    /// Select an enum item by index, keeping the device's item list
    pub fn set_enum_index(&mut self, id: CapabilityId, index: usize) -> Result<(), SessionError> {
        let current = self.read(id)?;
        let Some(items) = current.as_enum() else {
            return Err(self.fail(CapabilityError::TypeMismatch {
                id,
                expected: CapabilityType::Enum,
                actual: current.kind(),
            }));
        };
        let Some(next) = items.with_index(index) else {
            return Err(self.fail(CapabilityError::InvalidValue {
                id,
                reason: format!("index {} out of {} items", index, items.len()),
            }));
        };
        self.write(id, CapabilityValue::Enum(next))
    }

    /// Select an enum item by its display text
    pub fn select_enum_item(&mut self, id: CapabilityId, item: &str) -> Result<(), SessionError> {
        let current = self.read(id)?;
        let index = current
            .as_enum()
            .and_then(|e| e.items.iter().position(|i| i == item));
        match index {
            Some(index) => self.set_enum_index(id, index),
            None => Err(self.fail(CapabilityError::InvalidValue {
                id,
                reason: format!("no item named {:?}", item),
            })),
        }
    }

    /// Move a range capability to `value`, keeping its bounds
    pub fn set_range_value(&mut self, id: CapabilityId, value: f64) -> Result<(), SessionError> {
        let current = self.read(id)?;
        let Some(range) = current.as_range() else {
            return Err(self.fail(CapabilityError::TypeMismatch {
                id,
                expected: CapabilityType::Range,
                actual: current.kind(),
            }));
        };
        self.write(id, CapabilityValue::Range(range.with_value(value)))
    }

    // ------------------------------------------------------------------------
    // SDK notifications
    // ------------------------------------------------------------------------

    /// Apply one SDK notification addressed to this session's object
    pub fn handle(&mut self, event: SdkEvent) {
        match event {
            SdkEvent::Attached { .. } | SdkEvent::Detached { .. } => {
                debug!(parent: &self.span, event = ?event, "Directory-level event ignored by session");
            }
            SdkEvent::CapabilitySetChanged { .. } => {
                let _ = self.refresh_capabilities();
            }
            SdkEvent::CapabilityValueChanged { capability, .. } => {
                self.on_value_changed(capability);
            }
            SdkEvent::CaptureComplete { data, .. } => {
                info!(parent: &self.span, data, "Capture complete");
                self.emit(SessionEvent::CaptureComplete { data });
            }
            SdkEvent::ImageReady { image, .. } => {
                debug!(parent: &self.span, kind = ?image.kind, bytes = image.data.len(), "Image ready");
                self.emit(SessionEvent::ImageReady(Arc::new(image)));
            }
            SdkEvent::PreviewReady { preview, .. } => {
                let kind = ImageDelivery::for_preview(preview.resolution);
                if self.delivers(kind) {
                    self.emit(SessionEvent::PreviewReady(Arc::new(preview)));
                } else {
                    debug!(parent: &self.span, kind = ?kind, "Preview not requested, dropped");
                }
            }
            SdkEvent::ThumbnailReady { thumbnail, .. } => {
                if self.delivers(ImageDelivery::Thumbnail) {
                    self.emit(SessionEvent::ThumbnailReady(Arc::new(thumbnail)));
                } else {
                    debug!(parent: &self.span, "Thumbnail not requested, dropped");
                }
            }
            SdkEvent::VideoFragmentReady { fragment, .. } => {
                self.on_video_fragment(&fragment);
            }
            SdkEvent::VideoInterrupted { code, .. } => {
                self.interrupt_recording(InterruptReason::Sdk(code));
            }
        }
    }

    fn on_value_changed(&mut self, id: CapabilityId) {
        let readable = match self.registry.get(id) {
            Ok(entry) => entry.is_readable(),
            Err(_) => {
                debug!(parent: &self.span, capability = %id, "Value change for unknown capability ignored");
                return;
            }
        };

        // The device is authoritative: re-read instead of trusting the cache
        if readable {
            let refreshed = with_backend!(self, b => self.registry.refresh(b, id));
            if let Err(e) = refreshed {
                self.report(format!("Failed to refresh {}: {}", id, e));
                return;
            }
        }
        debug!(parent: &self.span, capability = %id, "Capability value changed");
        self.emit(SessionEvent::CapabilityChanged { id });
    }

    fn on_video_fragment(&mut self, fragment: &VideoFragment) {
        let Role::Device(parts) = &mut self.role else {
            self.report("Video fragment delivered to a manager session".to_string());
            return;
        };

        match parts.video.push(fragment) {
            Ok(FragmentOutcome::Started {
                path,
                percent,
                bytes_written,
            }) => {
                self.emit(SessionEvent::RecordingStarted { path });
                self.emit(SessionEvent::RecordingProgress {
                    percent,
                    bytes_written,
                });
            }
            Ok(FragmentOutcome::Progress {
                percent,
                bytes_written,
            }) => {
                self.emit(SessionEvent::RecordingProgress {
                    percent,
                    bytes_written,
                });
            }
            Ok(FragmentOutcome::Completed(completed)) => {
                self.emit(SessionEvent::RecordingCompleted(completed));
            }
            Err(e @ AssemblerError::AlreadyRecording { .. }) => {
                self.report(format!("Video protocol violation: {}", e));
                self.interrupt_recording(InterruptReason::ProtocolViolation);
            }
            Err(e @ AssemblerError::Io(_)) => {
                self.report(format!("Video write failed: {}", e));
                self.interrupt_recording(InterruptReason::WriteFailed);
            }
            Err(e) => {
                self.report(format!("Video fragment dropped: {}", e));
            }
        }
    }

    /// Force-close the open recording, if any, and notify observers
    fn interrupt_recording(&mut self, reason: InterruptReason) {
        let partial = match &mut self.role {
            Role::Device(parts) => parts.video.interrupt(reason),
            Role::Manager(_) => None,
        };
        if partial.is_none() {
            debug!(parent: &self.span, reason = %reason, "Interruption with no open recording");
        }
        self.emit(SessionEvent::RecordingInterrupted { reason, partial });
    }

    pub fn is_recording(&self) -> bool {
        match &self.role {
            Role::Device(parts) => parts.video.is_recording(),
            Role::Manager(_) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Live view
    // ------------------------------------------------------------------------

    fn device(&self) -> Result<&DeviceParts, SessionError> {
        match &self.role {
            Role::Device(parts) => Ok(parts),
            Role::Manager(_) => Err(SessionError::NotADevice(self.id.clone())),
        }
    }

    fn device_mut(&mut self) -> Result<&mut DeviceParts, SessionError> {
        match &mut self.role {
            Role::Device(parts) => Ok(parts),
            Role::Manager(_) => Err(SessionError::NotADevice(self.id.clone())),
        }
    }

    /// Switch the device's live-view mode without running the loop
    pub fn set_live_view_enabled(&mut self, enabled: bool) -> Result<(), SessionError> {
        let parts = self.device_mut()?;
        match parts.backend.set_live_view(enabled) {
            Ok(()) => {
                parts.device_live_view = enabled;
                Ok(())
            }
            Err(e) => {
                self.report(format!("Failed to switch live view: {}", e));
                Err(e.into())
            }
        }
    }

    /// Enable live view on the device and start polling frames
    pub fn start_live_view(&mut self) -> Result<(), SessionError> {
        if self.device()?.live_view.is_running() {
            return Ok(());
        }
        self.set_live_view_enabled(true)?;
        if self.device_mut()?.live_view.start() {
            self.emit(SessionEvent::LiveViewStarted);
        }
        Ok(())
    }

    /// Stop polling and disable live view on the device
    ///
    /// The device leaves live view even when the loop had already stopped on
    /// its own. Returns false if the loop was not running.
    pub fn stop_live_view(&mut self) -> bool {
        let Role::Device(parts) = &mut self.role else {
            return false;
        };
        let was_running = parts.live_view.stop();
        parts.disable_device_live_view(&self.span);
        if was_running {
            self.emit(SessionEvent::LiveViewStopped {
                reason: LiveViewStop::Requested,
            });
        }
        was_running
    }

    pub fn live_view_state(&self) -> LiveViewState {
        match &self.role {
            Role::Device(parts) => parts.live_view.state(),
            Role::Manager(_) => LiveViewState::Stopped,
        }
    }

    /// Run one live-view tick; `None` for manager sessions
    pub fn tick_live_view(&mut self) -> Option<TickOutcome> {
        let Role::Device(parts) = &mut self.role else {
            return None;
        };
        let outcome = parts.live_view.tick(parts.backend.as_ref());
        match &outcome {
            TickOutcome::Stopped(reason) => {
                self.report(format!("Live view stopped: {}", reason));
                self.emit(SessionEvent::LiveViewStopped {
                    reason: reason.clone(),
                });
            }
            TickOutcome::Retrying { failures, error } => {
                self.report(format!("Live view frame fetch failed ({}): {}", failures, error));
            }
            TickOutcome::Idle | TickOutcome::Dispatched { .. } => {}
        }
        Some(outcome)
    }

    /// Apply a decode result for this session's loop
    pub fn apply_decoded(&mut self, outcome: DecodeOutcome) -> Option<PublishOutcome> {
        let Role::Device(parts) = &mut self.role else {
            return None;
        };
        let published = parts.live_view.publish(outcome);
        if let PublishOutcome::Stopped(reason) = &published {
            self.report(format!("Live view stopped: {}", reason));
            self.emit(SessionEvent::LiveViewStopped {
                reason: reason.clone(),
            });
        }
        Some(published)
    }

    /// Pull one live frame directly, bypassing the loop
    pub fn fetch_live_frame(&self) -> Result<RawFrame, SessionError> {
        self.device()?.backend.request_live_frame().map_err(|e| {
            self.report(format!("Live frame request failed: {}", e));
            e.into()
        })
    }

    pub fn current_frame(&self) -> Option<Arc<LiveFrame>> {
        match &self.role {
            Role::Device(parts) => parts.live_view.current(),
            Role::Manager(_) => None,
        }
    }

    pub fn subscribe_frames(&self) -> Option<watch::Receiver<Option<Arc<LiveFrame>>>> {
        match &self.role {
            Role::Device(parts) => Some(parts.live_view.subscribe()),
            Role::Manager(_) => None,
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop live view and close any open recording, then emit `Closed`
    ///
    /// On detach the device is already gone, so it is not asked to switch
    /// live view off.
    pub fn teardown(&mut self, reason: InterruptReason) {
        if let Role::Device(parts) = &mut self.role {
            let stop = match reason {
                InterruptReason::Detached => LiveViewStop::Detached,
                _ => LiveViewStop::Requested,
            };
            let was_running = parts.live_view.abort(stop.clone());
            if reason != InterruptReason::Detached {
                parts.disable_device_live_view(&self.span);
            }
            if was_running {
                self.emit(SessionEvent::LiveViewStopped { reason: stop });
            }
        }
        if self.is_recording() {
            self.interrupt_recording(reason);
        }

        info!(parent: &self.span, reason = %reason, "Session closed");
        self.emit(SessionEvent::Closed);
    }
}

/// Filtered change notifications for one capability id
pub struct CapabilityWatch {
    id: CapabilityId,
    events: broadcast::Receiver<SessionEvent>,
}

impl CapabilityWatch {
    pub fn id(&self) -> CapabilityId {
        self.id
    }

    /// Wait for the next change of the watched capability
    ///
    /// Returns false once the session is closed. A lagged receiver reports a
    /// change, since one may have been missed.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.events.recv().await {
                Ok(SessionEvent::CapabilityChanged { id }) if id == self.id => return true,
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return false,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return true,
            }
        }
    }

    /// Non-blocking variant of `changed`: `Some(true)` if a change is queued
    pub fn try_changed(&mut self) -> Option<bool> {
        use tokio::sync::broadcast::error::TryRecvError;
        loop {
            match self.events.try_recv() {
                Ok(SessionEvent::CapabilityChanged { id }) if id == self.id => return Some(true),
                Ok(SessionEvent::Closed) | Err(TryRecvError::Closed) => return Some(false),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => return Some(true),
                Err(TryRecvError::Empty) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCamera, SimConfig, SimFrameDecoder, SimManager};
    use shutter_core::{DirectoryOutput, EnumValue};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        _manager: Arc<SimManager>,
        camera: Arc<SimCamera>,
        session: Session,
        sdk: mpsc::UnboundedReceiver<SdkEvent>,
        _decoded: mpsc::UnboundedReceiver<DecodeOutcome>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let (manager, mut sdk) = SimManager::new("Sim");
            let camera = manager.attach(SimConfig::default());
            let (results, decoded) = mpsc::unbounded_channel();
            let resources = DeviceResources {
                decoder: Arc::new(SimFrameDecoder),
                outputs: Arc::new(DirectoryOutput::new(dir.path())),
                results,
                live_view: LiveViewConfig::default(),
            };
            let session = Session::open_device(camera.clone(), &resources);
            while sdk.try_recv().is_ok() {}
            Self {
                _dir: dir,
                _manager: manager,
                camera,
                session,
                sdk,
                _decoded: decoded,
            }
        }

        /// Deliver queued SDK events to the session
        fn pump(&mut self) {
            while let Ok(event) = self.sdk.try_recv() {
                self.session.handle(event);
            }
        }

        fn fragment(&self, is_first: bool, is_last: bool, payload: &[u8]) -> SdkEvent {
            SdkEvent::VideoFragmentReady {
                id: self.camera.id().clone(),
                fragment: VideoFragment {
                    is_first,
                    is_last,
                    payload: payload.to_vec(),
                    percent_complete: 0.0,
                    filename: "clip.mov".to_string(),
                    width: 0,
                    height: 0,
                },
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_manager_session_has_no_live_view() {
        let (manager, _sdk) = SimManager::new("Sim");
        let mut session = Session::open_manager(manager);

        assert_eq!(session.kind(), SessionKind::Manager);
        assert!(session.supports(wk::MODULE_NAME));
        assert!(!session.supports_live_view());
        assert!(matches!(
            session.start_live_view(),
            Err(SessionError::NotADevice(_))
        ));
        assert!(session.tick_live_view().is_none());
        assert!(!session.stop_live_view());
        assert_eq!(
            session.read(wk::MODULE_NAME).unwrap(),
            CapabilityValue::String("Sim".to_string())
        );
    }

    #[test]
    fn test_device_session_builds_registry_on_open() {
        let fx = Fixture::new();
        assert_eq!(fx.session.kind(), SessionKind::Device);
        assert_eq!(fx.session.registry().generation(), 1);
        assert!(fx.session.supports_capture());
        assert!(fx.session.supports_preview());
        assert!(fx.session.supports_live_view());
        assert!(!fx.session.supports(wk::MF_DRIVE));
    }

    #[test]
    fn test_value_change_overwrites_written_value() {
        let mut fx = Fixture::new();
        let mut watch = fx.session.watch_capability(wk::ISO);

        fx.session.set_enum_index(wk::ISO, 2).unwrap();
        let cached = fx.session.read(wk::ISO).unwrap();
        assert_eq!(cached.as_enum().unwrap().index, 2);

        let items = cached.as_enum().unwrap().items.clone();
        fx.camera
            .change_value(wk::ISO, CapabilityValue::Enum(EnumValue::new(1, items)));
        fx.pump();

        assert_eq!(watch.try_changed(), Some(true));
        assert_eq!(fx.session.read(wk::ISO).unwrap().as_enum().unwrap().index, 1);
    }

    #[test]
    fn test_watch_ignores_other_capabilities() {
        let mut fx = Fixture::new();
        let mut watch = fx.session.watch_capability(wk::ISO);

        fx.camera
            .change_value(wk::BATTERY_LEVEL, CapabilityValue::Integer(40));
        fx.pump();

        assert_eq!(watch.try_changed(), None);
        assert_eq!(
            fx.session.read(wk::BATTERY_LEVEL).unwrap(),
            CapabilityValue::Integer(40)
        );
    }

    #[test]
    fn test_failed_write_reports_warning() {
        let mut fx = Fixture::new();
        let mut rx = fx.session.subscribe();

        let err = fx
            .session
            .write(wk::NAME, CapabilityValue::String("x".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capability(CapabilityError::NotWritable(_))
        ));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [SessionEvent::Warning { .. }]
        ));
    }

    #[test]
    fn test_enum_helpers() {
        let mut fx = Fixture::new();
        fx.session
            .select_enum_item(wk::SHOOTING_MODE, "Continuous H")
            .unwrap();
        assert_eq!(
            fx.session
                .read(wk::SHOOTING_MODE)
                .unwrap()
                .as_enum()
                .unwrap()
                .selected(),
            Some("Continuous H")
        );

        assert!(matches!(
            fx.session.set_enum_index(wk::SHOOTING_MODE, 99),
            Err(SessionError::Capability(CapabilityError::InvalidValue { .. }))
        ));
        assert!(matches!(
            fx.session.set_enum_index(wk::BEEP, 0),
            Err(SessionError::Capability(CapabilityError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_previews_and_thumbnails_follow_delivery_switches() {
        let mut fx = Fixture::new();
        assert!(fx.session.supports_low_res_preview());
        let mut rx = fx.session.subscribe();

        fx.session.start(wk::CAPTURE).unwrap();
        fx.pump();
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            SessionEvent::PreviewReady(_) | SessionEvent::ThumbnailReady(_)
        )));

        fx.session.set_delivery(ImageDelivery::LowResPreview, true).unwrap();
        fx.session.set_delivery(ImageDelivery::Thumbnail, true).unwrap();
        assert!(fx.session.delivers(ImageDelivery::LowResPreview));
        assert!(!fx.session.delivers(ImageDelivery::Preview));

        fx.session.start(wk::CAPTURE).unwrap();
        fx.pump();
        let events = drain(&mut rx);
        let previews: Vec<PreviewResolution> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::PreviewReady(p) => Some(p.resolution),
                _ => None,
            })
            .collect();
        assert_eq!(previews, vec![PreviewResolution::Low]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::ThumbnailReady(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_manager_has_no_image_deliveries() {
        let (manager, _sdk) = SimManager::new("Sim");
        let mut session = Session::open_manager(manager);
        assert!(matches!(
            session.set_delivery(ImageDelivery::Preview, true),
            Err(SessionError::NotADevice(_))
        ));
        assert!(!session.delivers(ImageDelivery::Preview));
    }

    #[test]
    fn test_capability_set_change_rebuilds() {
        let mut fx = Fixture::new();
        let mut rx = fx.session.subscribe();

        fx.session.set_live_view_enabled(true).unwrap();
        fx.pump();

        assert!(fx.session.supports(wk::MF_DRIVE));
        assert_eq!(fx.session.registry().generation(), 2);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::CapabilitiesRebuilt { generation: 2, .. })));
    }

    #[test]
    fn test_range_helper_respects_bounds() {
        let mut fx = Fixture::new();
        fx.session.set_live_view_enabled(true).unwrap();
        fx.pump();

        fx.session.set_range_value(wk::MF_DRIVE_STEP, 1000.0).unwrap();
        assert_eq!(
            fx.session
                .read(wk::MF_DRIVE_STEP)
                .unwrap()
                .as_range()
                .unwrap()
                .value,
            1000.0
        );
        assert!(matches!(
            fx.session.set_range_value(wk::MF_DRIVE_STEP, 1e9),
            Err(SessionError::Capability(CapabilityError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_second_first_fragment_interrupts_recording() {
        let mut fx = Fixture::new();
        let mut rx = fx.session.subscribe();

        let first = fx.fragment(true, false, b"abc");
        fx.session.handle(first);
        assert!(fx.session.is_recording());

        let again = fx.fragment(true, false, b"def");
        fx.session.handle(again);
        assert!(!fx.session.is_recording());

        let interrupted = drain(&mut rx).into_iter().find_map(|e| match e {
            SessionEvent::RecordingInterrupted { reason, partial } => Some((reason, partial)),
            _ => None,
        });
        let (reason, partial) = interrupted.unwrap();
        assert_eq!(reason, InterruptReason::ProtocolViolation);
        let partial = partial.unwrap();
        assert_eq!(partial.bytes_written, 3);
        assert_eq!(std::fs::read(&partial.path).unwrap(), b"abc");
    }

    #[test]
    fn test_stray_fragment_only_warns() {
        let mut fx = Fixture::new();
        let mut rx = fx.session.subscribe();

        let stray = fx.fragment(false, true, b"xyz");
        fx.session.handle(stray);

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [SessionEvent::Warning { .. }]
        ));
    }

    #[test]
    fn test_sdk_interrupt_closes_recording() {
        let mut fx = Fixture::new();
        let mut rx = fx.session.subscribe();

        let first = fx.fragment(true, false, b"12345");
        fx.session.handle(first);
        fx.session.handle(SdkEvent::VideoInterrupted {
            id: fx.camera.id().clone(),
            code: -7,
        });

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::RecordingInterrupted {
                reason: InterruptReason::Sdk(-7),
                partial: Some(VideoInterrupted { bytes_written: 5, .. })
            }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::RecordingCompleted(_))));
    }

    #[tokio::test]
    async fn test_stop_after_loop_ended_still_disables_device() {
        let mut fx = Fixture::new();
        fx.session.start_live_view().unwrap();
        fx.camera.end_live_stream();

        let outcome = fx.session.tick_live_view().unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Stopped(LiveViewStop::StreamEnded)
        ));
        assert_eq!(fx.session.live_view_state(), LiveViewState::Stopped);
        assert!(fx.camera.live_view_enabled());

        assert!(!fx.session.stop_live_view());
        assert!(!fx.camera.live_view_enabled());
    }

    #[tokio::test]
    async fn test_shutdown_teardown_disables_device_live_view() {
        let mut fx = Fixture::new();
        fx.session.set_live_view_enabled(true).unwrap();
        assert_eq!(fx.session.live_view_state(), LiveViewState::Stopped);

        fx.session.teardown(InterruptReason::Shutdown);
        assert!(!fx.camera.live_view_enabled());
    }

    #[tokio::test]
    async fn test_teardown_emits_closed_and_stops_live_view() {
        let mut fx = Fixture::new();
        fx.session.start_live_view().unwrap();
        let mut watch = fx.session.watch_capability(wk::ISO);
        let mut rx = fx.session.subscribe();

        fx.session.teardown(InterruptReason::Detached);
        assert_eq!(fx.session.live_view_state(), LiveViewState::Stopped);
        // Detached devices are not told to leave live view
        assert!(fx.camera.live_view_enabled());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::LiveViewStopped {
                    reason: LiveViewStop::Detached
                },
                SessionEvent::Closed
            ]
        ));
        assert!(!watch.changed().await);
    }
}
