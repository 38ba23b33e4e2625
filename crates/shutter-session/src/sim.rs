//! Simulated SDK collaborator
//!
//! A manager object and attachable cameras that behave like the vendor SDK
//! closely enough to drive sessions end to end: typed capabilities, live-view
//! frames with a status header, stills, manual-focus drives and fragmented
//! video downloads. Events are delivered over an unbounded channel, the way
//! the SDK's callback thread would deliver them.

use serde::{Deserialize, Serialize};
use shutter_core::{
    well_known as wk, CapabilityBackend, CapabilityFlags, CapabilityId, CapabilityInfo,
    CapabilityType, CapabilityValue, CapturedImage, DecodeError, DecodedImage, DeviceBackend,
    EnumValue, FrameDecoder, FrameError, ImageKind, ObjectId, PreviewImage, PreviewResolution,
    RangeValue, RawFrame, SdkError,
    SdkEvent, VideoFragment,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result codes returned by simulated SDK failures
pub const ERR_TYPE_MISMATCH: i32 = -120;
pub const ERR_OUT_OF_RANGE: i32 = -121;
pub const ERR_INVALID_PARAMETER: i32 = -122;
pub const ERR_LIVE_VIEW_REQUIRED: i32 = -210;
pub const ERR_NOT_RECORDING: i32 = -211;

/// Items of the shooting-mode enum, in SDK order
pub const SHOOTING_MODES: [&str; 6] = [
    "Single",
    "Continuous L",
    "Continuous H",
    "Quiet",
    "Self-timer",
    "Mirror up",
];

const QUALITY_LEVELS: [&str; 4] = ["JPEG Basic", "JPEG Normal", "JPEG Fine", "RAW"];
const ISO_VALUES: [&str; 7] = ["100", "200", "400", "800", "1600", "3200", "6400"];

const FRAME_MAGIC: &[u8; 4] = b"SIMF";
const FRAME_PREFIX: usize = 12;
const HEADER_LEN: usize = 64;

/// Lens positions run from 0 (closest) to LENS_TRAVEL (infinity)
const LENS_TRAVEL: u32 = 0xFFFF;
const MF_MAX_STEP: f64 = 32767.0;
/// Drive distance covered per live-view frame
const DRIVE_UNITS_PER_FRAME: u32 = 4096;

const VIDEO_WIDTH: u32 = 1920;
const VIDEO_HEIGHT: u32 = 1080;

/// Simulated camera settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub name: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Fragments per recorded clip
    pub video_fragments: usize,
    /// Payload bytes per fragment
    pub fragment_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "Simulated D-SLR".to_string(),
            frame_width: 64,
            frame_height: 48,
            video_fragments: 8,
            fragment_size: 4096,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cap(id: CapabilityId, kind: CapabilityType, bits: u32, description: &str) -> CapabilityInfo {
    CapabilityInfo::new(id.as_u32(), kind, CapabilityFlags::from_bits(bits), description)
}

fn lookup(table: &[CapabilityInfo], id: CapabilityId) -> Result<&CapabilityInfo, SdkError> {
    table
        .iter()
        .find(|info| info.id == id)
        .ok_or(SdkError::NotSupported(id))
}

fn load_value(
    table: &[CapabilityInfo],
    values: &HashMap<CapabilityId, CapabilityValue>,
    id: CapabilityId,
) -> Result<CapabilityValue, SdkError> {
    let info = lookup(table, id)?;
    if !info.flags.readable {
        return Err(SdkError::NotSupported(id));
    }
    values.get(&id).cloned().ok_or(SdkError::NotSupported(id))
}

/// Check a write the way the SDK would and normalize it against the current value
fn check_write(
    table: &[CapabilityInfo],
    values: &HashMap<CapabilityId, CapabilityValue>,
    id: CapabilityId,
    value: CapabilityValue,
) -> Result<CapabilityValue, SdkError> {
    let info = lookup(table, id)?;
    if !info.flags.writable {
        return Err(SdkError::NotSupported(id));
    }
    if value.kind() != info.kind {
        return Err(SdkError::Failed(ERR_TYPE_MISMATCH));
    }

    // Only the index of an enum and the value of a range are taken from the caller
    match (value, values.get(&id)) {
        (CapabilityValue::Enum(new), Some(CapabilityValue::Enum(current))) => current
            .with_index(new.index)
            .map(CapabilityValue::Enum)
            .ok_or(SdkError::Failed(ERR_OUT_OF_RANGE)),
        (CapabilityValue::Range(new), Some(CapabilityValue::Range(current))) => {
            if current.contains(new.value) {
                Ok(CapabilityValue::Range(current.with_value(new.value)))
            } else {
                Err(SdkError::Failed(ERR_OUT_OF_RANGE))
            }
        }
        (value, _) => Ok(value),
    }
}

/// Implements the typed accessors on top of `enumerate`, `load`, `store` and `trigger`
macro_rules! sim_capability_backend {
    ($ty:ty) => {
        impl CapabilityBackend for $ty {
            fn object_id(&self) -> ObjectId {
                self.id.clone()
            }

            fn name(&self) -> String {
                self.display_name()
            }

            fn capabilities(&self) -> Result<Vec<CapabilityInfo>, SdkError> {
                self.enumerate()
            }

            fn get_unsigned(&self, id: CapabilityId) -> Result<u32, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Unsigned(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_integer(&self, id: CapabilityId) -> Result<i32, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Integer(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_float(&self, id: CapabilityId) -> Result<f64, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Float(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_string(&self, id: CapabilityId) -> Result<String, SdkError> {
                match self.load(id)? {
                    CapabilityValue::String(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_boolean(&self, id: CapabilityId) -> Result<bool, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Boolean(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_enum(&self, id: CapabilityId) -> Result<EnumValue, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Enum(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_range(&self, id: CapabilityId) -> Result<RangeValue, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Range(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn get_generic(&self, id: CapabilityId) -> Result<Vec<u8>, SdkError> {
                match self.load(id)? {
                    CapabilityValue::Generic(v) => Ok(v),
                    _ => Err(SdkError::Failed(ERR_TYPE_MISMATCH)),
                }
            }

            fn set_unsigned(&self, id: CapabilityId, value: u32) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Unsigned(value))
            }

            fn set_integer(&self, id: CapabilityId, value: i32) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Integer(value))
            }

            fn set_float(&self, id: CapabilityId, value: f64) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Float(value))
            }

            fn set_string(&self, id: CapabilityId, value: &str) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::String(value.to_string()))
            }

            fn set_boolean(&self, id: CapabilityId, value: bool) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Boolean(value))
            }

            fn set_enum(&self, id: CapabilityId, value: &EnumValue) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Enum(value.clone()))
            }

            fn set_range(&self, id: CapabilityId, value: &RangeValue) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Range(*value))
            }

            fn set_generic(&self, id: CapabilityId, value: &[u8]) -> Result<(), SdkError> {
                self.store(id, CapabilityValue::Generic(value.to_vec()))
            }

            fn start(&self, id: CapabilityId) -> Result<(), SdkError> {
                self.trigger(id)
            }
        }
    };
}

// ============================================================================
// Manager
// ============================================================================

struct ManagerState {
    values: HashMap<CapabilityId, CapabilityValue>,
    devices: Vec<Arc<SimCamera>>,
}

/// The SDK manager object: owns attach/detach and the event channel
pub struct SimManager {
    id: ObjectId,
    name: String,
    events: mpsc::UnboundedSender<SdkEvent>,
    state: Mutex<ManagerState>,
}

fn manager_table() -> Vec<CapabilityInfo> {
    use CapabilityType::*;
    let r = CapabilityFlags::GET;
    let rw = CapabilityFlags::GET | CapabilityFlags::SET;
    vec![
        cap(wk::MODULE_NAME, String, r, "Module Name"),
        cap(wk::ASYNC_RATE, Unsigned, rw, "Async Rate"),
        cap(wk::DEVICE_COUNT, Unsigned, r, "Connected Devices"),
    ]
}

impl SimManager {
    /// Create a manager and the receiving end of its event channel
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<SdkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let values = HashMap::from([
            (wk::MODULE_NAME, CapabilityValue::String(name.to_string())),
            (wk::ASYNC_RATE, CapabilityValue::Unsigned(100)),
        ]);
        let manager = Arc::new(Self {
            id: ObjectId::new("sim-manager"),
            name: name.to_string(),
            events,
            state: Mutex::new(ManagerState {
                values,
                devices: Vec::new(),
            }),
        });
        (manager, rx)
    }

    /// Plug in a new camera; emits `Attached`
    pub fn attach(&self, config: SimConfig) -> Arc<SimCamera> {
        let id = ObjectId::new(format!("sim-{}", Uuid::new_v4()));
        let camera = Arc::new(SimCamera::new(id, config, self.events.clone()));
        lock(&self.state).devices.push(camera.clone());

        info!(device = %camera.id, name = %camera.config.name, "Simulated camera attached");
        let _ = self.events.send(SdkEvent::Attached {
            device: camera.clone(),
        });
        camera
    }

    /// Unplug a camera; emits `Detached`. Returns false for unknown ids.
    pub fn detach(&self, id: &ObjectId) -> bool {
        let camera = {
            let mut state = lock(&self.state);
            let Some(pos) = state.devices.iter().position(|d| &d.id == id) else {
                return false;
            };
            state.devices.remove(pos)
        };
        camera.disconnect();

        info!(device = %id, "Simulated camera detached");
        let _ = self.events.send(SdkEvent::Detached { id: id.clone() });
        true
    }

    pub fn devices(&self) -> Vec<Arc<SimCamera>> {
        lock(&self.state).devices.clone()
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn enumerate(&self) -> Result<Vec<CapabilityInfo>, SdkError> {
        Ok(manager_table())
    }

    fn load(&self, id: CapabilityId) -> Result<CapabilityValue, SdkError> {
        let state = lock(&self.state);
        if id == wk::DEVICE_COUNT {
            lookup(&manager_table(), id)?;
            return Ok(CapabilityValue::Unsigned(state.devices.len() as u32));
        }
        load_value(&manager_table(), &state.values, id)
    }

    fn store(&self, id: CapabilityId, value: CapabilityValue) -> Result<(), SdkError> {
        let mut state = lock(&self.state);
        let value = check_write(&manager_table(), &state.values, id, value)?;
        state.values.insert(id, value);
        Ok(())
    }

    fn trigger(&self, id: CapabilityId) -> Result<(), SdkError> {
        lookup(&manager_table(), id)?;
        Err(SdkError::NotSupported(id))
    }
}

sim_capability_backend!(SimManager);

// ============================================================================
// Camera
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct VideoPlan {
    deliver: usize,
    interrupt: Option<i32>,
}

struct CameraState {
    values: HashMap<CapabilityId, CapabilityValue>,
    connected: bool,
    live_view: bool,
    stream_ended: bool,
    pending_failures: u32,
    frame_counter: u64,
    /// Frames left until the running focus drive completes
    drive_frames: u32,
    recording: bool,
    clip_counter: u32,
    image_counter: u32,
    next_video: Option<VideoPlan>,
}

/// A simulated capturing device
pub struct SimCamera {
    id: ObjectId,
    config: SimConfig,
    events: mpsc::UnboundedSender<SdkEvent>,
    state: Mutex<CameraState>,
}

fn camera_table(live_view: bool) -> Vec<CapabilityInfo> {
    use CapabilityType::*;
    let r = CapabilityFlags::GET;
    let w = CapabilityFlags::SET;
    let rw = CapabilityFlags::GET | CapabilityFlags::SET;
    let s = CapabilityFlags::START;

    let mut table = vec![
        cap(wk::NAME, String, r, "Name"),
        cap(wk::BATTERY_LEVEL, Integer, r, "Battery Level"),
        cap(wk::FIRMWARE, Generic, r, "Firmware Version"),
        cap(wk::DATE_TIME, Unknown(8), r, "Date/Time"),
        cap(wk::COMMENT, String, rw, "Image Comment"),
        cap(wk::BEEP, Boolean, rw, "Beep"),
        cap(wk::ISO, Enum, rw, "ISO Sensitivity"),
        cap(wk::EXPOSURE_COMPENSATION, Float, rw, "Exposure Compensation"),
        cap(wk::SHOOTING_MODE, Enum, rw, "Shooting Mode"),
        cap(wk::CONTINUOUS_SHOOTING_NUM, Unsigned, rw, "Continuous Shooting Count"),
        cap(wk::COMPRESSION_LEVEL, Enum, rw, "Image Quality"),
        cap(wk::LIVE_VIEW_ENABLED, Boolean, rw, "Live View"),
        cap(wk::PREVIEW_IMAGE, Generic, r, "Preview Image"),
        cap(wk::PREVIEW_IMAGE_LOW, Generic, r, "Low Resolution Preview Image"),
        cap(wk::CAPTURE, Process, s, "Capture"),
        cap(wk::MOVIE_REC_START, Process, s, "Start Movie Recording"),
        cap(wk::MOVIE_REC_STOP, Process, s, "Stop Movie Recording"),
    ];
    if live_view {
        table.push(cap(wk::MF_DRIVE, Unsigned, w, "MF Drive"));
        table.push(cap(wk::MF_DRIVE_STEP, Range, rw, "MF Drive Step"));
        table.push(cap(wk::LENS_POSITION, Unsigned, r, "Lens Position"));
    }
    table
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn synthetic_image(kind: ImageKind, counter: u32) -> CapturedImage {
    let mut data = match kind {
        ImageKind::Jpeg => vec![0xFF, 0xD8, 0xFF, 0xE0],
        ImageKind::Nef => b"II*\0".to_vec(),
    };
    data.extend_from_slice(&counter.to_le_bytes());
    data.extend(std::iter::repeat(0x5A).take(256));
    if kind == ImageKind::Jpeg {
        data.extend_from_slice(&[0xFF, 0xD9]);
    }
    CapturedImage { kind, data }
}

/// Thumbnail dimensions delivered with every capture
const THUMBNAIL_WIDTH: u32 = 16;
const THUMBNAIL_HEIGHT: u32 = 12;

fn synthetic_thumbnail(counter: u32) -> DecodedImage {
    let seed = counter as u8;
    let pixels = encode_frame(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, seed)[FRAME_PREFIX..].to_vec();
    DecodedImage {
        pixels,
        width: THUMBNAIL_WIDTH,
        height: THUMBNAIL_HEIGHT,
        stride: THUMBNAIL_WIDTH * 3,
    }
}

/// Encode an RGB24 test pattern in the simulator's frame format
pub fn encode_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity(FRAME_PREFIX + (width * height * 3) as usize);
    data.extend_from_slice(FRAME_MAGIC);
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    for y in 0..height {
        for x in 0..width {
            data.push(((x * 255 / width.max(1)) as u8).wrapping_add(seed));
            data.push((y * 255 / height.max(1)) as u8);
            data.push(seed);
        }
    }
    data
}

impl SimCamera {
    fn new(id: ObjectId, config: SimConfig, events: mpsc::UnboundedSender<SdkEvent>) -> Self {
        let values = HashMap::from([
            (wk::NAME, CapabilityValue::String(config.name.clone())),
            (wk::BATTERY_LEVEL, CapabilityValue::Integer(85)),
            (wk::FIRMWARE, CapabilityValue::Generic(b"1.10".to_vec())),
            (wk::COMMENT, CapabilityValue::String(String::new())),
            (wk::BEEP, CapabilityValue::Boolean(false)),
            (wk::ISO, CapabilityValue::Enum(EnumValue::new(0, strings(&ISO_VALUES)))),
            (wk::EXPOSURE_COMPENSATION, CapabilityValue::Float(0.0)),
            (
                wk::SHOOTING_MODE,
                CapabilityValue::Enum(EnumValue::new(0, strings(&SHOOTING_MODES))),
            ),
            (wk::CONTINUOUS_SHOOTING_NUM, CapabilityValue::Unsigned(1)),
            (
                wk::COMPRESSION_LEVEL,
                CapabilityValue::Enum(EnumValue::new(2, strings(&QUALITY_LEVELS))),
            ),
            (wk::LIVE_VIEW_ENABLED, CapabilityValue::Boolean(false)),
            (
                wk::PREVIEW_IMAGE,
                CapabilityValue::Generic(synthetic_image(ImageKind::Jpeg, 0).data),
            ),
            (
                wk::PREVIEW_IMAGE_LOW,
                CapabilityValue::Generic(synthetic_image(ImageKind::Jpeg, 0).data),
            ),
            (
                wk::MF_DRIVE_STEP,
                CapabilityValue::Range(RangeValue::new(0.0, 0.0, MF_MAX_STEP, MF_MAX_STEP as u32 + 1)),
            ),
            (wk::LENS_POSITION, CapabilityValue::Unsigned(LENS_TRAVEL)),
        ]);

        Self {
            id,
            config,
            events,
            state: Mutex::new(CameraState {
                values,
                connected: true,
                live_view: false,
                stream_ended: false,
                pending_failures: 0,
                frame_counter: 0,
                drive_frames: 0,
                recording: false,
                clip_counter: 0,
                image_counter: 0,
                next_video: None,
            }),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn live_view_enabled(&self) -> bool {
        lock(&self.state).live_view
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.state).recording
    }

    pub fn lens_position(&self) -> u32 {
        match lock(&self.state).values.get(&wk::LENS_POSITION) {
            Some(CapabilityValue::Unsigned(pos)) => *pos,
            _ => LENS_TRAVEL,
        }
    }

    /// Make the next `count` frame requests fail with a transport error
    pub fn fail_next_frames(&self, count: u32) {
        lock(&self.state).pending_failures = count;
    }

    /// Stop producing frames until live view is switched off and on again
    pub fn end_live_stream(&self) {
        lock(&self.state).stream_ended = true;
    }

    /// Cut the next clip short after `deliver` fragments, optionally
    /// reporting an interruption with the given result code
    pub fn truncate_next_video(&self, deliver: usize, interrupt: Option<i32>) {
        lock(&self.state).next_video = Some(VideoPlan { deliver, interrupt });
    }

    /// Change a value on the camera body, as if a dial was turned
    pub fn change_value(&self, id: CapabilityId, value: CapabilityValue) {
        lock(&self.state).values.insert(id, value);
        self.emit(SdkEvent::CapabilityValueChanged {
            id: self.id.clone(),
            capability: id,
        });
    }

    fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.live_view = false;
        state.recording = false;
    }

    fn emit(&self, event: SdkEvent) {
        debug!(device = %self.id, event = ?event, "Simulated SDK event");
        let _ = self.events.send(event);
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn enumerate(&self) -> Result<Vec<CapabilityInfo>, SdkError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected);
        }
        Ok(camera_table(state.live_view))
    }

    fn load(&self, id: CapabilityId) -> Result<CapabilityValue, SdkError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected);
        }
        load_value(&camera_table(state.live_view), &state.values, id)
    }

    fn store(&self, id: CapabilityId, value: CapabilityValue) -> Result<(), SdkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected);
        }
        let value = check_write(&camera_table(state.live_view), &state.values, id, value)?;

        match (id, &value) {
            (wk::LIVE_VIEW_ENABLED, CapabilityValue::Boolean(enabled)) => {
                self.apply_live_view(&mut state, *enabled);
                return Ok(());
            }
            (wk::MF_DRIVE, CapabilityValue::Unsigned(direction)) => {
                self.drive(&mut state, *direction)?;
            }
            _ => {}
        }
        state.values.insert(id, value);
        Ok(())
    }

    fn trigger(&self, id: CapabilityId) -> Result<(), SdkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected);
        }
        let table = camera_table(state.live_view);
        let info = lookup(&table, id)?;
        if !info.flags.startable {
            return Err(SdkError::NotSupported(id));
        }

        match id {
            wk::CAPTURE => {
                self.capture(&mut state);
                Ok(())
            }
            wk::MOVIE_REC_START => {
                if !state.live_view {
                    return Err(SdkError::Failed(ERR_LIVE_VIEW_REQUIRED));
                }
                if state.recording {
                    return Err(SdkError::Busy);
                }
                state.recording = true;
                info!(device = %self.id, "Simulated recording started");
                Ok(())
            }
            wk::MOVIE_REC_STOP => {
                if !state.recording {
                    return Err(SdkError::Failed(ERR_NOT_RECORDING));
                }
                state.recording = false;
                state.clip_counter += 1;
                self.deliver_clip(&mut state);
                Ok(())
            }
            _ => Err(SdkError::NotSupported(id)),
        }
    }

    fn apply_live_view(&self, state: &mut CameraState, enabled: bool) {
        if state.live_view == enabled {
            return;
        }
        state.live_view = enabled;
        state.stream_ended = false;
        state
            .values
            .insert(wk::LIVE_VIEW_ENABLED, CapabilityValue::Boolean(enabled));

        if !enabled {
            state.drive_frames = 0;
            if state.recording {
                state.recording = false;
                self.emit(SdkEvent::VideoInterrupted {
                    id: self.id.clone(),
                    code: ERR_LIVE_VIEW_REQUIRED,
                });
            }
        }

        self.emit(SdkEvent::CapabilityValueChanged {
            id: self.id.clone(),
            capability: wk::LIVE_VIEW_ENABLED,
        });
        // Manual-focus capabilities come and go with live view
        self.emit(SdkEvent::CapabilitySetChanged { id: self.id.clone() });
    }

    fn drive(&self, state: &mut CameraState, direction: u32) -> Result<(), SdkError> {
        if !state.live_view {
            return Err(SdkError::Failed(ERR_LIVE_VIEW_REQUIRED));
        }
        if state.drive_frames > 0 {
            return Err(SdkError::Busy);
        }

        let step = match state.values.get(&wk::MF_DRIVE_STEP) {
            Some(CapabilityValue::Range(r)) => r.value.max(0.0) as u32,
            _ => 0,
        };
        let position = match state.values.get(&wk::LENS_POSITION) {
            Some(CapabilityValue::Unsigned(pos)) => *pos,
            _ => LENS_TRAVEL,
        };
        let target = match direction {
            wk::MF_DRIVE_TO_CLOSEST => position.saturating_sub(step),
            wk::MF_DRIVE_TO_INFINITY => position.saturating_add(step).min(LENS_TRAVEL),
            _ => return Err(SdkError::Failed(ERR_INVALID_PARAMETER)),
        };

        state
            .values
            .insert(wk::LENS_POSITION, CapabilityValue::Unsigned(target));
        state.drive_frames = step.div_ceil(DRIVE_UNITS_PER_FRAME).max(1);
        debug!(device = %self.id, from = position, to = target, "Focus drive started");
        Ok(())
    }

    fn capture(&self, state: &mut CameraState) {
        let continuous = matches!(
            state.values.get(&wk::SHOOTING_MODE),
            Some(CapabilityValue::Enum(mode)) if mode.index == 1 || mode.index == 2
        );
        let count = match state.values.get(&wk::CONTINUOUS_SHOOTING_NUM) {
            Some(CapabilityValue::Unsigned(n)) if continuous => (*n).max(1),
            _ => 1,
        };
        let kind = match state.values.get(&wk::COMPRESSION_LEVEL) {
            Some(CapabilityValue::Enum(level)) if level.selected() == Some("RAW") => ImageKind::Nef,
            _ => ImageKind::Jpeg,
        };

        for _ in 0..count {
            state.image_counter += 1;
            let counter = state.image_counter;
            self.emit(SdkEvent::ImageReady {
                id: self.id.clone(),
                image: synthetic_image(kind, counter),
            });
            for resolution in [PreviewResolution::Normal, PreviewResolution::Low] {
                self.emit(SdkEvent::PreviewReady {
                    id: self.id.clone(),
                    preview: PreviewImage {
                        resolution,
                        jpeg: synthetic_image(ImageKind::Jpeg, counter).data,
                    },
                });
            }
            self.emit(SdkEvent::ThumbnailReady {
                id: self.id.clone(),
                thumbnail: synthetic_thumbnail(counter),
            });
        }
        self.emit(SdkEvent::CaptureComplete {
            id: self.id.clone(),
            data: count as i32,
        });
    }

    fn deliver_clip(&self, state: &mut CameraState) {
        let total = self.config.video_fragments.max(1);
        let plan = state.next_video.take();
        let deliver = plan.map_or(total, |p| p.deliver.min(total));
        let filename = format!("DSC_{:04}.MOV", state.clip_counter);

        for i in 0..deliver {
            let is_last = i + 1 == total;
            let payload = (0..self.config.fragment_size)
                .map(|b| ((i + b) % 256) as u8)
                .collect();
            self.emit(SdkEvent::VideoFragmentReady {
                id: self.id.clone(),
                fragment: VideoFragment {
                    is_first: i == 0,
                    is_last,
                    payload,
                    percent_complete: (i + 1) as f32 * 100.0 / total as f32,
                    filename: filename.clone(),
                    width: if is_last { VIDEO_WIDTH } else { 0 },
                    height: if is_last { VIDEO_HEIGHT } else { 0 },
                },
            });
        }

        if let Some(code) = plan.and_then(|p| p.interrupt) {
            self.emit(SdkEvent::VideoInterrupted {
                id: self.id.clone(),
                code,
            });
        }
    }
}

sim_capability_backend!(SimCamera);

impl DeviceBackend for SimCamera {
    fn set_live_view(&self, enabled: bool) -> Result<(), SdkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected);
        }
        self.apply_live_view(&mut state, enabled);
        Ok(())
    }

    fn request_live_frame(&self) -> Result<RawFrame, FrameError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SdkError::Disconnected.into());
        }
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(SdkError::Busy.into());
        }
        if !state.live_view || state.stream_ended {
            return Err(FrameError::StreamEnded);
        }

        state.frame_counter += 1;
        let mut header = vec![0u8; HEADER_LEN];
        header[..8].copy_from_slice(&state.frame_counter.to_le_bytes());
        header[wk::HEADER_DRIVING_OFFSET] = u8::from(state.drive_frames > 0);

        if state.drive_frames > 0 {
            state.drive_frames -= 1;
            if state.drive_frames == 0 {
                self.emit(SdkEvent::CapabilityValueChanged {
                    id: self.id.clone(),
                    capability: wk::LENS_POSITION,
                });
            }
        }

        let data = encode_frame(
            self.config.frame_width,
            self.config.frame_height,
            state.frame_counter as u8,
        );
        Ok(RawFrame::new(header, data))
    }
}

/// Decoder for frames produced by `SimCamera`
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFrameDecoder;

impl FrameDecoder for SimFrameDecoder {
    fn decode(&self, raw: &RawFrame) -> Result<DecodedImage, DecodeError> {
        let data = &raw.data;
        if data.len() < FRAME_PREFIX || &data[..4] != FRAME_MAGIC {
            return Err(DecodeError::UnknownFormat);
        }
        let word = |at: usize| {
            data[at..at + 4]
                .try_into()
                .map(u32::from_le_bytes)
                .map_err(|_| DecodeError::UnknownFormat)
        };
        let width = word(4)?;
        let height = word(8)?;

        let stride = width.checked_mul(3).ok_or(DecodeError::UnknownFormat)?;
        let expected = (stride as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_add(FRAME_PREFIX))
            .ok_or(DecodeError::UnknownFormat)?;
        if data.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        Ok(DecodedImage {
            pixels: data[FRAME_PREFIX..expected].to_vec(),
            width,
            height,
            stride,
        })
    }
}
