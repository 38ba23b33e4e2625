//! SDK collaborator interface
//!
//! The vendor SDK (device discovery, protocol, transport) is an external
//! dependency. Everything in this workspace talks to it through the traits
//! and the event type defined here, so a native binding and the simulator
//! are interchangeable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::capability::{CapabilityId, CapabilityInfo, EnumValue, RangeValue};
use crate::frame::{CapturedImage, DecodedImage, PreviewImage, RawFrame};
use crate::video::VideoFragment;

/// Opaque identity of an SDK object (a manager or a device)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by an SDK call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("SDK call failed with result code {0}")]
    Failed(i32),
    #[error("Capability {0} is not supported by this object")]
    NotSupported(CapabilityId),
    #[error("Device is busy")]
    Busy,
    #[error("Device is disconnected")]
    Disconnected,
}

/// Failure to obtain a live-view frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The device has no more frames to give (live view switched off)
    #[error("Live view stream ended")]
    StreamEnded,
    #[error("Live view transport failure: {0}")]
    Transport(#[from] SdkError),
}

/// Typed capability access for one SDK object
///
/// Getters and setters are selected by the capability's declared type; the
/// registry performs that dispatch. Implementations are driven from a single
/// owning context and may assume commands are not issued concurrently.
pub trait CapabilityBackend: Send + Sync {
    fn object_id(&self) -> ObjectId;

    fn name(&self) -> String;

    /// Enumerate the capabilities currently supported by this object
    fn capabilities(&self) -> Result<Vec<CapabilityInfo>, SdkError>;

    fn get_unsigned(&self, id: CapabilityId) -> Result<u32, SdkError>;
    fn get_integer(&self, id: CapabilityId) -> Result<i32, SdkError>;
    fn get_float(&self, id: CapabilityId) -> Result<f64, SdkError>;
    fn get_string(&self, id: CapabilityId) -> Result<String, SdkError>;
    fn get_boolean(&self, id: CapabilityId) -> Result<bool, SdkError>;
    fn get_enum(&self, id: CapabilityId) -> Result<EnumValue, SdkError>;
    fn get_range(&self, id: CapabilityId) -> Result<RangeValue, SdkError>;
    fn get_generic(&self, id: CapabilityId) -> Result<Vec<u8>, SdkError>;

    fn set_unsigned(&self, id: CapabilityId, value: u32) -> Result<(), SdkError>;
    fn set_integer(&self, id: CapabilityId, value: i32) -> Result<(), SdkError>;
    fn set_float(&self, id: CapabilityId, value: f64) -> Result<(), SdkError>;
    fn set_string(&self, id: CapabilityId, value: &str) -> Result<(), SdkError>;
    fn set_boolean(&self, id: CapabilityId, value: bool) -> Result<(), SdkError>;
    fn set_enum(&self, id: CapabilityId, value: &EnumValue) -> Result<(), SdkError>;
    fn set_range(&self, id: CapabilityId, value: &RangeValue) -> Result<(), SdkError>;
    fn set_generic(&self, id: CapabilityId, value: &[u8]) -> Result<(), SdkError>;

    /// Trigger an action capability
    fn start(&self, id: CapabilityId) -> Result<(), SdkError>;
}

/// A capturing device: capability access plus live view
pub trait DeviceBackend: CapabilityBackend {
    /// Switch the device's live-view mode on or off
    fn set_live_view(&self, enabled: bool) -> Result<(), SdkError>;

    /// Pull the most recent live-view frame
    fn request_live_frame(&self) -> Result<RawFrame, FrameError>;
}

/// Notification emitted by the SDK collaborator
#[derive(Clone)]
pub enum SdkEvent {
    Attached {
        device: Arc<dyn DeviceBackend>,
    },
    Detached {
        id: ObjectId,
    },
    /// The set of supported capabilities changed; the SDK does not say which
    CapabilitySetChanged {
        id: ObjectId,
    },
    CapabilityValueChanged {
        id: ObjectId,
        capability: CapabilityId,
    },
    CaptureComplete {
        id: ObjectId,
        data: i32,
    },
    ImageReady {
        id: ObjectId,
        image: CapturedImage,
    },
    PreviewReady {
        id: ObjectId,
        preview: PreviewImage,
    },
    /// Uncompressed RGB24 thumbnail of a captured still
    ThumbnailReady {
        id: ObjectId,
        thumbnail: DecodedImage,
    },
    VideoFragmentReady {
        id: ObjectId,
        fragment: VideoFragment,
    },
    VideoInterrupted {
        id: ObjectId,
        code: i32,
    },
}

impl SdkEvent {
    /// Identity of the object the event is about
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Attached { device } => device.object_id(),
            Self::Detached { id }
            | Self::CapabilitySetChanged { id }
            | Self::CapabilityValueChanged { id, .. }
            | Self::CaptureComplete { id, .. }
            | Self::ImageReady { id, .. }
            | Self::PreviewReady { id, .. }
            | Self::ThumbnailReady { id, .. }
            | Self::VideoFragmentReady { id, .. }
            | Self::VideoInterrupted { id, .. } => id.clone(),
        }
    }
}

impl fmt::Debug for SdkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attached { device } => f
                .debug_struct("Attached")
                .field("id", &device.object_id())
                .field("name", &device.name())
                .finish(),
            Self::Detached { id } => f.debug_struct("Detached").field("id", id).finish(),
            Self::CapabilitySetChanged { id } => f
                .debug_struct("CapabilitySetChanged")
                .field("id", id)
                .finish(),
            Self::CapabilityValueChanged { id, capability } => f
                .debug_struct("CapabilityValueChanged")
                .field("id", id)
                .field("capability", capability)
                .finish(),
            Self::CaptureComplete { id, data } => f
                .debug_struct("CaptureComplete")
                .field("id", id)
                .field("data", data)
                .finish(),
            Self::ImageReady { id, image } => f
                .debug_struct("ImageReady")
                .field("id", id)
                .field("kind", &image.kind)
                .field("bytes", &image.data.len())
                .finish(),
            Self::PreviewReady { id, preview } => f
                .debug_struct("PreviewReady")
                .field("id", id)
                .field("resolution", &preview.resolution)
                .field("bytes", &preview.jpeg.len())
                .finish(),
            Self::ThumbnailReady { id, thumbnail } => f
                .debug_struct("ThumbnailReady")
                .field("id", id)
                .field("width", &thumbnail.width)
                .field("height", &thumbnail.height)
                .finish(),
            Self::VideoFragmentReady { id, fragment } => f
                .debug_struct("VideoFragmentReady")
                .field("id", id)
                .field("first", &fragment.is_first)
                .field("last", &fragment.is_last)
                .field("bytes", &fragment.payload.len())
                .finish(),
            Self::VideoInterrupted { id, code } => f
                .debug_struct("VideoInterrupted")
                .field("id", id)
                .field("code", code)
                .finish(),
        }
    }
}
