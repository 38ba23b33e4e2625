//! Live-view and capture image types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A live-view frame as pulled from the device, still encoded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Device status block that accompanies every frame
    pub header: Vec<u8>,
    /// Encoded image payload
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(header: Vec<u8>, data: Vec<u8>) -> Self {
        Self { header, data }
    }

    /// Read a status byte from the header
    pub fn header_byte(&self, offset: usize) -> Option<u8> {
        self.header.get(offset).copied()
    }
}

/// Output of a frame decoder: displayable RGB24 pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
}

/// A decoded live-view frame published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Monotonically increasing per live-view loop
    pub sequence: u64,
}

impl LiveFrame {
    pub fn from_decoded(image: DecodedImage, sequence: u64) -> Self {
        Self {
            pixels: image.pixels,
            width: image.width,
            height: image.height,
            stride: image.stride,
            sequence,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame payload is truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unrecognized frame format")]
    UnknownFormat,
    #[error("Decoder failure: {0}")]
    Other(String),
}

/// Converts raw device frames into displayable images
///
/// Decoding runs off the owning context, on a blocking worker.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, raw: &RawFrame) -> Result<DecodedImage, DecodeError>;
}

/// Encoding of a captured still
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Nef,
}

impl ImageKind {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Nef => "nef",
        }
    }
}

/// Which of the device's preview streams an image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewResolution {
    Normal,
    Low,
}

/// A JPEG preview of a captured still
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub resolution: PreviewResolution,
    pub jpeg: Vec<u8>,
}

/// A still image delivered after a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub kind: ImageKind,
    pub data: Vec<u8>,
}
