//! Shutter Core - Capability model, registry and video assembly
//!
//! This crate provides the foundational pieces of the Shutter camera session
//! model:
//! - Typed capability metadata and values
//! - The capability registry, rebuilt atomically on capability-set changes
//! - The SDK collaborator traits and event type
//! - Live-view frame types and the decoder seam
//! - The video fragment assembler

pub mod capability;
pub mod frame;
pub mod registry;
pub mod sdk;
pub mod video;

pub use capability::{
    well_known, CapabilityEntry, CapabilityFlags, CapabilityId, CapabilityInfo, CapabilityType,
    CapabilityValue, EnumValue, RangeValue,
};
pub use frame::{
    CapturedImage, DecodeError, DecodedImage, FrameDecoder, ImageKind, LiveFrame, PreviewImage,
    PreviewResolution, RawFrame,
};
pub use registry::{CapabilityError, CapabilityRegistry, CapabilitySet};
pub use sdk::{CapabilityBackend, DeviceBackend, FrameError, ObjectId, SdkError, SdkEvent};
pub use video::{
    AssemblerError, DirectoryOutput, FragmentOutcome, InterruptReason, OpenOutput, OutputProvider,
    VideoAssembler, VideoCompleted, VideoFragment, VideoInterrupted,
};
