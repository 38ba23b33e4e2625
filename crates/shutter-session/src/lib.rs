//! Shutter Session - Device sessions and the session directory
//!
//! Sessions tie an SDK object's capability registry to its live-view loop and
//! video assembler. The session directory opens and closes sessions as
//! devices attach and detach, and runs the single event pump that applies
//! SDK notifications, decode results and live-view ticks.
//!
//! The `sim` module provides an in-process SDK collaborator used by the demo
//! binary and the tests.

pub mod directory;
pub mod liveview;
pub mod session;
pub mod sim;

pub use directory::{DirectoryConfig, DirectoryEvent, RunExit, SessionDirectory};
pub use liveview::{
    DecodeOutcome, LiveView, LiveViewConfig, LiveViewState, LiveViewStop, PublishOutcome,
    TickOutcome,
};
pub use session::{
    CapabilityWatch, DeviceResources, ImageDelivery, Session, SessionError, SessionEvent,
    SessionKind,
};
pub use sim::{SimCamera, SimConfig, SimFrameDecoder, SimManager};
