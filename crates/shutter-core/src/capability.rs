//! Capability types: ids, declared types, operation flags and typed values
//!
//! A capability is a named, typed setting or action exposed by a camera
//! device or by the SDK manager object. The SDK reports each capability as a
//! numeric id, a numeric type code and an operation bitmask; this module turns
//! those into strongly typed values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SDK-assigned capability identifier, stable for the lifetime of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityId(pub u32);

impl CapabilityId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Declared type of a capability
///
/// Determines which typed accessor is valid. Type codes the SDK reports but
/// this crate has no accessor for are kept as `Unknown` so that callers get
/// an explicit `UnsupportedType` error instead of a silent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Unsigned,
    Integer,
    Float,
    String,
    Boolean,
    Enum,
    Range,
    Process,
    Generic,
    Unknown(u32),
}

impl CapabilityType {
    /// Map an SDK type code to a capability type
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Process,
            1 => Self::Integer,
            2 => Self::Unsigned,
            3 => Self::Boolean,
            4 => Self::Float,
            7 => Self::String,
            11 => Self::Enum,
            12 => Self::Range,
            13 => Self::Generic,
            other => Self::Unknown(other),
        }
    }

    /// SDK type code for this type
    pub fn code(&self) -> u32 {
        match self {
            Self::Process => 0,
            Self::Integer => 1,
            Self::Unsigned => 2,
            Self::Boolean => 3,
            Self::Float => 4,
            Self::String => 7,
            Self::Enum => 11,
            Self::Range => 12,
            Self::Generic => 13,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned => write!(f, "Unsigned"),
            Self::Integer => write!(f, "Integer"),
            Self::Float => write!(f, "Float"),
            Self::String => write!(f, "String"),
            Self::Boolean => write!(f, "Boolean"),
            Self::Enum => write!(f, "Enum"),
            Self::Range => write!(f, "Range"),
            Self::Process => write!(f, "Process"),
            Self::Generic => write!(f, "Generic"),
            Self::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

/// Operations the SDK allows on a capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub readable: bool,
    pub writable: bool,
    pub startable: bool,
}

impl CapabilityFlags {
    pub const START: u32 = 0x1;
    pub const GET: u32 = 0x2;
    pub const SET: u32 = 0x4;

    /// Decode the SDK operation bitmask
    pub fn from_bits(bits: u32) -> Self {
        Self {
            readable: bits & Self::GET != 0,
            writable: bits & Self::SET != 0,
            startable: bits & Self::START != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.startable {
            bits |= Self::START;
        }
        if self.readable {
            bits |= Self::GET;
        }
        if self.writable {
            bits |= Self::SET;
        }
        bits
    }
}

impl fmt::Display for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.readable { 'r' } else { '-' };
        let w = if self.writable { 'w' } else { '-' };
        let s = if self.startable { 's' } else { '-' };
        write!(f, "{}{}{}", r, w, s)
    }
}

/// Capability metadata as reported by the SDK enumeration call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: CapabilityId,
    pub kind: CapabilityType,
    pub flags: CapabilityFlags,
    /// Human-readable title reported by the SDK
    #[serde(default)]
    pub description: String,
}

impl CapabilityInfo {
    pub fn new(id: u32, kind: CapabilityType, flags: CapabilityFlags, description: &str) -> Self {
        Self {
            id: CapabilityId(id),
            kind,
            flags,
            description: description.to_string(),
        }
    }
}

/// An enumerated value: a list of items and the selected index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub index: usize,
    pub items: Vec<String>,
}

impl EnumValue {
    pub fn new(index: usize, items: Vec<String>) -> Self {
        Self { index, items }
    }

    /// Currently selected item, if the index is in bounds
    pub fn selected(&self) -> Option<&str> {
        self.items.get(self.index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Copy of this value with a different selection, `None` if out of bounds
    pub fn with_index(&self, index: usize) -> Option<Self> {
        (index < self.items.len()).then(|| Self {
            index,
            items: self.items.clone(),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.index < self.items.len()
    }
}

/// A bounded numeric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    /// Number of discrete steps (0 = continuous)
    pub steps: u32,
}

impl RangeValue {
    pub fn new(value: f64, min: f64, max: f64, steps: u32) -> Self {
        Self {
            value,
            min,
            max,
            steps,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn with_value(&self, value: f64) -> Self {
        Self { value, ..*self }
    }

    pub fn is_valid(&self) -> bool {
        self.contains(self.value)
    }
}

/// A typed capability value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CapabilityValue {
    Unsigned(u32),
    Integer(i32),
    Float(f64),
    String(String),
    Boolean(bool),
    Enum(EnumValue),
    Range(RangeValue),
    /// Action capabilities have no state of their own
    Process,
    Generic(Vec<u8>),
}

impl CapabilityValue {
    /// The capability type whose shape this value has
    pub fn kind(&self) -> CapabilityType {
        match self {
            Self::Unsigned(_) => CapabilityType::Unsigned,
            Self::Integer(_) => CapabilityType::Integer,
            Self::Float(_) => CapabilityType::Float,
            Self::String(_) => CapabilityType::String,
            Self::Boolean(_) => CapabilityType::Boolean,
            Self::Enum(_) => CapabilityType::Enum,
            Self::Range(_) => CapabilityType::Range,
            Self::Process => CapabilityType::Process,
            Self::Generic(_) => CapabilityType::Generic,
        }
    }

    pub fn as_unsigned(&self) -> Option<u32> {
        match self {
            Self::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumValue> {
        match self {
            Self::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeValue> {
        match self {
            Self::Range(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Enum(e) => match e.selected() {
                Some(item) => write!(f, "{} [{}/{}]", item, e.index, e.items.len()),
                None => write!(f, "<invalid index {}>", e.index),
            },
            Self::Range(r) => write!(f, "{} [{}..{}]", r.value, r.min, r.max),
            Self::Process => write!(f, "<action>"),
            Self::Generic(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// One capability of a device or manager, with its cached value
///
/// Metadata is fixed at creation; only the cached value changes, and only
/// through the owning registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityEntry {
    info: CapabilityInfo,
    cached: Option<CapabilityValue>,
}

impl CapabilityEntry {
    pub fn new(info: CapabilityInfo) -> Self {
        Self { info, cached: None }
    }

    pub fn id(&self) -> CapabilityId {
        self.info.id
    }

    pub fn kind(&self) -> CapabilityType {
        self.info.kind
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.info.flags
    }

    pub fn is_readable(&self) -> bool {
        self.info.flags.readable
    }

    pub fn is_writable(&self) -> bool {
        self.info.flags.writable
    }

    pub fn is_startable(&self) -> bool {
        self.info.flags.startable
    }

    pub fn description(&self) -> &str {
        &self.info.description
    }

    pub fn info(&self) -> &CapabilityInfo {
        &self.info
    }

    /// Last known value, `None` until first read
    pub fn cached(&self) -> Option<&CapabilityValue> {
        self.cached.as_ref()
    }

    /// Replace the cached value; the shape must match the declared type
    pub(crate) fn set_cached(&mut self, value: CapabilityValue) {
        debug_assert_eq!(value.kind(), self.info.kind);
        self.cached = Some(value);
    }
}

/// Capability ids the SDK collaborator advertises for common operations
pub mod well_known {
    use super::CapabilityId;

    // Actions
    pub const CAPTURE: CapabilityId = CapabilityId(0x8001);
    pub const MOVIE_REC_START: CapabilityId = CapabilityId(0x8002);
    pub const MOVIE_REC_STOP: CapabilityId = CapabilityId(0x8003);

    pub const PREVIEW_IMAGE: CapabilityId = CapabilityId(0x8010);
    pub const PREVIEW_IMAGE_LOW: CapabilityId = CapabilityId(0x8011);
    pub const LIVE_VIEW_ENABLED: CapabilityId = CapabilityId(0x8020);

    // Manual focus, only present while live view is on
    pub const MF_DRIVE: CapabilityId = CapabilityId(0x8030);
    pub const MF_DRIVE_STEP: CapabilityId = CapabilityId(0x8031);
    pub const LENS_POSITION: CapabilityId = CapabilityId(0x8032);

    pub const SHOOTING_MODE: CapabilityId = CapabilityId(0x8040);
    pub const CONTINUOUS_SHOOTING_NUM: CapabilityId = CapabilityId(0x8041);
    pub const COMPRESSION_LEVEL: CapabilityId = CapabilityId(0x8042);
    pub const ISO: CapabilityId = CapabilityId(0x8043);
    pub const EXPOSURE_COMPENSATION: CapabilityId = CapabilityId(0x8044);

    pub const NAME: CapabilityId = CapabilityId(0x8050);
    pub const BATTERY_LEVEL: CapabilityId = CapabilityId(0x8051);
    pub const FIRMWARE: CapabilityId = CapabilityId(0x8052);
    pub const DATE_TIME: CapabilityId = CapabilityId(0x8053);
    pub const COMMENT: CapabilityId = CapabilityId(0x8054);
    pub const BEEP: CapabilityId = CapabilityId(0x8055);

    // Manager object
    pub const MODULE_NAME: CapabilityId = CapabilityId(0x8060);
    pub const ASYNC_RATE: CapabilityId = CapabilityId(0x8061);
    pub const DEVICE_COUNT: CapabilityId = CapabilityId(0x8062);

    /// `MF_DRIVE` directions
    pub const MF_DRIVE_TO_CLOSEST: u32 = 0;
    pub const MF_DRIVE_TO_INFINITY: u32 = 1;

    /// Live-view header byte that is non-zero while the focus motor moves
    pub const HEADER_DRIVING_OFFSET: usize = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(CapabilityType::from_code(0), CapabilityType::Process);
        assert_eq!(CapabilityType::from_code(2), CapabilityType::Unsigned);
        assert_eq!(CapabilityType::from_code(11), CapabilityType::Enum);
        assert_eq!(CapabilityType::from_code(8), CapabilityType::Unknown(8));
        assert!(!CapabilityType::from_code(8).is_supported());
        assert_eq!(CapabilityType::Range.code(), 12);
    }

    #[test]
    fn test_flags_from_bits() {
        let flags = CapabilityFlags::from_bits(CapabilityFlags::GET | CapabilityFlags::SET);
        assert!(flags.readable);
        assert!(flags.writable);
        assert!(!flags.startable);
        assert_eq!(flags.bits(), 0x6);
        assert_eq!(flags.to_string(), "rw-");
    }

    #[test]
    fn test_enum_value_selection() {
        let iso = EnumValue::new(0, vec!["100".into(), "200".into(), "400".into()]);
        assert_eq!(iso.selected(), Some("100"));
        assert_eq!(iso.with_index(2).unwrap().selected(), Some("400"));
        assert!(iso.with_index(3).is_none());
    }

    #[test]
    fn test_range_value_bounds() {
        let step = RangeValue::new(200.0, 0.0, 32767.0, 0);
        assert!(step.is_valid());
        assert!(!step.contains(40000.0));
        assert_eq!(step.with_value(step.max).value, 32767.0);
    }

    #[test]
    fn test_value_kind_and_display() {
        assert_eq!(CapabilityValue::Unsigned(5).kind(), CapabilityType::Unsigned);
        assert_eq!(CapabilityValue::Process.kind(), CapabilityType::Process);
        let e = CapabilityValue::Enum(EnumValue::new(1, vec!["S".into(), "CH".into()]));
        assert_eq!(e.to_string(), "CH [1/2]");
        assert_eq!(CapabilityId(0x8001).to_string(), "0x8001");
    }
}
