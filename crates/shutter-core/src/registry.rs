//! Capability registry - the ordered set of capabilities for one SDK object
//!
//! The SDK only reports *that* the capability set changed, never which
//! entries, so the registry is replaced wholesale on every rebuild. Readers
//! see immutable `Arc<CapabilitySet>` snapshots published through a watch
//! channel: a rebuild swaps the snapshot in a single step and a concurrent
//! reader holds either the old set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capability::{CapabilityEntry, CapabilityId, CapabilityInfo, CapabilityType, CapabilityValue};
use crate::sdk::{CapabilityBackend, SdkError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Capability {0} not found")]
    NotFound(CapabilityId),
    #[error("Capability {0} is not readable")]
    NotReadable(CapabilityId),
    #[error("Capability {0} is not writable")]
    NotWritable(CapabilityId),
    #[error("Capability {0} is not startable")]
    NotStartable(CapabilityId),
    #[error("Capability {id} has type {expected}, got a {actual} value")]
    TypeMismatch {
        id: CapabilityId,
        expected: CapabilityType,
        actual: CapabilityType,
    },
    #[error("Capability {id} has unsupported type {kind}")]
    UnsupportedType { id: CapabilityId, kind: CapabilityType },
    #[error("Invalid value for capability {id}: {reason}")]
    InvalidValue { id: CapabilityId, reason: String },
    #[error("SDK call for capability {id} failed: {source}")]
    Sdk { id: CapabilityId, source: SdkError },
}

/// Immutable view of a registry at one generation
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    generation: u64,
    entries: Vec<CapabilityEntry>,
    index: HashMap<CapabilityId, usize>,
}

impl CapabilitySet {
    /// Build a set from SDK metadata, returning ids that appeared more than once
    fn build(generation: u64, infos: Vec<CapabilityInfo>) -> (Self, Vec<CapabilityId>) {
        let mut entries = Vec::with_capacity(infos.len());
        let mut index = HashMap::with_capacity(infos.len());
        let mut duplicates = Vec::new();

        for info in infos {
            if index.contains_key(&info.id) {
                duplicates.push(info.id);
                continue;
            }
            index.insert(info.id, entries.len());
            entries.push(CapabilityEntry::new(info));
        }

        (
            Self {
                generation,
                entries,
                index,
            },
            duplicates,
        )
    }

    /// Rebuild counter; 0 for the initial empty set
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: CapabilityId) -> Option<&CapabilityEntry> {
        self.index.get(&id).and_then(|&i| self.entries.get(i))
    }

    /// Entries in SDK enumeration order
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.iter()
    }

    fn get_mut(&mut self, id: CapabilityId) -> Option<&mut CapabilityEntry> {
        let i = *self.index.get(&id)?;
        self.entries.get_mut(i)
    }
}

/// Capability registry owned by one session
pub struct CapabilityRegistry {
    current: watch::Sender<Arc<CapabilitySet>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry (generation 0)
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(CapabilitySet::default()));
        Self { current }
    }

    /// Replace every entry with a freshly enumerated set
    ///
    /// Returns the new generation. Cached values are discarded.
    pub fn rebuild(&mut self, infos: Vec<CapabilityInfo>) -> u64 {
        let generation = self.current.borrow().generation + 1;
        let (set, duplicates) = CapabilitySet::build(generation, infos);

        for id in duplicates {
            warn!(capability = %id, "Duplicate capability id in enumeration, keeping first");
        }

        let count = set.len();
        self.current.send_replace(Arc::new(set));
        debug!(generation, count, "Capability registry rebuilt");
        generation
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<CapabilitySet> {
        self.current.borrow().clone()
    }

    /// Receive every future snapshot (rebuilds and cache updates)
    pub fn subscribe(&self) -> watch::Receiver<Arc<CapabilitySet>> {
        self.current.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.current.borrow().generation
    }

    pub fn len(&self) -> usize {
        self.current.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.borrow().is_empty()
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.current.borrow().contains(id)
    }

    /// Look up one entry
    pub fn get(&self, id: CapabilityId) -> Result<CapabilityEntry, CapabilityError> {
        self.current
            .borrow()
            .get(id)
            .cloned()
            .ok_or(CapabilityError::NotFound(id))
    }

    /// Read a value, served from the cache when one is present
    pub fn read<B>(&mut self, backend: &B, id: CapabilityId) -> Result<CapabilityValue, CapabilityError>
    where
        B: CapabilityBackend + ?Sized,
    {
        let entry = self.get(id)?;
        if !entry.is_readable() {
            return Err(CapabilityError::NotReadable(id));
        }
        if let Some(value) = entry.cached() {
            return Ok(value.clone());
        }
        self.fetch(backend, &entry)
    }

    /// Re-read a value from the device, overwriting the cache
    pub fn refresh<B>(&mut self, backend: &B, id: CapabilityId) -> Result<CapabilityValue, CapabilityError>
    where
        B: CapabilityBackend + ?Sized,
    {
        let entry = self.get(id)?;
        if !entry.is_readable() {
            return Err(CapabilityError::NotReadable(id));
        }
        self.fetch(backend, &entry)
    }

    /// Write a value through the typed SDK setter
    ///
    /// On success the cache holds the written value until the device reports
    /// otherwise; on any failure the cache is untouched.
    pub fn write<B>(&mut self, backend: &B, id: CapabilityId, value: CapabilityValue) -> Result<(), CapabilityError>
    where
        B: CapabilityBackend + ?Sized,
    {
        let entry = self.get(id)?;
        if !entry.is_writable() {
            return Err(CapabilityError::NotWritable(id));
        }
        if !entry.kind().is_supported() {
            return Err(CapabilityError::UnsupportedType {
                id,
                kind: entry.kind(),
            });
        }
        if value.kind() != entry.kind() {
            return Err(CapabilityError::TypeMismatch {
                id,
                expected: entry.kind(),
                actual: value.kind(),
            });
        }
        validate(id, &value)?;
        // Writing an action triggers it, so it needs the start permission too
        if value == CapabilityValue::Process && !entry.is_startable() {
            return Err(CapabilityError::NotStartable(id));
        }

        store_typed(backend, id, &value)?;
        self.update_cache(id, value);
        debug!(capability = %id, "Capability written");
        Ok(())
    }

    /// Trigger an action capability
    pub fn start<B>(&self, backend: &B, id: CapabilityId) -> Result<(), CapabilityError>
    where
        B: CapabilityBackend + ?Sized,
    {
        let entry = self.get(id)?;
        if !entry.is_startable() {
            return Err(CapabilityError::NotStartable(id));
        }
        backend
            .start(id)
            .map_err(|source| CapabilityError::Sdk { id, source })
    }

    fn fetch<B>(&mut self, backend: &B, entry: &CapabilityEntry) -> Result<CapabilityValue, CapabilityError>
    where
        B: CapabilityBackend + ?Sized,
    {
        let value = fetch_typed(backend, entry.id(), entry.kind())?;
        self.update_cache(entry.id(), value.clone());
        Ok(value)
    }

    /// Copy-on-write the current snapshot with a new cached value
    fn update_cache(&mut self, id: CapabilityId, value: CapabilityValue) -> bool {
        self.current.send_if_modified(move |set| match Arc::make_mut(set).get_mut(id) {
            Some(entry) => {
                entry.set_cached(value);
                true
            }
            None => false,
        })
    }
}

fn fetch_typed<B>(backend: &B, id: CapabilityId, kind: CapabilityType) -> Result<CapabilityValue, CapabilityError>
where
    B: CapabilityBackend + ?Sized,
{
    let sdk = move |source| CapabilityError::Sdk { id, source };

    let value = match kind {
        CapabilityType::Unsigned => CapabilityValue::Unsigned(backend.get_unsigned(id).map_err(sdk)?),
        CapabilityType::Integer => CapabilityValue::Integer(backend.get_integer(id).map_err(sdk)?),
        CapabilityType::Float => CapabilityValue::Float(backend.get_float(id).map_err(sdk)?),
        CapabilityType::String => CapabilityValue::String(backend.get_string(id).map_err(sdk)?),
        CapabilityType::Boolean => CapabilityValue::Boolean(backend.get_boolean(id).map_err(sdk)?),
        CapabilityType::Enum => CapabilityValue::Enum(backend.get_enum(id).map_err(sdk)?),
        CapabilityType::Range => CapabilityValue::Range(backend.get_range(id).map_err(sdk)?),
        CapabilityType::Generic => CapabilityValue::Generic(backend.get_generic(id).map_err(sdk)?),
        // Actions carry no state to fetch
        CapabilityType::Process => CapabilityValue::Process,
        CapabilityType::Unknown(_) => return Err(CapabilityError::UnsupportedType { id, kind }),
    };

    Ok(value)
}

fn store_typed<B>(backend: &B, id: CapabilityId, value: &CapabilityValue) -> Result<(), CapabilityError>
where
    B: CapabilityBackend + ?Sized,
{
    let result = match value {
        CapabilityValue::Unsigned(v) => backend.set_unsigned(id, *v),
        CapabilityValue::Integer(v) => backend.set_integer(id, *v),
        CapabilityValue::Float(v) => backend.set_float(id, *v),
        CapabilityValue::String(v) => backend.set_string(id, v),
        CapabilityValue::Boolean(v) => backend.set_boolean(id, *v),
        CapabilityValue::Enum(v) => backend.set_enum(id, v),
        CapabilityValue::Range(v) => backend.set_range(id, v),
        CapabilityValue::Generic(v) => backend.set_generic(id, v),
        CapabilityValue::Process => backend.start(id),
    };
    result.map_err(|source| CapabilityError::Sdk { id, source })
}

fn validate(id: CapabilityId, value: &CapabilityValue) -> Result<(), CapabilityError> {
    match value {
        CapabilityValue::Enum(e) if !e.is_valid() => Err(CapabilityError::InvalidValue {
            id,
            reason: format!("index {} out of {} items", e.index, e.items.len()),
        }),
        CapabilityValue::Range(r) if !r.is_valid() => Err(CapabilityError::InvalidValue {
            id,
            reason: format!("{} outside [{}, {}]", r.value, r.min, r.max),
        }),
        CapabilityValue::Float(v) if !v.is_finite() => Err(CapabilityError::InvalidValue {
            id,
            reason: "not a finite number".to_string(),
        }),
        _ => Ok(()),
    }
}
