//! Device family profiles and the registry that resolves them.

use std::{collections::HashMap, ops::Range, sync::Arc};

use radio_clone_core::{BlockSpan, CloneError, ControlLines, DeviceKey};
use serde::Serialize;
use thiserror::Error;

use crate::layout::ChannelLayout;

/// Highest address a 16-bit block header can reach, plus one.
const ADDRESS_SPACE: usize = 0x1_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FamilyError {
    #[error("{key}: block size must be non-zero")]
    BlockSize { key: DeviceKey },
    #[error("{key}: memory size {size} does not fit a 16-bit address space")]
    MemorySize { key: DeviceKey, size: usize },
    #[error("{key}: write range {start:#06x}..{end:#06x} is empty or out of bounds")]
    RangeBounds { key: DeviceKey, start: u32, end: u32 },
    #[error("{key}: write ranges overlap or are out of order at {start:#06x}")]
    RangeOrder { key: DeviceKey, start: u32 },
    #[error("{key}: channel directory does not fit the image")]
    Layout { key: DeviceKey },
    #[error("{key}: no identification signature")]
    Signature { key: DeviceKey },
    #[error("device family {0} already registered")]
    Duplicate(DeviceKey),
}

/// Everything the engine needs to talk to one model.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFamily {
    pub key: DeviceKey,
    pub vendor: String,
    pub model: String,
    pub baud_rate: u32,
    pub wants_dtr: bool,
    pub wants_rts: bool,
    /// Sent after the initial `0x02` to request programming mode.
    pub program_command: Vec<u8>,
    /// Any of these inside the 8-byte ident accepts the radio.
    pub signatures: Vec<Vec<u8>>,
    pub block_size: u8,
    pub memory_size: usize,
    /// Address ranges the radio accepts writes for, ascending.
    pub write_ranges: Vec<Range<u16>>,
    pub layout: ChannelLayout,
}

impl DeviceFamily {
    /// The compact handheld used as the reference profile.
    #[must_use]
    pub fn p3107() -> Self {
        Self {
            key: DeviceKey::new("p3107", "CompactHandheld"),
            vendor: "Generic".to_string(),
            model: "P3107".to_string(),
            baud_rate: 9600,
            wants_dtr: true,
            wants_rts: true,
            program_command: b"PROGRAM".to_vec(),
            signatures: vec![b"P3107".to_vec()],
            block_size: 8,
            memory_size: 0x80,
            write_ranges: vec![0x0000..0x0080],
            layout: ChannelLayout {
                base: 0x0010,
                count: 6,
            },
        }
    }

    #[must_use]
    pub const fn lines(&self) -> ControlLines {
        ControlLines {
            dtr: self.wants_dtr,
            rts: self.wants_rts,
        }
    }

    /// Whether `ident` contains one of the family's signatures.
    #[must_use]
    pub fn matches_ident(&self, ident: &[u8]) -> bool {
        self.signatures.iter().any(|sig| {
            !sig.is_empty() && ident.windows(sig.len()).any(|window| window == sig.as_slice())
        })
    }

    /// Check the profile is internally consistent.
    ///
    /// # Errors
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), FamilyError> {
        let key = || self.key.clone();
        if self.block_size == 0 {
            return Err(FamilyError::BlockSize { key: key() });
        }
        if self.memory_size == 0 || self.memory_size > ADDRESS_SPACE {
            return Err(FamilyError::MemorySize {
                key: key(),
                size: self.memory_size,
            });
        }
        if self.signatures.iter().all(Vec::is_empty) {
            return Err(FamilyError::Signature { key: key() });
        }

        let mut previous_end = 0u32;
        for range in &self.write_ranges {
            let (start, end) = (u32::from(range.start), u32::from(range.end));
            if start >= end || end as usize > self.memory_size {
                return Err(FamilyError::RangeBounds { key: key(), start, end });
            }
            if start < previous_end {
                return Err(FamilyError::RangeOrder { key: key(), start });
            }
            previous_end = end;
        }

        if self.layout.directory().end > self.memory_size {
            return Err(FamilyError::Layout { key: key() });
        }
        Ok(())
    }

    /// Blocks covering `0..memory_size` in increasing address order.
    #[must_use]
    pub fn read_plan(&self) -> Vec<BlockSpan> {
        plan(0..self.memory_size, self.block_size)
    }

    /// Blocks covering every write range in increasing address order.
    #[must_use]
    pub fn write_plan(&self) -> Vec<BlockSpan> {
        self.write_ranges
            .iter()
            .flat_map(|r| plan(usize::from(r.start)..usize::from(r.end), self.block_size))
            .collect()
    }

    /// Number of channel slots.
    #[must_use]
    pub const fn channel_count(&self) -> u32 {
        self.layout.count
    }
}

#[allow(clippy::cast_possible_truncation)]
fn plan(range: Range<usize>, block_size: u8) -> Vec<BlockSpan> {
    let step = usize::from(block_size.max(1));
    range
        .clone()
        .step_by(step)
        .map(|address| BlockSpan {
            address: address as u16,
            length: step.min(range.end - address) as u8,
        })
        .collect()
}

/// Families known to this process, keyed by `family.class`.
#[derive(Debug, Clone, Default)]
pub struct FamilyRegistry {
    families: HashMap<DeviceKey, Arc<DeviceFamily>>,
}

impl FamilyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in families.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let p3107 = DeviceFamily::p3107();
        registry
            .families
            .insert(p3107.key.clone(), Arc::new(p3107));
        registry
    }

    /// Add a family after validating it.
    ///
    /// # Errors
    /// Returns an error when the profile is inconsistent or the key is taken.
    pub fn register(&mut self, family: DeviceFamily) -> Result<(), FamilyError> {
        family.validate()?;
        if self.families.contains_key(&family.key) {
            return Err(FamilyError::Duplicate(family.key));
        }
        tracing::debug!(key = %family.key, "Registered device family");
        self.families.insert(family.key.clone(), Arc::new(family));
        Ok(())
    }

    /// Resolve a key.
    ///
    /// # Errors
    /// Returns `CloneError::UnknownDevice` when nothing is registered under `key`.
    pub fn get(&self, key: &DeviceKey) -> Result<Arc<DeviceFamily>, CloneError> {
        self.families
            .get(key)
            .cloned()
            .ok_or_else(|| CloneError::UnknownDevice(key.to_string()))
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<_> = self.families.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn families(&self) -> Vec<Arc<DeviceFamily>> {
        self.keys()
            .iter()
            .filter_map(|k| self.families.get(k).cloned())
            .collect()
    }
}
