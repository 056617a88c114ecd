//! Host configuration
//!
//! Every address the runtime touches comes from a [`HostConfig`] handed to
//! the constructors. Defaults describe a VCK190 board; each field can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `AIR_QUEUE_BASE` | `queue_base` |
//! | `AIR_QUEUE_SIZE` | `queue_capacity` |
//! | `AIR_STAGING_BASE` | `staging_base` |
//! | `AIR_STAGING_SIZE` | `staging_size` |
//! | `AIR_MEM_DEVICE` | `mem_device` |
//! | `AIR_NUM_COLUMNS` | `num_columns` |
//!
//! Numbers accept decimal or `0x` hex.

use crate::error::{AirError, Result};
use crate::queue::QueueKind;
use air_packet::layout::{self, MAX_QUEUE_SIZE, MIN_QUEUE_SIZE, QUEUE_ALIGN};
use std::path::PathBuf;
use tracing::debug;

/// VCK190 shared memory base holding the queue.
pub const VCK190_QUEUE_BASE: u64 = 0x0201_0000_0000;

/// VCK190 staging buffer, placed after the queue in the same BRAM.
pub const VCK190_STAGING_BASE: u64 = 0x0201_0001_0000;

/// Staging buffer size mapped by the validation programs.
pub const DEFAULT_STAGING_SIZE: usize = 0x8000;

/// Default queue capacity in slots.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 64;

/// Columns of the VCK190 AI-engine array.
pub const VCK190_NUM_COLUMNS: u8 = 50;

/// Explicit runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Physical base of the queue region (header + slots)
    pub queue_base: u64,
    /// Queue capacity in slots, power of two
    pub queue_capacity: u32,
    /// Producer model recorded in the queue header
    pub queue_kind: QueueKind,
    /// Physical base of the staging buffer
    pub staging_base: u64,
    /// Staging buffer size in bytes
    pub staging_size: usize,
    /// Device file used for physical mappings
    pub mem_device: PathBuf,
    /// Number of fabric columns for device-init
    pub num_columns: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue_base: VCK190_QUEUE_BASE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_kind: QueueKind::SingleProducer,
            staging_base: VCK190_STAGING_BASE,
            staging_size: DEFAULT_STAGING_SIZE,
            mem_device: PathBuf::from("/dev/mem"),
            num_columns: VCK190_NUM_COLUMNS,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `AIR_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but does not parse, or the
    /// resulting configuration fails [`HostConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by an arbitrary key lookup
    ///
    /// # Errors
    ///
    /// Same as [`HostConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("AIR_QUEUE_BASE") {
            cfg.queue_base = parse_number("AIR_QUEUE_BASE", &v)?;
        }
        if let Some(v) = lookup("AIR_QUEUE_SIZE") {
            cfg.queue_capacity = narrow("AIR_QUEUE_SIZE", parse_number("AIR_QUEUE_SIZE", &v)?)?;
        }
        if let Some(v) = lookup("AIR_STAGING_BASE") {
            cfg.staging_base = parse_number("AIR_STAGING_BASE", &v)?;
        }
        if let Some(v) = lookup("AIR_STAGING_SIZE") {
            cfg.staging_size =
                narrow("AIR_STAGING_SIZE", parse_number("AIR_STAGING_SIZE", &v)?)?;
        }
        if let Some(v) = lookup("AIR_MEM_DEVICE") {
            cfg.mem_device = PathBuf::from(v);
        }
        if let Some(v) = lookup("AIR_NUM_COLUMNS") {
            cfg.num_columns = narrow("AIR_NUM_COLUMNS", parse_number("AIR_NUM_COLUMNS", &v)?)?;
        }

        cfg.validate()?;
        debug!("Host configuration: {cfg:?}");
        Ok(cfg)
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`AirError::InvalidConfig`] when the capacity is unsupported,
    /// the queue base is misaligned, the staging buffer is empty, or the
    /// two regions overlap.
    pub fn validate(&self) -> Result<()> {
        let cap = self.queue_capacity;
        if !cap.is_power_of_two() || !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&cap) {
            return Err(AirError::invalid_config(format!(
                "queue capacity {cap} is not a power of two in {MIN_QUEUE_SIZE}..={MAX_QUEUE_SIZE}"
            )));
        }
        if self.queue_base % QUEUE_ALIGN != 0 {
            return Err(AirError::invalid_config(format!(
                "queue base {:#x} is not {QUEUE_ALIGN}-byte aligned",
                self.queue_base
            )));
        }
        if self.staging_size == 0 {
            return Err(AirError::invalid_config("staging buffer size is 0"));
        }
        if self.num_columns == 0 {
            return Err(AirError::invalid_config("fabric has no columns"));
        }

        let queue_end = region_end("queue", self.queue_base, self.queue_region_size())?;
        let staging_end = region_end("staging buffer", self.staging_base, self.staging_size)?;
        if self.queue_base < staging_end && self.staging_base < queue_end {
            return Err(AirError::invalid_config(format!(
                "queue [{:#x}, {queue_end:#x}) overlaps staging buffer [{:#x}, {staging_end:#x})",
                self.queue_base, self.staging_base
            )));
        }
        Ok(())
    }

    /// Bytes occupied by the queue header and slots
    pub const fn queue_region_size(&self) -> usize {
        layout::queue_region_size(self.queue_capacity)
    }

    /// Builder: queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: u32) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Builder: staging buffer size
    #[must_use]
    pub fn with_staging_size(mut self, size: usize) -> Self {
        self.staging_size = size;
        self
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => v.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|e| AirError::invalid_config(format!("{key}={value:?}: {e}")))
}

fn region_end(name: &str, base: u64, size: usize) -> Result<u64> {
    u64::try_from(size)
        .ok()
        .and_then(|size| base.checked_add(size))
        .ok_or_else(|| {
            AirError::invalid_config(format!(
                "{name} at {base:#x} with {size:#x} bytes runs past the address space"
            ))
        })
}

fn narrow<T: TryFrom<u64>>(key: &str, value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| AirError::invalid_config(format!("{key}={value} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        HostConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("AIR_QUEUE_BASE", "0x4000_0000"),
            ("AIR_QUEUE_SIZE", "16"),
            ("AIR_STAGING_BASE", "0x5000_0000"),
            ("AIR_STAGING_SIZE", "0x10000"),
            ("AIR_NUM_COLUMNS", "38"),
        ]
        .into_iter()
        .collect();

        let cfg = HostConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.queue_base, 0x4000_0000);
        assert_eq!(cfg.queue_capacity, 16);
        assert_eq!(cfg.staging_base, 0x5000_0000);
        assert_eq!(cfg.staging_size, 0x10000);
        assert_eq!(cfg.num_columns, 38);
        assert_eq!(cfg.mem_device, PathBuf::from("/dev/mem"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_cap = HostConfig::from_lookup(|k| (k == "AIR_QUEUE_SIZE").then(|| "48".into()));
        assert!(matches!(bad_cap, Err(AirError::InvalidConfig { .. })));

        let garbage = HostConfig::from_lookup(|k| (k == "AIR_QUEUE_BASE").then(|| "zz".into()));
        assert!(matches!(garbage, Err(AirError::InvalidConfig { .. })));

        let cols = HostConfig::from_lookup(|k| (k == "AIR_NUM_COLUMNS").then(|| "300".into()));
        assert!(matches!(cols, Err(AirError::InvalidConfig { .. })));

        let wraps = HostConfig::from_lookup(|k| {
            (k == "AIR_STAGING_BASE").then(|| "0xffffffffffffff00".into())
        });
        assert!(matches!(wraps, Err(AirError::InvalidConfig { .. })));

        let cfg = HostConfig {
            queue_base: u64::MAX - 0x3f,
            ..HostConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AirError::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_overlap() {
        let cfg = HostConfig {
            staging_base: VCK190_QUEUE_BASE + 0x100,
            ..HostConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
