//! Error types for AIR host operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for AIR host operations
pub type Result<T> = std::result::Result<T, AirError>;

/// Errors that can occur while driving the command queue
#[derive(Debug, Error)]
pub enum AirError {
    /// Queue capacity is not a supported power of two
    #[error("Unsupported queue capacity {capacity} (need a power of two in {min}..={max})")]
    InvalidCapacity {
        /// Requested capacity
        capacity: u32,
        /// Smallest supported capacity
        min: u32,
        /// Largest supported capacity
        max: u32,
    },

    /// Base address unusable for the requested object
    #[error("Invalid address {address:#x}: {reason}")]
    InvalidAddress {
        /// Offending physical address
        address: u64,
        /// Why it was rejected
        reason: String,
    },

    /// Mapping a memory region failed
    #[error("Failed to map {path}: {reason}")]
    MapFailed {
        /// Device or file that was mapped
        path: PathBuf,
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Access outside a mapped region
    #[error("Out of bounds access: offset={offset:#x}, len={len}, limit={limit:#x}")]
    OutOfBounds {
        /// Byte offset of the access
        offset: usize,
        /// Access length in bytes
        len: usize,
        /// Region size
        limit: usize,
    },

    /// Slot still holds a packet the consumer has not retired
    #[error("Slot for write index {index} still in flight (read index {read_index}, capacity {capacity})")]
    SlotInFlight {
        /// Write index that was requested
        index: u64,
        /// Consumer read index
        read_index: u64,
        /// Queue capacity
        capacity: u32,
    },

    /// Packet record could not be decoded
    #[error("Packet {index} does not decode: {source}")]
    Decode {
        /// Write index of the packet
        index: u64,
        /// Decoder error
        source: air_packet::DecodeError,
    },

    /// A reserved slot was left unwritten because waiting for it failed
    #[error("Packet {index} reserved but not written: {source}")]
    Unwritten {
        /// Reserved write index, still to be written
        index: u64,
        /// Why the wait gave up
        source: Box<AirError>,
    },

    /// Wait exceeded its deadline
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Wait was cancelled through its token
    #[error("Wait cancelled")]
    Cancelled,

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong
        reason: String,
    },

    /// Object is in a state that does not allow the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

impl AirError {
    /// Create an invalid address error
    pub fn invalid_address(address: u64, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address,
            reason: reason.into(),
        }
    }

    /// Create a map failed error
    pub fn map_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MapFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }
}
