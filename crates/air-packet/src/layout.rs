//! Memory layout shared by host and fabric.
//!
//! A queue region starts with a 64-byte header followed by `capacity`
//! packet slots of 64 bytes each. All fields are little-endian.
//!
//! ```text
//! queue region
//! 0x00 ┌──────────────┬──────────────┐
//!      │ type    u32  │ features u32 │
//! 0x08 ├──────────────┴──────────────┤
//!      │ base_address (slot 0)  u64  │
//! 0x10 │ doorbell               u64  │
//! 0x18 │ size u32     │ reserved u32 │
//! 0x20 │ id                     u64  │
//! 0x28 │ read_index             u64  │
//! 0x30 │ write_index            u64  │
//! 0x38 │ reserved               u64  │
//! 0x40 ├─────────────────────────────┤
//!      │ slot 0 (64 B)               │
//!      │ slot 1 ...                  │
//! ```

use crate::hsa;

/// Size of one packet slot in bytes.
pub const PACKET_SIZE: usize = 64;

/// Number of 64-bit words in a packet slot.
pub const PACKET_WORDS: usize = PACKET_SIZE / 8;

/// Size of the queue header in bytes. Slot 0 starts right after it.
pub const QUEUE_HEADER_SIZE: usize = 64;

/// Required alignment of a queue region base address.
pub const QUEUE_ALIGN: u64 = 64;

/// Smallest supported queue capacity.
pub const MIN_QUEUE_SIZE: u32 = 2;

/// Largest supported queue capacity.
pub const MAX_QUEUE_SIZE: u32 = 1 << 16;

/// Initial value of a completion signal. The consumer stores 0 when done.
pub const SIGNAL_PENDING: u64 = 1;

/// Completion signal value of a finished packet.
pub const SIGNAL_DONE: u64 = 0;

/// Byte offsets of the queue header fields.
pub mod queue {
    /// Queue type (`hsa::QUEUE_TYPE_*`).
    pub const TYPE: usize = 0x00;
    /// Feature bits (`hsa::QUEUE_FEATURE_*`).
    pub const FEATURES: usize = 0x04;
    /// Physical address of slot 0.
    pub const BASE_ADDRESS: usize = 0x08;
    /// Last published write index.
    pub const DOORBELL: usize = 0x10;
    /// Capacity in slots.
    pub const SIZE: usize = 0x18;
    /// Queue identifier.
    pub const ID: usize = 0x20;
    /// Number of packets retired by the consumer.
    pub const READ_INDEX: usize = 0x28;
    /// Number of slots reserved by producers.
    pub const WRITE_INDEX: usize = 0x30;
}

/// Byte offsets of the packet fields.
pub mod packet {
    /// `header:u16 | type:u16 | reserved:u32` word.
    pub const HEADER_WORD: usize = 0x00;
    /// Address the consumer may write results to.
    pub const RETURN_ADDRESS: usize = 0x08;
    /// First of the four argument words.
    pub const ARG0: usize = 0x10;
    /// Completion signal.
    pub const COMPLETION_SIGNAL: usize = 0x38;
}

/// Doorbell value of a queue on which nothing was published yet.
pub const DOORBELL_NONE: u64 = u64::MAX;

/// Byte offset of slot `slot` inside a queue region.
pub const fn slot_offset(slot: u32) -> usize {
    QUEUE_HEADER_SIZE + slot as usize * PACKET_SIZE
}

/// Bytes needed for a queue region of `capacity` slots.
pub const fn queue_region_size(capacity: u32) -> usize {
    slot_offset(capacity)
}

/// One 64-byte packet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchPacket {
    /// HSA packet header (see [`hsa`]).
    pub header: u16,
    /// AIR packet type code.
    pub kind: u16,
    /// Reserved, zero.
    pub reserved0: u32,
    /// Result address, zero when unused.
    pub return_address: u64,
    /// Type-specific arguments.
    pub arg: [u64; 4],
    /// Reserved, zero.
    pub reserved1: u64,
    /// `SIGNAL_PENDING` until the consumer finishes the packet.
    pub completion_signal: u64,
}

impl DispatchPacket {
    /// First word of the record: header, type and reserved field packed.
    pub const fn header_word(&self) -> u64 {
        self.header as u64 | (self.kind as u64) << 16 | (self.reserved0 as u64) << 32
    }

    /// Unpack a header word into `(header, kind, reserved0)`.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn split_header_word(word: u64) -> (u16, u16, u32) {
        (word as u16, (word >> 16) as u16, (word >> 32) as u32)
    }

    /// Record as eight little-endian words.
    pub const fn to_words(&self) -> [u64; PACKET_WORDS] {
        [
            self.header_word(),
            self.return_address,
            self.arg[0],
            self.arg[1],
            self.arg[2],
            self.arg[3],
            self.reserved1,
            self.completion_signal,
        ]
    }

    /// Rebuild a record from eight words.
    pub const fn from_words(words: [u64; PACKET_WORDS]) -> Self {
        let (header, kind, reserved0) = Self::split_header_word(words[0]);
        Self {
            header,
            kind,
            reserved0,
            return_address: words[1],
            arg: [words[2], words[3], words[4], words[5]],
            reserved1: words[6],
            completion_signal: words[7],
        }
    }

    /// Record as 64 raw bytes.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0u8; PACKET_SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Rebuild a record from 64 raw bytes.
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> Self {
        let mut words = [0u64; PACKET_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self::from_words(words)
    }

    /// True once the header has been flipped to agent dispatch.
    pub const fn is_active(&self) -> bool {
        hsa::packet_kind(self.header) == hsa::PACKET_TYPE_AGENT_DISPATCH
    }

    /// Copy of this packet with a published header.
    #[must_use]
    pub const fn activated(mut self) -> Self {
        self.header = hsa::dispatch_header();
        self
    }
}
