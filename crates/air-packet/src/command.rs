//! Semantic commands and their packet encoding.
//!
//! Each [`Command`] variant carries only the fields its packet kind needs.
//! [`Command::encode`] produces a pending [`DispatchPacket`] (header
//! `INVALID`, completion signal pending); publishing it is the dispatcher's
//! job. [`Command::decode`] is the consumer half of the contract.
//!
//! ## Argument words
//!
//! ```text
//! herd-init   arg0 = range<<48 | cols<<40 | col<<32 | rows<<24 | row<<16
//!             arg1 = herd_id
//! device-init arg0 = num_cols
//! nd-memcpy   arg0 = dir<<60 | burst<<52 | col<<32 | chan<<24 | space<<16 | herd_id
//!             arg1 = base address
//!             arg2 = stride1<<48 | count1<<32 | dim0_bytes
//!             arg3 = stride3<<48 | count3<<32 | stride2<<16 | count2
//! ```

use crate::hsa;
use crate::layout::{DispatchPacket, SIGNAL_PENDING};
use crate::nd::{Chunks, Dim};
use std::fmt;

/// AIR packet type codes.
pub mod kind {
    /// Initialise shim tiles for a column range.
    pub const DEVICE_INITIALIZE: u16 = 0x0010;
    /// Declare a herd (rectangular tile region).
    pub const HERD_INITIALIZE: u16 = 0x0011;
    /// Strided N-D memory copy through a shim DMA channel.
    pub const ND_MEMCPY: u16 = 0x0103;
}

/// Herd-init addressing mode: coordinates are absolute fabric positions.
pub const ADDRESS_ABSOLUTE_RANGE: u8 = 0x1;

/// Burst length used by the shipped validation programs.
pub const DEFAULT_BURST_LEN: u8 = 4;

/// Memory space tag used by the shipped validation programs.
pub const DEFAULT_MEMORY_SPACE: u8 = 2;

/// Transfer direction of an nd-memcpy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Tile to host memory (S2MM on the shim).
    DeviceToHost = 0,
    /// Host memory to tile (MM2S on the shim).
    HostToDevice = 1,
}

impl Direction {
    /// Wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::DeviceToHost),
            1 => Some(Self::HostToDevice),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceToHost => write!(f, "device->host"),
            Self::HostToDevice => write!(f, "host->device"),
        }
    }
}

/// Declare a rectangular region of tiles as herd `herd_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HerdInit {
    /// Herd identifier referenced by later packets.
    pub herd_id: u16,
    /// First column of the region.
    pub start_column: u8,
    /// Number of columns.
    pub num_columns: u8,
    /// First row of the region.
    pub start_row: u8,
    /// Number of rows.
    pub num_rows: u8,
}

/// Initialise the shim tiles of `num_columns` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInit {
    /// Number of fabric columns.
    pub num_columns: u8,
}

/// Four-level strided copy between host memory and a shim DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdMemcpy {
    /// Herd the transfer belongs to.
    pub herd_id: u16,
    /// Shim column carrying the transfer.
    pub column: u8,
    /// DMA channel on that column.
    pub channel: u8,
    /// Copy direction.
    pub direction: Direction,
    /// Burst length hint for the DMA engine (4 bits).
    pub burst_len: u8,
    /// Opaque memory space tag.
    pub memory_space: u8,
    /// Physical base address in host-visible memory.
    pub address: u64,
    /// Contiguous bytes per innermost step.
    pub dim0_bytes: u32,
    /// Outer dimensions, innermost first.
    pub dims: [Dim; 3],
}

impl NdMemcpy {
    /// Single contiguous run of `len` bytes.
    pub const fn contiguous(
        herd_id: u16,
        column: u8,
        channel: u8,
        direction: Direction,
        address: u64,
        len: u32,
    ) -> Self {
        Self {
            herd_id,
            column,
            channel,
            direction,
            burst_len: DEFAULT_BURST_LEN,
            memory_space: DEFAULT_MEMORY_SPACE,
            address,
            dim0_bytes: len,
            dims: [Dim::UNIT; 3],
        }
    }

    /// Replace the three outer dimensions.
    #[must_use]
    pub const fn with_dims(mut self, dim1: Dim, dim2: Dim, dim3: Dim) -> Self {
        self.dims = [dim1, dim2, dim3];
        self
    }

    /// Replace burst length and memory space.
    #[must_use]
    pub const fn with_burst(mut self, burst_len: u8, memory_space: u8) -> Self {
        self.burst_len = burst_len;
        self.memory_space = memory_space;
        self
    }

    /// Contiguous runs in streaming order.
    pub fn chunks(&self) -> Chunks {
        Chunks::new(self.address, self.dim0_bytes, self.dims)
    }

    /// Total bytes moved.
    pub fn total_bytes(&self) -> u64 {
        self.dims
            .iter()
            .map(Dim::effective_count)
            .product::<u64>()
            * u64::from(self.dim0_bytes)
    }

    /// One past the highest byte touched, relative to `address`.
    pub fn extent_bytes(&self) -> u64 {
        if self.dim0_bytes == 0 {
            return 0;
        }
        let last = self
            .dims
            .iter()
            .map(|d| (d.effective_count() - 1) * u64::from(d.stride))
            .sum::<u64>();
        last + u64::from(self.dim0_bytes)
    }
}

/// A command the host can place in a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Herd initialisation.
    HerdInit(HerdInit),
    /// Device (shim) initialisation.
    DeviceInit(DeviceInit),
    /// Strided memory copy.
    NdMemcpy(NdMemcpy),
}

impl Command {
    /// AIR type code of this command.
    pub const fn kind_code(&self) -> u16 {
        match self {
            Self::HerdInit(_) => kind::HERD_INITIALIZE,
            Self::DeviceInit(_) => kind::DEVICE_INITIALIZE,
            Self::NdMemcpy(_) => kind::ND_MEMCPY,
        }
    }

    /// Pending packet record for this command.
    pub fn encode(&self) -> DispatchPacket {
        let mut pkt = DispatchPacket {
            header: hsa::pending_header(),
            kind: self.kind_code(),
            completion_signal: SIGNAL_PENDING,
            ..DispatchPacket::default()
        };
        match *self {
            Self::HerdInit(h) => {
                pkt.arg[0] = u64::from(ADDRESS_ABSOLUTE_RANGE) << 48
                    | u64::from(h.num_columns) << 40
                    | u64::from(h.start_column) << 32
                    | u64::from(h.num_rows) << 24
                    | u64::from(h.start_row) << 16;
                pkt.arg[1] = u64::from(h.herd_id);
            }
            Self::DeviceInit(d) => {
                pkt.arg[0] = u64::from(d.num_columns);
            }
            Self::NdMemcpy(m) => {
                let [d1, d2, d3] = m.dims;
                pkt.arg[0] = u64::from(m.direction.code() & 0xF) << 60
                    | u64::from(m.burst_len & 0xF) << 52
                    | u64::from(m.column) << 32
                    | u64::from(m.channel) << 24
                    | u64::from(m.memory_space) << 16
                    | u64::from(m.herd_id);
                pkt.arg[1] = m.address;
                pkt.arg[2] = u64::from(d1.stride) << 48
                    | u64::from(d1.count) << 32
                    | u64::from(m.dim0_bytes);
                pkt.arg[3] = u64::from(d3.stride) << 48
                    | u64::from(d3.count) << 32
                    | u64::from(d2.stride) << 16
                    | u64::from(d2.count);
            }
        }
        pkt
    }

    /// Recover the command carried by a packet record.
    ///
    /// The header is not inspected; callers decide whether the slot is live.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for unknown type codes and malformed fields.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(pkt: &DispatchPacket) -> Result<Self, DecodeError> {
        let a = pkt.arg;
        match pkt.kind {
            kind::HERD_INITIALIZE => {
                let range = (a[0] >> 48) as u8;
                if range != ADDRESS_ABSOLUTE_RANGE {
                    return Err(DecodeError::UnsupportedAddressRange(range));
                }
                Ok(Self::HerdInit(HerdInit {
                    herd_id: a[1] as u16,
                    start_column: (a[0] >> 32) as u8,
                    num_columns: (a[0] >> 40) as u8,
                    start_row: (a[0] >> 16) as u8,
                    num_rows: (a[0] >> 24) as u8,
                }))
            }
            kind::DEVICE_INITIALIZE => Ok(Self::DeviceInit(DeviceInit {
                num_columns: a[0] as u8,
            })),
            kind::ND_MEMCPY => {
                let dir = (a[0] >> 60) as u8;
                let direction =
                    Direction::from_code(dir).ok_or(DecodeError::InvalidDirection(dir))?;
                Ok(Self::NdMemcpy(NdMemcpy {
                    herd_id: a[0] as u16,
                    column: (a[0] >> 32) as u8,
                    channel: (a[0] >> 24) as u8,
                    direction,
                    burst_len: ((a[0] >> 52) & 0xF) as u8,
                    memory_space: (a[0] >> 16) as u8,
                    address: a[1],
                    dim0_bytes: a[2] as u32,
                    dims: [
                        Dim::new((a[2] >> 32) as u16, (a[2] >> 48) as u16),
                        Dim::new(a[3] as u16, (a[3] >> 16) as u16),
                        Dim::new((a[3] >> 32) as u16, (a[3] >> 48) as u16),
                    ],
                }))
            }
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HerdInit(h) => write!(
                f,
                "herd-init herd={} cols={}+{} rows={}+{}",
                h.herd_id, h.start_column, h.num_columns, h.start_row, h.num_rows
            ),
            Self::DeviceInit(d) => write!(f, "device-init cols={}", d.num_columns),
            Self::NdMemcpy(m) => write!(
                f,
                "nd-memcpy {} col={} ch={} addr={:#x} bytes={}",
                m.direction,
                m.column,
                m.channel,
                m.address,
                m.total_bytes()
            ),
        }
    }
}

/// Packet record that does not decode to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Type code not understood by this consumer.
    UnknownType(u16),
    /// nd-memcpy direction nibble is neither 0 nor 1.
    InvalidDirection(u8),
    /// herd-init uses an addressing mode other than absolute.
    UnsupportedAddressRange(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown packet type {t:#06x}"),
            Self::InvalidDirection(d) => write!(f, "invalid nd-memcpy direction {d}"),
            Self::UnsupportedAddressRange(r) => {
                write!(f, "unsupported herd address range {r:#x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_herd_init_words() {
        let pkt = Command::HerdInit(HerdInit {
            herd_id: 0,
            start_column: 7,
            num_columns: 2,
            start_row: 0,
            num_rows: 5,
        })
        .encode();
        assert_eq!(pkt.kind, kind::HERD_INITIALIZE);
        assert_eq!(pkt.arg[0], 0x0001_0207_0500_0000);
        assert_eq!(pkt.arg[1], 0);
        assert_eq!(pkt.completion_signal, SIGNAL_PENDING);
        assert!(!pkt.is_active());
    }

    #[test]
    fn test_device_init_words() {
        let pkt = Command::DeviceInit(DeviceInit { num_columns: 50 }).encode();
        assert_eq!(pkt.kind, kind::DEVICE_INITIALIZE);
        assert_eq!(pkt.arg[0], 50);
    }

    #[test]
    fn test_nd_memcpy_words_match_tiled_image_transfer() {
        // 16x8 tiles out of a 128x16 image of u32
        let m = NdMemcpy::contiguous(0, 7, 1, Direction::HostToDevice, 0x8000_0000, 16 * 4)
            .with_dims(Dim::new(8, 128 * 4), Dim::new(8, 16 * 4), Dim::new(2, 128 * 8 * 4));
        let pkt = Command::NdMemcpy(m).encode();
        assert_eq!(pkt.arg[0] >> 60, 1);
        assert_eq!((pkt.arg[0] >> 52) & 0xF, 4);
        assert_eq!((pkt.arg[0] >> 32) & 0xFF, 7);
        assert_eq!((pkt.arg[0] >> 24) & 0xFF, 1);
        assert_eq!((pkt.arg[0] >> 16) & 0xFF, 2);
        assert_eq!(pkt.arg[1], 0x8000_0000);
        assert_eq!(pkt.arg[2], (512u64 << 48) | (8 << 32) | 64);
        assert_eq!(pkt.arg[3], (4096u64 << 48) | (2 << 32) | (64 << 16) | 8);
        assert_eq!(m.total_bytes(), 128 * 16 * 4);
        assert_eq!(m.extent_bytes(), 128 * 16 * 4);
    }

    #[test]
    fn test_decode_recovers_each_variant() {
        let cmds = [
            Command::HerdInit(HerdInit {
                herd_id: 3,
                start_column: 7,
                num_columns: 1,
                start_row: 0,
                num_rows: 3,
            }),
            Command::DeviceInit(DeviceInit { num_columns: 50 }),
            Command::NdMemcpy(
                NdMemcpy::contiguous(0, 11, 0, Direction::DeviceToHost, 0x1234_5000, 128)
                    .with_burst(2, 1),
            ),
        ];
        for cmd in cmds {
            assert_eq!(Command::decode(&cmd.encode()), Ok(cmd));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut pkt = DispatchPacket {
            kind: 0x7777,
            ..Default::default()
        };
        assert_eq!(Command::decode(&pkt), Err(DecodeError::UnknownType(0x7777)));

        pkt.kind = kind::ND_MEMCPY;
        pkt.arg[0] = 5 << 60;
        assert_eq!(Command::decode(&pkt), Err(DecodeError::InvalidDirection(5)));

        pkt.kind = kind::HERD_INITIALIZE;
        pkt.arg[0] = 0;
        assert_eq!(
            Command::decode(&pkt),
            Err(DecodeError::UnsupportedAddressRange(0))
        );
    }

    #[test]
    fn test_extent_of_contiguous_copy() {
        let m = NdMemcpy::contiguous(0, 18, 1, Direction::HostToDevice, 0, 128);
        assert_eq!(m.total_bytes(), 128);
        assert_eq!(m.extent_bytes(), 128);
        assert_eq!(m.chunks().collect::<Vec<_>>(), vec![(0, 128)]);
    }
}
