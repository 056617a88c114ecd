//! Tile-side model used by the software fabric
//!
//! Tiles are opaque apart from what the queue protocol can observe: named
//! word buffers guarded by a full/empty lock, the routes that connect a shim
//! DMA port to a cycle of buffers, and optional kernels that consume full
//! input buffers and fill output buffers.
//!
//! ```text
//! host ──MM2S(col,ch)──► route ──► [ping, pong, ping, ...] ──► kernel
//! host ◄──S2MM(col,ch)── route ◄── [ping, pong, ...]       ◄──┘
//! ```

use crate::error::{AirError, Result};
use air_packet::Direction;
use std::collections::HashMap;
use std::fmt;

/// One shim DMA endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaPort {
    /// Shim column
    pub column: u8,
    /// Channel on that column
    pub channel: u8,
    /// Stream direction
    pub direction: Direction,
}

impl DmaPort {
    /// Build a port
    pub const fn new(column: u8, channel: u8, direction: Direction) -> Self {
        Self {
            column,
            channel,
            direction,
        }
    }
}

impl fmt::Display for DmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.direction {
            Direction::HostToDevice => "MM2S",
            Direction::DeviceToHost => "S2MM",
        };
        write!(f, "col{}/{kind}{}", self.column, self.channel)
    }
}

/// Word buffer in tile memory with a full/empty lock
#[derive(Debug, Clone)]
pub struct TileBuffer {
    name: String,
    words: Vec<u32>,
    full: bool,
    cursor: usize,
}

impl TileBuffer {
    /// Buffer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Contents
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Mutable contents
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Lock state: true while holding data not yet consumed
    pub const fn is_full(&self) -> bool {
        self.full
    }

    /// Size in bytes
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }
}

/// Named tile buffers, shared by DMA routes and kernels
#[derive(Debug, Default)]
pub struct TileBuffers {
    buffers: Vec<TileBuffer>,
    by_name: HashMap<String, usize>,
}

impl TileBuffers {
    fn id(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| AirError::invalid_config(format!("no tile buffer named {name:?}")))
    }

    /// Buffer by name
    pub fn get(&self, name: &str) -> Option<&TileBuffer> {
        self.by_name.get(name).map(|&i| &self.buffers[i])
    }

    /// Mutable buffer by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TileBuffer> {
        self.by_name.get(name).map(|&i| &mut self.buffers[i])
    }

    /// Lock state of a buffer; unknown names read as empty
    pub fn is_full(&self, name: &str) -> bool {
        self.get(name).is_some_and(TileBuffer::is_full)
    }

    /// Set the lock state of a buffer
    ///
    /// # Errors
    ///
    /// Returns error if no buffer has that name.
    pub fn set_full(&mut self, name: &str, full: bool) -> Result<()> {
        let id = self.id(name)?;
        let buf = &mut self.buffers[id];
        buf.full = full;
        buf.cursor = 0;
        Ok(())
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True if no buffer is declared
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Per-tile compute hook run by the software fabric
///
/// `step` is called whenever the fabric is polled. It should consume full
/// input buffers and fill output buffers, flipping their locks, and return
/// true if it changed anything.
pub trait TileKernel: fmt::Debug + Send {
    /// Kernel name for logs
    fn name(&self) -> &str;

    /// Make progress if inputs are available
    fn step(&mut self, buffers: &mut TileBuffers) -> bool;
}

#[derive(Debug)]
struct Route {
    buffers: Vec<usize>,
    next: usize,
}

impl Route {
    fn current(&self) -> usize {
        self.buffers[self.next]
    }

    fn advance(&mut self) {
        self.next = (self.next + 1) % self.buffers.len();
    }
}

/// Buffers, routes and kernels of the tiles behind the shim
#[derive(Debug, Default)]
pub struct TileArray {
    buffers: TileBuffers,
    routes: HashMap<DmaPort, Route>,
    kernels: Vec<Box<dyn TileKernel>>,
}

impl TileArray {
    /// Empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every buffer, route and kernel
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Declare a buffer of `words` 32-bit words, zeroed and empty
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or `words` is 0.
    pub fn add_buffer(&mut self, name: &str, words: usize) -> Result<()> {
        if words == 0 {
            return Err(AirError::invalid_config(format!(
                "tile buffer {name:?} has no storage"
            )));
        }
        if self.buffers.by_name.contains_key(name) {
            return Err(AirError::invalid_config(format!(
                "tile buffer {name:?} declared twice"
            )));
        }
        let id = self.buffers.buffers.len();
        self.buffers.buffers.push(TileBuffer {
            name: name.to_string(),
            words: vec![0; words],
            full: false,
            cursor: 0,
        });
        self.buffers.by_name.insert(name.to_string(), id);
        tracing::trace!("Tile buffer {name} ({words} words)");
        Ok(())
    }

    /// Connect `port` to a cycle of buffers, used in order
    ///
    /// # Errors
    ///
    /// Returns error if `buffers` is empty or names an unknown buffer.
    pub fn route(&mut self, port: DmaPort, buffers: &[&str]) -> Result<()> {
        if buffers.is_empty() {
            return Err(AirError::invalid_config(format!("route {port} has no buffers")));
        }
        let ids = buffers
            .iter()
            .map(|name| self.buffers.id(name))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!("Route {port} -> {buffers:?}");
        self.routes.insert(port, Route { buffers: ids, next: 0 });
        Ok(())
    }

    /// True if `port` has a route
    pub fn has_route(&self, port: &DmaPort) -> bool {
        self.routes.contains_key(port)
    }

    /// Register a kernel
    pub fn add_kernel(&mut self, kernel: Box<dyn TileKernel>) {
        tracing::debug!("Tile kernel {}", kernel.name());
        self.kernels.push(kernel);
    }

    /// Read word `index` of buffer `name`
    ///
    /// # Errors
    ///
    /// Returns error for unknown names or indices past the end.
    pub fn read_buffer(&self, name: &str, index: usize) -> Result<u32> {
        let buf = &self.buffers.buffers[self.buffers.id(name)?];
        buf.words.get(index).copied().ok_or(AirError::OutOfBounds {
            offset: index * 4,
            len: 4,
            limit: buf.byte_len(),
        })
    }

    /// Write word `index` of buffer `name`; the lock state is untouched
    ///
    /// # Errors
    ///
    /// Returns error for unknown names or indices past the end.
    pub fn write_buffer(&mut self, name: &str, index: usize, value: u32) -> Result<()> {
        let id = self.buffers.id(name)?;
        let buf = &mut self.buffers.buffers[id];
        let limit = buf.byte_len();
        let slot = buf.words.get_mut(index).ok_or(AirError::OutOfBounds {
            offset: index * 4,
            len: 4,
            limit,
        })?;
        *slot = value;
        Ok(())
    }

    /// Buffer table
    pub fn buffers(&self) -> &TileBuffers {
        &self.buffers
    }

    /// Mutable buffer table
    pub fn buffers_mut(&mut self) -> &mut TileBuffers {
        &mut self.buffers
    }

    /// Move up to `len` bytes between `host` and the current buffer of `port`
    ///
    /// `host` is the host-memory side of the transfer. Returns bytes moved;
    /// 0 means the port is stalled on its buffer lock.
    pub(crate) fn stream(&mut self, port: DmaPort, host: &mut [u8]) -> Result<usize> {
        let route = self
            .routes
            .get_mut(&port)
            .ok_or_else(|| AirError::invalid_state(format!("no route for {port}")))?;
        let buf = &mut self.buffers.buffers[route.current()];

        let ready = match port.direction {
            Direction::HostToDevice => !buf.full,
            Direction::DeviceToHost => buf.full,
        };
        if !ready {
            return Ok(0);
        }

        let end = buf.byte_len();
        let n = host.len().min(end - buf.cursor);
        let range = buf.cursor..buf.cursor + n;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buf.words.as_mut_slice());
        match port.direction {
            Direction::HostToDevice => bytes[range].copy_from_slice(&host[..n]),
            Direction::DeviceToHost => host[..n].copy_from_slice(&bytes[range]),
        }
        buf.cursor += n;

        if buf.cursor == end {
            buf.cursor = 0;
            buf.full = port.direction == Direction::HostToDevice;
            tracing::trace!(
                "{port}: {} {}",
                buf.name,
                if buf.full { "filled" } else { "drained" }
            );
            route.advance();
        }
        Ok(n)
    }

    /// Run every kernel once; true if any made progress
    pub(crate) fn run_kernels(&mut self) -> bool {
        let mut progressed = false;
        for kernel in &mut self.kernels {
            if kernel.step(&mut self.buffers) {
                tracing::trace!("Kernel {} stepped", kernel.name());
                progressed = true;
            }
        }
        progressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IN: DmaPort = DmaPort::new(7, 0, Direction::HostToDevice);
    const OUT: DmaPort = DmaPort::new(7, 0, Direction::DeviceToHost);

    fn ping_pong() -> TileArray {
        let mut tiles = TileArray::new();
        tiles.add_buffer("ping", 4).unwrap();
        tiles.add_buffer("pong", 4).unwrap();
        tiles.route(IN, &["ping", "pong"]).unwrap();
        tiles.route(OUT, &["ping", "pong"]).unwrap();
        tiles
    }

    #[test]
    fn test_fill_cycles_buffers_and_stalls_when_full() {
        let mut tiles = ping_pong();
        let mut src: Vec<u8> = (0u8..48).collect();

        assert_eq!(tiles.stream(IN, &mut src[..16]).unwrap(), 16);
        assert_eq!(tiles.stream(IN, &mut src[16..32]).unwrap(), 16);
        assert!(tiles.buffers().is_full("ping"));
        assert!(tiles.buffers().is_full("pong"));
        // both full: stalled
        assert_eq!(tiles.stream(IN, &mut src[32..]).unwrap(), 0);

        assert_eq!(tiles.read_buffer("pong", 0).unwrap(), u32::from_le_bytes([16, 17, 18, 19]));
    }

    #[test]
    fn test_drain_waits_for_full_and_keeps_data() {
        let mut tiles = ping_pong();
        let mut dst = [0u8; 16];
        assert_eq!(tiles.stream(OUT, &mut dst).unwrap(), 0);

        let mut src = [0xAAu8; 16];
        tiles.stream(IN, &mut src).unwrap();
        // partial drain keeps the lock until the buffer is exhausted
        assert_eq!(tiles.stream(OUT, &mut dst[..8]).unwrap(), 8);
        assert!(tiles.buffers().is_full("ping"));
        assert_eq!(tiles.stream(OUT, &mut dst[8..]).unwrap(), 8);
        assert!(!tiles.buffers().is_full("ping"));
        assert_eq!(dst, [0xAA; 16]);
        assert_eq!(tiles.read_buffer("ping", 3).unwrap(), 0xAAAA_AAAA);
    }

    #[test]
    fn test_accessors_and_config_errors() {
        let mut tiles = ping_pong();
        tiles.write_buffer("ping", 2, 0xdead_beef).unwrap();
        assert_eq!(tiles.read_buffer("ping", 2).unwrap(), 0xdead_beef);
        assert!(!tiles.buffers().is_full("ping"));

        assert!(tiles.read_buffer("ping", 4).is_err());
        assert!(tiles.write_buffer("nope", 0, 0).is_err());
        assert!(tiles.add_buffer("ping", 4).is_err());
        assert!(tiles.add_buffer("empty", 0).is_err());
        assert!(tiles.route(DmaPort::new(1, 1, Direction::HostToDevice), &[]).is_err());
        assert!(tiles.route(DmaPort::new(1, 1, Direction::HostToDevice), &["nope"]).is_err());
        assert!(tiles
            .stream(DmaPort::new(9, 0, Direction::HostToDevice), &mut [0; 4])
            .is_err());
    }

    #[derive(Debug)]
    struct Doubler;

    impl TileKernel for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn step(&mut self, buffers: &mut TileBuffers) -> bool {
            if !buffers.is_full("ping") || buffers.is_full("pong") {
                return false;
            }
            let input = buffers.get("ping").map(|b| b.words().to_vec()).unwrap_or_default();
            if let Some(out) = buffers.get_mut("pong") {
                for (o, i) in out.words_mut().iter_mut().zip(input) {
                    *o = i * 2;
                }
            }
            buffers.set_full("ping", false).is_ok() && buffers.set_full("pong", true).is_ok()
        }
    }

    #[test]
    fn test_kernel_consumes_and_produces() {
        let mut tiles = TileArray::new();
        tiles.add_buffer("ping", 2).unwrap();
        tiles.add_buffer("pong", 2).unwrap();
        tiles.add_kernel(Box::new(Doubler));
        assert!(!tiles.run_kernels());

        tiles.write_buffer("ping", 0, 21).unwrap();
        tiles.buffers_mut().set_full("ping", true).unwrap();
        assert!(tiles.run_kernels());
        assert_eq!(tiles.read_buffer("pong", 0).unwrap(), 42);
        assert!(tiles.buffers().is_full("pong"));
        assert!(!tiles.run_kernels());
    }
}
