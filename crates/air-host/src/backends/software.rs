// SPDX-License-Identifier: AGPL-3.0-only

//! Software fabric
//!
//! A conformant queue consumer running on a host thread, so the protocol and
//! both validation programs run without a board:
//!
//! 1. **Fetch**: follow the doorbell, read each published packet in order.
//! 2. **Execute**: herd-init and device-init complete at once; nd-memcpy
//!    packets queue on the FIFO of their DMA port `(column, channel,
//!    direction)`. Only the head of each FIFO streams, and it stalls on tile
//!    buffer locks exactly like a shim DMA would.
//! 3. **Retire**: strictly in submission order. A packet finished early
//!    waits for everything before it, so waiting on packet N implies every
//!    packet below N is done.
//!
//! A packet that cannot run (bad type, address outside host memory, no
//! route for its port) is logged once and never completes.
//!
//! ```text
//!  queue ──fetch──► decode ──► port FIFOs ──stream──► TileArray ◄── kernels
//!    ▲                                                   │
//!    └────────────────── retire (in order) ◄─────────────┘
//! ```

use super::tiles::{DmaPort, TileArray};
use crate::error::{AirError, Result};
use crate::memory::SharedMemory;
use crate::queue::ConsumerPort;
use air_packet::{Chunks, Command, DispatchPacket, Direction, HerdInit};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Idle sleep between polls when nothing moved
const IDLE_PARK: Duration = Duration::from_micros(100);

/// Largest single copy between host memory and a tile buffer
const SCRATCH_BYTES: usize = 4096;

/// Host memory regions the fabric may address, by physical address
#[derive(Debug, Clone, Default)]
pub struct HostMemoryMap {
    regions: Vec<Arc<SharedMemory>>,
}

impl HostMemoryMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a region
    #[must_use]
    pub fn with_region(mut self, region: Arc<SharedMemory>) -> Self {
        self.regions.push(region);
        self
    }

    /// Region and offset holding `[address, address + len)`
    ///
    /// # Errors
    ///
    /// Returns [`AirError::InvalidAddress`] if no single region holds the range.
    pub fn resolve(&self, address: u64, len: usize) -> Result<(&SharedMemory, usize)> {
        self.regions
            .iter()
            .find(|r| r.contains(address, len))
            .map(|r| Ok((r.as_ref(), r.offset_of(address, len)?)))
            .unwrap_or_else(|| {
                Err(AirError::invalid_address(
                    address,
                    format!("{len} bytes outside host memory"),
                ))
            })
    }
}

/// Packet the fabric gave up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Write index of the packet
    pub index: u64,
    /// What went wrong
    pub reason: String,
}

/// Observable fabric state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricStatus {
    /// Herds declared by herd-init, latest per id
    pub herds: Vec<HerdInit>,
    /// Column count of the last device-init
    pub device_columns: Option<u8>,
    /// Packets retired
    pub retired: u64,
    /// Bytes moved by DMA
    pub bytes_moved: u64,
    /// Packets that will never complete
    pub faults: Vec<Fault>,
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    tiles: Mutex<TileArray>,
    status: Mutex<FabricStatus>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running software fabric
///
/// Dropping the handle stops and joins the consumer thread.
#[derive(Debug)]
pub struct SoftwareFabric {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SoftwareFabric {
    /// Attach to the queue in `queue_memory` and start consuming
    ///
    /// `host` lists the regions nd-memcpy addresses may point into.
    ///
    /// # Errors
    ///
    /// Returns error if the queue header is unusable or the thread cannot
    /// be spawned.
    pub fn spawn(queue_memory: Arc<SharedMemory>, host: HostMemoryMap) -> Result<Self> {
        Self::spawn_with_tiles(queue_memory, host, TileArray::new())
    }

    /// Same as [`SoftwareFabric::spawn`] with a preconfigured tile array
    ///
    /// # Errors
    ///
    /// See [`SoftwareFabric::spawn`].
    pub fn spawn_with_tiles(
        queue_memory: Arc<SharedMemory>,
        host: HostMemoryMap,
        tiles: TileArray,
    ) -> Result<Self> {
        let port = ConsumerPort::attach(queue_memory)?;
        let next = port.read_index()?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            tiles: Mutex::new(tiles),
            status: Mutex::new(FabricStatus::default()),
        });

        let mut consumer = Consumer {
            port,
            host,
            shared: Arc::clone(&shared),
            next_fetch: next,
            inflight: VecDeque::new(),
            engines: HashMap::new(),
            scratch: vec![0; SCRATCH_BYTES],
        };
        let thread = std::thread::Builder::new()
            .name("air-fabric".into())
            .spawn(move || consumer.run())?;

        info!("Software fabric started at packet {next}");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Lock the tile array for configuration or inspection
    pub fn tiles(&self) -> MutexGuard<'_, TileArray> {
        lock(&self.shared.tiles)
    }

    /// Snapshot of the fabric state
    pub fn status(&self) -> FabricStatus {
        lock(&self.shared.status).clone()
    }

    /// True while the consumer thread is alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Nudge the consumer out of its idle sleep
    pub fn wake(&self) {
        if let Some(t) = &self.thread {
            t.thread().unpark();
        }
    }

    /// Stop the consumer thread and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            t.thread().unpark();
            if t.join().is_err() {
                error!("Software fabric thread panicked");
            }
            debug!("Software fabric stopped");
        }
    }
}

impl Drop for SoftwareFabric {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Running,
    Done,
    Faulted,
}

#[derive(Debug)]
struct Transfer {
    index: u64,
    port: DmaPort,
    chunks: Chunks,
    /// Unfinished part of the current run
    run: Option<(u64, u32)>,
}

struct Consumer {
    port: ConsumerPort,
    host: HostMemoryMap,
    shared: Arc<Shared>,
    next_fetch: u64,
    /// Fetched, not retired, in index order
    inflight: VecDeque<(u64, SlotState)>,
    engines: HashMap<DmaPort, VecDeque<Transfer>>,
    scratch: Vec<u8>,
}

impl Consumer {
    fn run(&mut self) {
        while !self.shared.stop.load(Ordering::Acquire) {
            match self.poll() {
                Ok(true) => {}
                Ok(false) => std::thread::park_timeout(IDLE_PARK),
                Err(e) => {
                    error!("Software fabric stopped on queue error: {e}");
                    return;
                }
            }
        }
    }

    /// One pass over fetch, execute and retire; true if anything moved
    fn poll(&mut self) -> Result<bool> {
        let fetched = self.fetch()?;
        let moved = self.execute();
        let retired = self.retire()?;
        Ok(fetched || moved || retired)
    }

    fn fetch(&mut self) -> Result<bool> {
        let published = self.port.published()?;
        let mut any = false;
        while self.next_fetch < published {
            let index = self.next_fetch;
            let Some(pkt) = self.port.fetch(index)? else {
                break;
            };
            let state = self.accept(index, &pkt);
            self.inflight.push_back((index, state));
            self.next_fetch += 1;
            any = true;
        }
        Ok(any)
    }

    fn accept(&mut self, index: u64, pkt: &DispatchPacket) -> SlotState {
        let command = match Command::decode(pkt) {
            Ok(c) => c,
            Err(source) => return self.fault(index, &AirError::Decode { index, source }),
        };
        trace!("Fabric [{index}] {command}");

        match command {
            Command::HerdInit(h) => {
                info!(
                    "Herd {} at col {} x{} row {} x{}",
                    h.herd_id, h.start_column, h.num_columns, h.start_row, h.num_rows
                );
                let mut status = lock(&self.shared.status);
                status.herds.retain(|old| old.herd_id != h.herd_id);
                status.herds.push(h);
                SlotState::Done
            }
            Command::DeviceInit(d) => {
                info!("Device init: {} shim columns", d.num_columns);
                lock(&self.shared.status).device_columns = Some(d.num_columns);
                SlotState::Done
            }
            Command::NdMemcpy(m) => {
                let port = DmaPort::new(m.column, m.channel, m.direction);
                if !lock(&self.shared.tiles).has_route(&port) {
                    return self.fault(index, &AirError::invalid_state(format!("no route for {port}")));
                }
                let extent = usize::try_from(m.extent_bytes()).unwrap_or(usize::MAX);
                if let Err(e) = self.host.resolve(m.address, extent) {
                    return self.fault(index, &e);
                }
                if m.total_bytes() == 0 {
                    return SlotState::Done;
                }
                self.engines.entry(port).or_default().push_back(Transfer {
                    index,
                    port,
                    chunks: m.chunks(),
                    run: None,
                });
                SlotState::Running
            }
        }
    }

    fn fault(&self, index: u64, err: &AirError) -> SlotState {
        error!("Packet {index} faulted, it will not complete: {err}");
        lock(&self.shared.status).faults.push(Fault {
            index,
            reason: err.to_string(),
        });
        SlotState::Faulted
    }

    /// Advance the head transfer of every port, then the kernels
    fn execute(&mut self) -> bool {
        let mut finished = Vec::new();
        let mut failed = Vec::new();
        let mut bytes = 0u64;
        let mut progressed = false;

        {
            let mut tiles = lock(&self.shared.tiles);
            for fifo in self.engines.values_mut() {
                while let Some(t) = fifo.front_mut() {
                    match advance(t, &mut tiles, &self.host, &mut self.scratch) {
                        Ok((moved, done)) => {
                            bytes += moved;
                            progressed |= moved > 0;
                            if !done {
                                break;
                            }
                            finished.push(t.index);
                        }
                        Err(e) => failed.push((t.index, e)),
                    }
                    fifo.pop_front();
                }
            }
            progressed |= tiles.run_kernels();
        }

        if bytes > 0 {
            lock(&self.shared.status).bytes_moved += bytes;
        }
        for index in finished {
            self.set_state(index, SlotState::Done);
        }
        for (index, e) in failed {
            let state = self.fault(index, &e);
            self.set_state(index, state);
        }
        progressed
    }

    fn set_state(&mut self, index: u64, state: SlotState) {
        if let Some(entry) = self.inflight.iter_mut().find(|(i, _)| *i == index) {
            entry.1 = state;
        } else {
            warn!("Packet {index} finished but is not in flight");
        }
    }

    fn retire(&mut self) -> Result<bool> {
        let mut count = 0;
        while let Some(&(index, SlotState::Done)) = self.inflight.front() {
            // counted before the read index moves, so waiters see it
            lock(&self.shared.status).retired += 1;
            self.port.retire(index)?;
            self.inflight.pop_front();
            count += 1;
        }
        if count > 0 {
            debug!("Retired {count}, read index {}", self.next_retire());
        }
        Ok(count > 0)
    }

    fn next_retire(&self) -> u64 {
        self.inflight.front().map_or(self.next_fetch, |(i, _)| *i)
    }
}

/// Stream as much of `t` as the tile locks allow
///
/// Returns bytes moved and whether the transfer finished.
fn advance(
    t: &mut Transfer,
    tiles: &mut TileArray,
    host: &HostMemoryMap,
    scratch: &mut [u8],
) -> Result<(u64, bool)> {
    let mut moved = 0u64;
    loop {
        let (address, len) = match t.run.take().or_else(|| t.chunks.next()) {
            Some(run) => run,
            None => return Ok((moved, true)),
        };
        let want = (len as usize).min(scratch.len());
        let (mem, offset) = host.resolve(address, want)?;
        let buf = &mut scratch[..want];

        let n = match t.port.direction {
            Direction::HostToDevice => {
                mem.read_bytes(offset, buf)?;
                tiles.stream(t.port, buf)?
            }
            Direction::DeviceToHost => {
                let n = tiles.stream(t.port, buf)?;
                mem.write_bytes(offset, &buf[..n])?;
                n
            }
        };

        if n == 0 {
            t.run = Some((address, len));
            return Ok((moved, false));
        }
        moved += n as u64;
        // n <= len, which fits u32
        #[allow(clippy::cast_possible_truncation)]
        let n = n as u32;
        if n < len {
            t.run = Some((address + u64::from(n), len - n));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch;
    use crate::queue::{Queue, QueueKind};
    use crate::wait::WaitPolicy;
    use air_packet::layout::queue_region_size;
    use air_packet::{DeviceInit, NdMemcpy};

    const STAGING: u64 = 0x2000_0000;

    fn setup() -> (Queue, Arc<SharedMemory>, SoftwareFabric) {
        let qmem = Arc::new(SharedMemory::anonymous(0x1000_0000, queue_region_size(8)).unwrap());
        let staging = Arc::new(SharedMemory::anonymous(STAGING, 0x1000).unwrap());
        let queue = Queue::create(8, QueueKind::SingleProducer, Arc::clone(&qmem)).unwrap();
        let fabric =
            SoftwareFabric::spawn(qmem, HostMemoryMap::new().with_region(Arc::clone(&staging)))
                .unwrap();
        (queue, staging, fabric)
    }

    fn submit(queue: &Queue, cmd: Command) -> crate::queue::PacketRef {
        dispatch::enqueue(queue, &cmd, &WaitPolicy::indefinite()).unwrap()
    }

    #[test]
    fn test_init_packets_complete_and_are_recorded() {
        let (queue, _staging, fabric) = setup();
        let pkt = submit(
            &queue,
            Command::HerdInit(HerdInit {
                herd_id: 0,
                start_column: 7,
                num_columns: 2,
                start_row: 0,
                num_rows: 5,
            }),
        );
        dispatch::dispatch_and_wait(&queue, pkt.index(), pkt).unwrap();
        let pkt = submit(&queue, Command::DeviceInit(DeviceInit { num_columns: 50 }));
        dispatch::dispatch_and_wait(&queue, pkt.index(), pkt).unwrap();

        let status = fabric.status();
        assert_eq!(status.herds.len(), 1);
        assert_eq!(status.herds[0].start_column, 7);
        assert_eq!(status.device_columns, Some(50));
        assert_eq!(status.retired, 2);
        assert_eq!(queue.read_index().unwrap(), 2);
    }

    #[test]
    fn test_round_trip_through_tile_buffer() {
        let (queue, staging, fabric) = setup();
        {
            let mut tiles = fabric.tiles();
            tiles.add_buffer("buf", 8).unwrap();
            tiles.route(DmaPort::new(7, 0, Direction::HostToDevice), &["buf"]).unwrap();
            tiles.route(DmaPort::new(7, 0, Direction::DeviceToHost), &["buf"]).unwrap();
        }
        let words: Vec<u32> = (100..108).collect();
        staging.write_words(0, &words).unwrap();

        // read-back issued first; it stalls until the write fills the buffer
        submit(
            &queue,
            Command::NdMemcpy(NdMemcpy::contiguous(0, 7, 0, Direction::DeviceToHost, STAGING + 0x100, 32)),
        );
        let last = submit(
            &queue,
            Command::NdMemcpy(NdMemcpy::contiguous(0, 7, 0, Direction::HostToDevice, STAGING, 32)),
        );
        dispatch::dispatch_and_wait(&queue, last.index(), last).unwrap();

        let mut out = [0u32; 8];
        staging.read_words(0x100, &mut out).unwrap();
        assert_eq!(out.to_vec(), words);
        assert_eq!(fabric.status().bytes_moved, 64);
    }

    #[test]
    fn test_fault_blocks_completion() {
        let (queue, _staging, fabric) = setup();
        fabric
            .tiles()
            .add_buffer("buf", 8)
            .unwrap();
        fabric
            .tiles()
            .route(DmaPort::new(7, 0, Direction::HostToDevice), &["buf"])
            .unwrap();

        // address outside every host region
        let bad = submit(
            &queue,
            Command::NdMemcpy(NdMemcpy::contiguous(0, 7, 0, Direction::HostToDevice, 0x10, 32)),
        );
        let after = submit(&queue, Command::DeviceInit(DeviceInit { num_columns: 1 }));
        let err = dispatch::dispatch_and_wait_with(
            &queue,
            after.index(),
            after,
            &WaitPolicy::bounded(Duration::from_millis(50)),
        )
        .unwrap_err();
        assert!(matches!(err, AirError::Timeout { .. }));
        assert!(!queue.is_complete(bad.index()).unwrap());

        let status = fabric.status();
        assert_eq!(status.faults.len(), 1);
        assert_eq!(status.faults[0].index, bad.index());
        assert_eq!(status.retired, 0);
    }

    #[test]
    fn test_unknown_packet_type_faults() {
        let (queue, _staging, fabric) = setup();
        let index = queue.reserve_slot(1).unwrap();
        let record = DispatchPacket {
            kind: 0x7777,
            completion_signal: air_packet::layout::SIGNAL_PENDING,
            ..DispatchPacket::default()
        };
        let pkt = queue.write_record(index, &record).unwrap();
        let err = dispatch::dispatch_and_wait_with(
            &queue,
            index,
            pkt,
            &WaitPolicy::bounded(Duration::from_millis(50)),
        )
        .unwrap_err();
        assert!(matches!(err, AirError::Timeout { .. }));
        assert_eq!(fabric.status().faults.len(), 1);
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let (_queue, _staging, fabric) = setup();
        assert!(fabric.is_running());
        fabric.shutdown();
    }

    #[test]
    fn test_memory_map_resolution() {
        let a = Arc::new(SharedMemory::anonymous(0x1000, 0x100).unwrap());
        let b = Arc::new(SharedMemory::anonymous(0x8000, 0x100).unwrap());
        let map = HostMemoryMap::new().with_region(a).with_region(b);
        assert_eq!(map.resolve(0x8010, 16).unwrap().1, 0x10);
        assert!(map.resolve(0x10f0, 0x20).is_err());
        assert!(map.resolve(0x4000, 1).is_err());
    }
}
