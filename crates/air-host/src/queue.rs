//! Command queue
//!
//! A fixed-capacity ring of 64-byte packet slots living in [`SharedMemory`]
//! right after a 64-byte header (see [`air_packet::layout`]). The producer
//! side is [`Queue`]; the consumer side is [`ConsumerPort`], which only needs
//! the shared memory and learns everything else from the header.
//!
//! Index words (`write_index`, `read_index`, `doorbell`) are accessed
//! atomically; packet bodies are plain volatile stores ordered before the
//! header flip that publishes them.

use crate::error::{AirError, Result};
use crate::memory::SharedMemory;
use air_packet::hsa;
use air_packet::layout::{
    self, packet, queue as hdr, DispatchPacket, DOORBELL_NONE, MAX_QUEUE_SIZE, MIN_QUEUE_SIZE,
    PACKET_WORDS, QUEUE_ALIGN, SIGNAL_DONE,
};
use air_packet::Command;
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(0);

/// Producer model recorded in the queue header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    /// One host thread writes packets
    #[default]
    SingleProducer,
    /// Several host threads reserve and write packets
    MultiProducer,
}

impl QueueKind {
    /// Header `type` code
    pub const fn code(self) -> u32 {
        match self {
            Self::SingleProducer => hsa::QUEUE_TYPE_SINGLE,
            Self::MultiProducer => hsa::QUEUE_TYPE_MULTIPLE,
        }
    }

    /// Parse a header `type` code
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            hsa::QUEUE_TYPE_SINGLE => Some(Self::SingleProducer),
            hsa::QUEUE_TYPE_MULTIPLE => Some(Self::MultiProducer),
            _ => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleProducer => write!(f, "single-producer"),
            Self::MultiProducer => write!(f, "multi-producer"),
        }
    }
}

/// Snapshot of a queue header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHeader {
    /// Raw `type` field
    pub kind: u32,
    /// Feature bits
    pub features: u32,
    /// Physical address of slot 0
    pub base_address: u64,
    /// Index of the last published packet, [`DOORBELL_NONE`] before the first dispatch
    pub doorbell: u64,
    /// Capacity in slots
    pub size: u32,
    /// Queue identifier
    pub id: u64,
    /// Packets retired by the consumer
    pub read_index: u64,
    /// Slots reserved by producers
    pub write_index: u64,
}

impl QueueHeader {
    /// Read the header at the start of `memory`
    ///
    /// # Errors
    ///
    /// Returns error if the region is smaller than a header.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(memory: &SharedMemory) -> Result<Self> {
        let first = memory.read_u64(hdr::TYPE)?;
        Ok(Self {
            kind: first as u32,
            features: (first >> 32) as u32,
            base_address: memory.read_u64(hdr::BASE_ADDRESS)?,
            doorbell: memory.atomic_u64(hdr::DOORBELL)?.load(Ordering::Acquire),
            size: memory.read_u32(hdr::SIZE)?,
            id: memory.read_u64(hdr::ID)?,
            read_index: memory.atomic_u64(hdr::READ_INDEX)?.load(Ordering::Acquire),
            write_index: memory.atomic_u64(hdr::WRITE_INDEX)?.load(Ordering::Acquire),
        })
    }

    /// Packets in flight (reserved but not retired)
    pub const fn in_flight(&self) -> u64 {
        self.write_index.saturating_sub(self.read_index)
    }

    /// Number of packets published so far
    pub const fn published(&self) -> u64 {
        // DOORBELL_NONE wraps to 0
        self.doorbell.wrapping_add(1)
    }
}

/// Handle to a packet written into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketRef {
    index: u64,
    slot: u32,
}

impl PacketRef {
    /// Write index of the packet
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Ring slot holding the packet
    pub const fn slot(&self) -> u32 {
        self.slot
    }
}

/// Host-side bookkeeping of which reserved slots hold a written packet.
#[derive(Debug)]
struct PublishState {
    /// Next index to publish
    tail: u64,
    /// Index written into each slot and not yet published
    staged: Vec<Option<u64>>,
}

/// Producer handle to a command queue
#[derive(Debug)]
pub struct Queue {
    memory: Arc<SharedMemory>,
    capacity: u32,
    kind: QueueKind,
    id: u64,
    publish: Mutex<PublishState>,
}

impl Queue {
    /// Lay out a fresh queue at the start of `memory`
    ///
    /// The queue's base address is the region's physical base.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `capacity` is not a power of two in the supported range
    /// - The region base is not 64-byte aligned
    /// - The region cannot hold the header and all slots
    pub fn create(capacity: u32, kind: QueueKind, memory: Arc<SharedMemory>) -> Result<Self> {
        if !capacity.is_power_of_two() || !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&capacity) {
            return Err(AirError::InvalidCapacity {
                capacity,
                min: MIN_QUEUE_SIZE,
                max: MAX_QUEUE_SIZE,
            });
        }
        let base = memory.phys_base();
        if base % QUEUE_ALIGN != 0 {
            return Err(AirError::invalid_address(
                base,
                format!("queue base must be {QUEUE_ALIGN}-byte aligned"),
            ));
        }
        let needed = layout::queue_region_size(capacity);
        if memory.size() < needed {
            return Err(AirError::invalid_address(
                base,
                format!(
                    "region of {:#x} bytes cannot hold {capacity} slots ({needed:#x} bytes)",
                    memory.size()
                ),
            ));
        }

        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

        // Slots first, so a consumer never sees a valid header over stale packets
        let idle = DispatchPacket {
            header: hsa::pending_header(),
            completion_signal: SIGNAL_DONE,
            ..DispatchPacket::default()
        };
        for slot in 0..capacity {
            write_body(&memory, slot, &idle)?;
            memory.write_u64(layout::slot_offset(slot), idle.header_word())?;
        }

        memory.write_u64(
            hdr::TYPE,
            u64::from(kind.code()) | u64::from(hsa::QUEUE_FEATURE_AGENT_DISPATCH) << 32,
        )?;
        memory.write_u64(hdr::BASE_ADDRESS, base + layout::QUEUE_HEADER_SIZE as u64)?;
        memory.write_u64(hdr::SIZE, u64::from(capacity))?;
        memory.write_u64(hdr::ID, id)?;
        memory.atomic_u64(hdr::READ_INDEX)?.store(0, Ordering::Relaxed);
        memory.atomic_u64(hdr::WRITE_INDEX)?.store(0, Ordering::Relaxed);
        memory
            .atomic_u64(hdr::DOORBELL)?
            .store(DOORBELL_NONE, Ordering::Release);

        tracing::info!(
            "Created {kind} queue {id}: {capacity} slots at {base:#x} ({needed:#x} bytes)"
        );

        Ok(Self {
            memory,
            capacity,
            kind,
            id,
            publish: Mutex::new(PublishState {
                tail: 0,
                staged: vec![None; capacity as usize],
            }),
        })
    }

    /// Capacity in slots
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Producer model
    pub const fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Queue identifier
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Physical address of the queue header
    pub fn base_address(&self) -> u64 {
        self.memory.phys_base()
    }

    /// Backing region shared with the consumer
    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    /// Ring slot of a write index
    #[allow(clippy::cast_possible_truncation)]
    pub const fn slot(&self, index: u64) -> u32 {
        (index & (self.capacity as u64 - 1)) as u32
    }

    /// Atomically reserve `count` consecutive indices, returning the first
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn reserve_slot(&self, count: u64) -> Result<u64> {
        let index = self
            .memory
            .atomic_u64(hdr::WRITE_INDEX)?
            .fetch_add(count, Ordering::AcqRel);
        tracing::trace!("Queue {}: reserved {count} at {index}", self.id);
        Ok(index)
    }

    /// Slots reserved so far
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn write_index(&self) -> Result<u64> {
        Ok(self
            .memory
            .atomic_u64(hdr::WRITE_INDEX)?
            .load(Ordering::Acquire))
    }

    /// Packets retired by the consumer
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn read_index(&self) -> Result<u64> {
        Ok(self
            .memory
            .atomic_u64(hdr::READ_INDEX)?
            .load(Ordering::Acquire))
    }

    /// Number of packets published so far
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn published(&self) -> Result<u64> {
        published(&self.memory)
    }

    /// Current header snapshot
    ///
    /// # Errors
    ///
    /// Returns error only if the header is unreachable.
    pub fn header(&self) -> Result<QueueHeader> {
        QueueHeader::read(&self.memory)
    }

    /// True once the slot of `index` may take a new packet
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn has_room(&self, index: u64) -> Result<bool> {
        Ok(index < self.read_index()? + u64::from(self.capacity))
    }

    /// Encode `command` into the slot of reserved index `index`
    ///
    /// The packet stays invisible to the consumer until dispatched.
    ///
    /// # Errors
    ///
    /// See [`Queue::write_record`].
    pub fn write_packet(&self, index: u64, command: &Command) -> Result<PacketRef> {
        tracing::trace!("Queue {}: [{index}] {command}", self.id);
        self.write_record(index, &command.encode())
    }

    /// Write a raw packet record into the slot of reserved index `index`
    ///
    /// The header is forced to the pending state regardless of `record`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `index` was not reserved
    /// - `index` was already dispatched
    /// - The slot's previous occupant has not retired ([`AirError::SlotInFlight`])
    pub fn write_record(&self, index: u64, record: &DispatchPacket) -> Result<PacketRef> {
        let reserved = self.write_index()?;
        if index >= reserved {
            return Err(AirError::invalid_state(format!(
                "index {index} not reserved (write index {reserved})"
            )));
        }
        let read_index = self.read_index()?;
        if index >= read_index + u64::from(self.capacity) {
            return Err(AirError::SlotInFlight {
                index,
                read_index,
                capacity: self.capacity,
            });
        }

        let slot = self.slot(index);
        let mut state = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        if index < state.tail {
            return Err(AirError::invalid_state(format!(
                "packet {index} already dispatched"
            )));
        }

        let pending = DispatchPacket {
            header: hsa::pending_header(),
            ..*record
        };
        write_body(&self.memory, slot, &pending)?;
        self.memory
            .atomic_u64(layout::slot_offset(slot) + packet::HEADER_WORD)?
            .store(pending.header_word(), Ordering::Relaxed);
        state.staged[slot as usize] = Some(index);

        Ok(PacketRef { index, slot })
    }

    /// Read back the record at the slot of `index`
    ///
    /// # Errors
    ///
    /// Returns error only if the slot is unreachable.
    pub fn packet(&self, index: u64) -> Result<DispatchPacket> {
        read_record(&self.memory, self.slot(index))
    }

    /// Publish every written packet up to and including `write_index`, in order
    ///
    /// Returns the number of packets published so far. Publishing stops at
    /// the first index that was reserved but not yet written.
    pub(crate) fn publish(&self, write_index: u64) -> Result<u64> {
        let reserved = self.write_index()?;
        if write_index >= reserved {
            return Err(AirError::invalid_state(format!(
                "dispatch of {write_index} but only {reserved} slots reserved"
            )));
        }

        let mut state = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let start = state.tail;
        while state.tail <= write_index {
            let index = state.tail;
            let slot = self.slot(index);
            if state.staged[slot as usize] != Some(index) {
                tracing::warn!(
                    "Queue {}: packet {index} reserved but not written, publishing stops there",
                    self.id
                );
                break;
            }

            let header_word = self
                .memory
                .atomic_u64(layout::slot_offset(slot) + packet::HEADER_WORD)?;
            let (_, kind, reserved0) =
                DispatchPacket::split_header_word(header_word.load(Ordering::Relaxed));
            let active = DispatchPacket {
                header: hsa::dispatch_header(),
                kind,
                reserved0,
                ..DispatchPacket::default()
            };

            // Body stores must be visible before the header flips
            fence(Ordering::Release);
            header_word.store(active.header_word(), Ordering::Release);

            state.staged[slot as usize] = None;
            state.tail += 1;
        }

        if state.tail != start {
            let last = state.tail - 1;
            self.memory
                .atomic_u64(hdr::DOORBELL)?
                .store(last, Ordering::Release);
            tracing::debug!("Queue {}: published [{start}, {last}]", self.id);
        }
        Ok(state.tail)
    }

    /// True once the consumer has finished packet `index`
    ///
    /// # Errors
    ///
    /// Returns error only if the header or slot is unreachable.
    pub fn is_complete(&self, index: u64) -> Result<bool> {
        if self.read_index()? > index {
            return Ok(true);
        }
        if index >= self.published()? {
            return Ok(false);
        }
        let signal = self
            .memory
            .atomic_u64(layout::slot_offset(self.slot(index)) + packet::COMPLETION_SIGNAL)?
            .load(Ordering::Acquire);
        Ok(signal == SIGNAL_DONE)
    }
}

/// Consumer side of a queue
///
/// Owns a reference to the shared region and reads capacity from the header,
/// the way a device-side scheduler would.
#[derive(Debug, Clone)]
pub struct ConsumerPort {
    memory: Arc<SharedMemory>,
    capacity: u32,
}

impl ConsumerPort {
    /// Attach to the queue laid out at the start of `memory`
    ///
    /// # Errors
    ///
    /// Returns error if the header does not describe a usable queue.
    pub fn attach(memory: Arc<SharedMemory>) -> Result<Self> {
        let header = QueueHeader::read(&memory)?;
        let capacity = header.size;
        if !capacity.is_power_of_two() || !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&capacity) {
            return Err(AirError::invalid_state(format!(
                "queue header has unsupported size {capacity}"
            )));
        }
        if memory.size() < layout::queue_region_size(capacity) {
            return Err(AirError::invalid_state(format!(
                "queue header claims {capacity} slots, region is {:#x} bytes",
                memory.size()
            )));
        }
        tracing::debug!("Consumer attached to queue {} ({capacity} slots)", header.id);
        Ok(Self { memory, capacity })
    }

    /// Capacity in slots
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn slot(&self, index: u64) -> u32 {
        (index & (self.capacity as u64 - 1)) as u32
    }

    /// Number of packets published so far
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn published(&self) -> Result<u64> {
        published(&self.memory)
    }

    /// Packets retired so far
    ///
    /// # Errors
    ///
    /// Returns error only if the header word is unreachable.
    pub fn read_index(&self) -> Result<u64> {
        Ok(self
            .memory
            .atomic_u64(hdr::READ_INDEX)?
            .load(Ordering::Acquire))
    }

    /// Packet `index` if it has been published
    ///
    /// # Errors
    ///
    /// Returns error only if the slot is unreachable.
    pub fn fetch(&self, index: u64) -> Result<Option<DispatchPacket>> {
        let slot = self.slot(index);
        let word = self
            .memory
            .atomic_u64(layout::slot_offset(slot) + packet::HEADER_WORD)?
            .load(Ordering::Acquire);
        let (header, _, _) = DispatchPacket::split_header_word(word);
        if hsa::packet_kind(header) != hsa::PACKET_TYPE_AGENT_DISPATCH {
            return Ok(None);
        }
        let mut record = read_record(&self.memory, slot)?;
        record.header = header;
        Ok(Some(record))
    }

    /// Mark packet `index` done and free its slot
    ///
    /// Retirement is strictly in order: `index` must equal the read index.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::InvalidState`] for out-of-order retirement.
    pub fn retire(&self, index: u64) -> Result<()> {
        let read_index = self.memory.atomic_u64(hdr::READ_INDEX)?;
        let current = read_index.load(Ordering::Acquire);
        if current != index {
            return Err(AirError::invalid_state(format!(
                "retire {index} while read index is {current}"
            )));
        }

        let base = layout::slot_offset(self.slot(index));
        let header_word = self.memory.atomic_u64(base + packet::HEADER_WORD)?;
        let (_, kind, reserved0) =
            DispatchPacket::split_header_word(header_word.load(Ordering::Relaxed));
        let idle = DispatchPacket {
            header: hsa::pending_header(),
            kind,
            reserved0,
            ..DispatchPacket::default()
        };
        header_word.store(idle.header_word(), Ordering::Relaxed);
        self.memory
            .atomic_u64(base + packet::COMPLETION_SIGNAL)?
            .store(SIGNAL_DONE, Ordering::Release);
        read_index.store(index + 1, Ordering::Release);

        tracing::trace!("Retired packet {index}");
        Ok(())
    }
}

fn published(memory: &SharedMemory) -> Result<u64> {
    let doorbell = memory.atomic_u64(hdr::DOORBELL)?.load(Ordering::Acquire);
    // DOORBELL_NONE wraps to 0
    Ok(doorbell.wrapping_add(1))
}

fn write_body(memory: &SharedMemory, slot: u32, record: &DispatchPacket) -> Result<()> {
    let base = layout::slot_offset(slot);
    let words = record.to_words();
    for (i, word) in words.iter().enumerate().skip(1) {
        memory.write_u64(base + i * 8, *word)?;
    }
    Ok(())
}

fn read_record(memory: &SharedMemory, slot: u32) -> Result<DispatchPacket> {
    let base = layout::slot_offset(slot);
    let mut words = [0u64; PACKET_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        *word = if i == 0 || i == PACKET_WORDS - 1 {
            memory.atomic_u64(base + i * 8)?.load(Ordering::Acquire)
        } else {
            memory.read_u64(base + i * 8)?
        };
    }
    Ok(DispatchPacket::from_words(words))
}

#[cfg(test)]
mod tests {
    use super::*;
    use air_packet::{DeviceInit, Direction, NdMemcpy};

    fn queue(capacity: u32) -> Queue {
        let mem = SharedMemory::anonymous(0x4000_0000, layout::queue_region_size(capacity))
            .unwrap();
        Queue::create(capacity, QueueKind::SingleProducer, Arc::new(mem)).unwrap()
    }

    #[test]
    fn test_create_writes_header() {
        let q = queue(8);
        let h = q.header().unwrap();
        assert_eq!(h.size, 8);
        assert_eq!(QueueKind::from_code(h.kind), Some(QueueKind::SingleProducer));
        assert_eq!(h.base_address, 0x4000_0040);
        assert_eq!(h.doorbell, DOORBELL_NONE);
        assert_eq!(h.read_index, 0);
        assert_eq!(h.write_index, 0);
        for slot in 0..8u32 {
            let pkt = q.packet(u64::from(slot)).unwrap();
            assert!(!pkt.is_active());
            assert_eq!(pkt.completion_signal, SIGNAL_DONE);
        }
    }

    #[test]
    fn test_create_rejects_bad_capacity_and_region() {
        let mem = Arc::new(SharedMemory::anonymous(0, 0x1000).unwrap());
        for cap in [0, 1, 3, 48, MAX_QUEUE_SIZE * 2] {
            assert!(matches!(
                Queue::create(cap, QueueKind::SingleProducer, mem.clone()),
                Err(AirError::InvalidCapacity { .. })
            ));
        }
        // 0x1000 bytes hold 63 slots after the header
        assert!(matches!(
            Queue::create(64, QueueKind::SingleProducer, mem),
            Err(AirError::InvalidAddress { .. })
        ));

        let unaligned = Arc::new(SharedMemory::anonymous(0x20, 0x1000).unwrap());
        assert!(Queue::create(4, QueueKind::MultiProducer, unaligned).is_err());
    }

    #[test]
    fn test_write_stays_pending_until_published() {
        let q = queue(4);
        let idx = q.reserve_slot(1).unwrap();
        let cmd = Command::DeviceInit(DeviceInit { num_columns: 50 });
        let r = q.write_packet(idx, &cmd).unwrap();
        assert_eq!((r.index(), r.slot()), (0, 0));

        let port = ConsumerPort::attach(q.memory().clone()).unwrap();
        assert_eq!(port.fetch(0).unwrap(), None);
        assert!(!q.is_complete(0).unwrap());

        assert_eq!(q.publish(0).unwrap(), 1);
        let pkt = port.fetch(0).unwrap().unwrap();
        assert!(pkt.is_active());
        assert_eq!(Command::decode(&pkt), Ok(cmd));
        assert_eq!(port.published().unwrap(), 1);
        assert_eq!(q.header().unwrap().doorbell, 0);
    }

    #[test]
    fn test_publish_stops_at_unwritten_slot() {
        let q = queue(4);
        let first = q.reserve_slot(3).unwrap();
        let cmd = Command::DeviceInit(DeviceInit { num_columns: 1 });
        q.write_packet(first, &cmd).unwrap();
        q.write_packet(first + 2, &cmd).unwrap();

        assert_eq!(q.publish(2).unwrap(), 1);
        q.write_packet(first + 1, &cmd).unwrap();
        assert_eq!(q.publish(2).unwrap(), 3);
        // republish is a no-op
        assert_eq!(q.publish(2).unwrap(), 3);
        assert!(q.publish(3).is_err());
        assert!(q.write_packet(first, &cmd).is_err());
    }

    #[test]
    fn test_slot_reuse_requires_retirement() {
        let q = queue(2);
        let port = ConsumerPort::attach(q.memory().clone()).unwrap();
        let cmd = Command::NdMemcpy(NdMemcpy::contiguous(
            0,
            7,
            0,
            Direction::HostToDevice,
            0x1000,
            64,
        ));
        for i in 0..2 {
            let idx = q.reserve_slot(1).unwrap();
            q.write_packet(idx, &cmd).unwrap();
            assert_eq!(idx, i);
        }
        let third = q.reserve_slot(1).unwrap();
        assert_eq!(q.slot(third), 0);
        assert!(matches!(
            q.write_packet(third, &cmd),
            Err(AirError::SlotInFlight { index: 2, .. })
        ));

        q.publish(1).unwrap();
        assert!(port.retire(1).is_err());
        port.retire(0).unwrap();
        assert!(q.is_complete(0).unwrap());
        assert!(!q.is_complete(1).unwrap());
        q.write_packet(third, &cmd).unwrap();
        // reused slot is pending again, the old index still reads as complete
        assert!(q.is_complete(0).unwrap());
    }

    #[test]
    fn test_write_requires_reservation() {
        let q = queue(4);
        let cmd = Command::DeviceInit(DeviceInit { num_columns: 1 });
        assert!(matches!(
            q.write_packet(0, &cmd),
            Err(AirError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_attach_rejects_garbage_header() {
        let mem = Arc::new(SharedMemory::anonymous(0, 0x1000).unwrap());
        mem.write_u32(hdr::SIZE, 5).unwrap();
        assert!(ConsumerPort::attach(mem).is_err());
    }
}
