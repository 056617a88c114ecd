//! Dispatcher
//!
//! Publishing and completion waiting on top of [`Queue`]. A typical batch:
//!
//! ```no_run
//! # use air_host::{dispatch, Queue, Result};
//! # use air_packet::{Command, DeviceInit};
//! # fn run(queue: &Queue) -> Result<()> {
//! let idx = queue.reserve_slot(1)?;
//! let pkt = queue.write_packet(idx, &Command::DeviceInit(DeviceInit { num_columns: 50 }))?;
//! dispatch::dispatch_and_wait(queue, idx, pkt)?;
//! # Ok(())
//! # }
//! ```
//!
//! Packets retire in submission order, so waiting on the last packet of a
//! batch waits on the whole batch.

use crate::error::{AirError, Result};
use crate::queue::{PacketRef, Queue};
use crate::wait::WaitPolicy;
use air_packet::Command;

/// Make every written packet up to and including `write_index` visible to
/// the consumer
///
/// Packet bodies are fenced before their headers flip, and the doorbell is
/// stored last. Dispatching an index that is already published does nothing.
///
/// # Errors
///
/// Returns error if `write_index` exceeds the reserved write index.
pub fn dispatch(queue: &Queue, write_index: u64) -> Result<()> {
    queue.publish(write_index)?;
    Ok(())
}

/// Dispatch, then block until `packet` completes
///
/// Waits without a deadline. A packet that never completes blocks forever;
/// use [`dispatch_and_wait_with`] for a bounded wait.
///
/// # Errors
///
/// Returns error only if the queue memory is unreachable or `write_index`
/// was never reserved.
pub fn dispatch_and_wait(queue: &Queue, write_index: u64, packet: PacketRef) -> Result<()> {
    dispatch_and_wait_with(queue, write_index, packet, &WaitPolicy::indefinite())
}

/// Dispatch, then block until `packet` completes or `policy` gives up
///
/// The dispatch always happens; only the wait is skipped for a packet that
/// already completed.
///
/// # Errors
///
/// Returns [`AirError::Timeout`](crate::AirError::Timeout) or
/// [`AirError::Cancelled`](crate::AirError::Cancelled) per `policy`.
pub fn dispatch_and_wait_with(
    queue: &Queue,
    write_index: u64,
    packet: PacketRef,
    policy: &WaitPolicy,
) -> Result<()> {
    dispatch(queue, write_index)?;
    if queue.is_complete(packet.index())? {
        tracing::trace!("Packet {} already complete", packet.index());
        return Ok(());
    }
    wait(queue, packet, policy)
}

/// Block until `packet` completes, without publishing anything
///
/// # Errors
///
/// See [`dispatch_and_wait_with`].
pub fn wait(queue: &Queue, packet: PacketRef, policy: &WaitPolicy) -> Result<()> {
    let polls = policy.poll_until(|| queue.is_complete(packet.index()))?;
    tracing::debug!("Packet {} complete after {polls} polls", packet.index());
    Ok(())
}

/// Wait for a free slot, reserve it and write `command` into it
///
/// The packet is not dispatched. The wait for room happens before the
/// reservation, so a timeout or cancel leaves the queue untouched.
///
/// # Errors
///
/// Returns the wait error if no slot frees up under `policy`. If another
/// producer took the free slot first and the second wait fails, the error
/// is [`AirError::Unwritten`] carrying the reserved index; it must still be
/// written with [`Queue::write_packet`] or nothing after it can be published.
pub fn enqueue(queue: &Queue, command: &Command, policy: &WaitPolicy) -> Result<PacketRef> {
    let next = queue.write_index()?;
    if !queue.has_room(next)? {
        tracing::debug!("Queue full at packet {next}, waiting for consumer");
        policy.poll_until(|| queue.has_room(queue.write_index()?))?;
    }

    let index = queue.reserve_slot(1)?;
    if !queue.has_room(index)? {
        tracing::debug!("Slot for packet {index} taken by another producer, waiting");
        policy
            .poll_until(|| queue.has_room(index))
            .map_err(|source| AirError::Unwritten {
                index,
                source: Box::new(source),
            })?;
    }
    queue.write_packet(index, command)
}
