//! Host runtime for the AIR command queue.
//!
//! A host program talks to an AIR fabric through a ring of 64-byte dispatch
//! packets in memory shared with the platform's command processor. This
//! crate owns that memory, the queue bookkeeping, and the publish/wait
//! protocol; packet formats live in `air-packet`.
//!
//! # Layers
//!
//! ```text
//! AirDevice        queue + staging buffer + consumer, from a HostConfig
//!   dispatch       publish up to an index, wait on a packet
//!     Queue        reserve, write pending, fence, flip headers
//!       SharedMemory   /dev/mem mapping or anonymous region
//!
//! Consumers:
//!   Hardware        board command processor, nothing on the host
//!   SoftwareFabric  host thread modelling shim DMA and tile buffers
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use air_host::{AirDevice, BackendSelection, HostConfig};
//! use air_packet::{Command, DeviceInit};
//!
//! # fn main() -> air_host::Result<()> {
//! let dev = AirDevice::open(HostConfig::from_env()?, BackendSelection::Auto)?;
//! let pkt = dev.submit(&Command::DeviceInit(DeviceInit { num_columns: 50 }))?;
//! dev.dispatch_and_wait(pkt.index(), pkt)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`dispatch`] | publish and completion waiting |
//! | [`backends`] | software fabric and tile model |
//! | [`validation`] | shim DMA and matrix add bring-up programs |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod config;
mod device;
pub mod dispatch;
mod error;
mod memory;
mod queue;
pub mod validation;
mod wait;

pub use backends::{BackendSelection, BackendType, FabricStatus, Fault, HostMemoryMap, SoftwareFabric};
pub use config::{
    HostConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_STAGING_SIZE, VCK190_NUM_COLUMNS,
    VCK190_QUEUE_BASE, VCK190_STAGING_BASE,
};
pub use device::AirDevice;
pub use error::{AirError, Result};
pub use memory::SharedMemory;
pub use queue::{ConsumerPort, PacketRef, Queue, QueueHeader, QueueKind};
pub use wait::{CancelToken, WaitPolicy};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AirDevice, AirError, BackendSelection, HostConfig, PacketRef, Queue, Result, WaitPolicy,
    };
    pub use air_packet::{Command, DeviceInit, Direction, HerdInit, NdMemcpy};
}
