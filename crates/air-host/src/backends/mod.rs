//! Queue consumers
//!
//! Two consumers can sit behind a queue:
//! - **Hardware**: the platform's command processor reading `/dev/mem`-mapped
//!   memory. Nothing runs on the host side.
//! - **Software**: [`SoftwareFabric`], a host thread modelling shim DMA and
//!   tile buffers, for CI and development without a board.

pub mod software;
pub mod tiles;

pub use software::{FabricStatus, Fault, HostMemoryMap, SoftwareFabric};
pub use tiles::{DmaPort, TileArray, TileBuffer, TileBuffers, TileKernel};

/// Consumer actually serving a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Board command processor over physical memory
    Hardware,

    /// Software fabric on a host thread
    Software,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hardware => write!(f, "Hardware"),
            Self::Software => write!(f, "Software (fabric model)"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Hardware if the memory device opens, otherwise software
    #[default]
    Auto,

    /// Force the board
    Hardware,

    /// Force the software fabric
    Software,
}
