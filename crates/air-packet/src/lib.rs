//! Binary contract of the AIR host-to-fabric command queue.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the host and the fabric-side consumer agree on:
//! the 64-byte packet record, the queue header that precedes the packet
//! ring, the HSA-style header bits and the AIR packet type codes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`hsa`] | Packet header bits, fence scopes, queue type codes |
//! | [`layout`] | [`DispatchPacket`] record, queue header offsets, capacity limits |
//! | [`command`] | [`Command`] tagged variant, encode / decode |
//! | [`nd`] | Four-level strided transfer geometry |
//!
//! # Example
//!
//! ```
//! use air_packet::{Command, Direction, NdMemcpy};
//!
//! let copy = NdMemcpy::contiguous(0, 18, 1, Direction::HostToDevice, 0x8100_0000, 128);
//! let packet = Command::NdMemcpy(copy).encode();
//! assert!(!packet.is_active());
//! assert_eq!(Command::decode(&packet.activated()).unwrap(), Command::NdMemcpy(copy));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod command;
pub mod hsa;
pub mod layout;
pub mod nd;

pub use command::{Command, DecodeError, DeviceInit, Direction, HerdInit, NdMemcpy};
pub use layout::DispatchPacket;
pub use nd::{Chunks, Dim};
