//! HSA-style packet header and queue codes.
//!
//! The first 16 bits of every packet are an HSA packet header. The AIR
//! consumer only distinguishes `INVALID` (slot not yet published, or already
//! retired) from `AGENT_DISPATCH` (ready to execute); the fence scope bits are
//! carried for compatibility with HSA consumers.
//!
//! ```text
//!  15      13 12   11 10    9   8   7                 0
//! ┌──────────┬───────┬───────┬───┬────────────────────┐
//! │ reserved │ rel.  │ acq.  │ B │   packet kind      │
//! └──────────┴───────┴───────┴───┴────────────────────┘
//! ```

// ── Header bit positions ─────────────────────────────────────────────────────

/// Bit offset of the packet kind field.
pub const HEADER_TYPE_SHIFT: u16 = 0;
/// Width mask of the packet kind field.
pub const HEADER_TYPE_MASK: u16 = 0xFF;
/// Barrier bit: consumer must finish earlier packets before this one.
pub const HEADER_BARRIER_SHIFT: u16 = 8;
/// Acquire fence scope field.
pub const HEADER_ACQUIRE_SCOPE_SHIFT: u16 = 9;
/// Release fence scope field.
pub const HEADER_RELEASE_SCOPE_SHIFT: u16 = 11;

// ── Packet kinds ─────────────────────────────────────────────────────────────

/// Vendor specific packet.
pub const PACKET_TYPE_VENDOR_SPECIFIC: u16 = 0;
/// Slot holds no executable packet.
pub const PACKET_TYPE_INVALID: u16 = 1;
/// Kernel dispatch (unused by AIR).
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;
/// Barrier-AND (unused by AIR).
pub const PACKET_TYPE_BARRIER_AND: u16 = 3;
/// Agent dispatch. Every published AIR packet carries this kind.
pub const PACKET_TYPE_AGENT_DISPATCH: u16 = 4;

// ── Fence scopes ─────────────────────────────────────────────────────────────

/// No fence.
pub const FENCE_SCOPE_NONE: u16 = 0;
/// Agent-scope fence.
pub const FENCE_SCOPE_AGENT: u16 = 1;
/// System-scope fence (host memory visible to the fabric).
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

// ── Queue types and features ─────────────────────────────────────────────────

/// Queue may be written by several producers.
pub const QUEUE_TYPE_MULTIPLE: u32 = 0;
/// Queue is written by exactly one producer.
pub const QUEUE_TYPE_SINGLE: u32 = 1;
/// Queue accepts agent dispatch packets.
pub const QUEUE_FEATURE_AGENT_DISPATCH: u32 = 2;

/// Header of a pending (unpublished) packet.
pub const fn pending_header() -> u16 {
    PACKET_TYPE_INVALID << HEADER_TYPE_SHIFT
}

/// Header of a published agent-dispatch packet with system-scope fences.
pub const fn dispatch_header() -> u16 {
    (PACKET_TYPE_AGENT_DISPATCH << HEADER_TYPE_SHIFT)
        | (FENCE_SCOPE_SYSTEM << HEADER_ACQUIRE_SCOPE_SHIFT)
        | (FENCE_SCOPE_SYSTEM << HEADER_RELEASE_SCOPE_SHIFT)
}

/// Packet kind encoded in `header`.
pub const fn packet_kind(header: u16) -> u16 {
    (header >> HEADER_TYPE_SHIFT) & HEADER_TYPE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_kinds() {
        assert_eq!(packet_kind(pending_header()), PACKET_TYPE_INVALID);
        assert_eq!(packet_kind(dispatch_header()), PACKET_TYPE_AGENT_DISPATCH);
        // acquire + release system scope: 2 << 9 | 2 << 11
        assert_eq!(dispatch_header(), 0x1404);
    }
}
