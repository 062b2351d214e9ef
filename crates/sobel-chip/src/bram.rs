//! BRAM window layout (BAR1).
//!
//! The window is written by hardware (metrics mirrors), by the host driver
//! (status flags, SG lists) and read by both.
//!
//! ```text
//! 0x00000  metrics slot 0 (unused)
//! 0x00050  metrics slot 1..=7, one per accelerator group (80 bytes each)
//! 0x00280  status block
//!            +0x00  accelerator_busy  summary bitmask
//!            +0x04  busy[8]           one word per group
//!            +0x24  occupied_pid[8]   one word per group
//! 0x10000  SG source page list       (8192 × u64)
//! 0x20000  SG destination page list  (8192 × u64)
//! ```

/// Size of one metrics slot (`GroupMetrics`, 20 words).
pub const METRICS_SLOT_SIZE: usize = 80;

/// Number of metrics slots (slot 0 unused).
pub const METRICS_SLOT_COUNT: usize = 8;

/// Start of the status block.
pub const STATUS_BASE: usize = METRICS_SLOT_SIZE * METRICS_SLOT_COUNT;

/// Summary bitmask of busy groups.
pub const ACCELERATOR_BUSY: usize = STATUS_BASE;

/// First per-group busy word.
pub const BUSY_BASE: usize = STATUS_BASE + 0x04;

/// First per-group occupying-pid word.
pub const OCCUPIED_PID_BASE: usize = BUSY_BASE + 4 * METRICS_SLOT_COUNT;

/// End of the status block.
pub const STATUS_END: usize = OCCUPIED_PID_BASE + 4 * METRICS_SLOT_COUNT;

/// SG source page list, 64 KB past base.
pub const SG_SOURCE_LIST: usize = 0x0001_0000;

/// SG destination page list, 128 KB past base.
pub const SG_DESTINATION_LIST: usize = 0x0002_0000;

/// Bytes reserved for one SG list.
pub const SG_LIST_BYTES: usize = 0x0001_0000;

/// Maximum pages one SG list can describe (64-bit entries).
pub const MAX_SG_ENTRIES: usize = SG_LIST_BYTES / 8;

/// Bytes of BRAM the layout uses.
pub const WINDOW_SIZE: usize = SG_DESTINATION_LIST + SG_LIST_BYTES;

/// Offset of metrics slot `slot`.
#[must_use]
pub const fn metrics_slot(slot: usize) -> usize {
    slot * METRICS_SLOT_SIZE
}

/// Offset of group `index`'s busy word.
#[must_use]
pub const fn busy(index: usize) -> usize {
    BUSY_BASE + 4 * index
}

/// Offset of group `index`'s occupying-pid word.
#[must_use]
pub const fn occupied_pid(index: usize) -> usize {
    OCCUPIED_PID_BASE + 4 * index
}
