//! BAR0 register map.
//!
//! Every accelerator group is fronted by an HLS-synthesized scheduler core
//! with the usual `ap_ctrl_hs` AXI-Lite block followed by its arguments.
//! The cores sit at 4 KB strides; the interrupt manager and the global
//! timer follow.
//!
//! ```text
//! 0x020000  scheduler core, direct-0
//! 0x021000  scheduler core, direct-1
//! 0x022000  scheduler core, indirect-0
//! 0x023000  scheduler core, indirect-1
//! 0x024000  scheduler core, indirect-2
//! 0x025000  scheduler core, indirect-3
//! 0x026000  scheduler core, scatter-gather
//! 0x030000  interrupt manager (MSI sequencing + acknowledge)
//! 0x040000  global timer (64-bit free-running cycle counter)
//! ```

// ── Scheduler cores ──────────────────────────────────────────────────────────

/// Stride between scheduler cores.
pub const SCHEDULER_STRIDE: usize = 0x1000;

/// Base of the first scheduler core.
pub const SCHEDULER_BASE: usize = 0x0002_0000;

/// Scheduler core base per group, indexed by group index.
pub const SCHEDULER_BASES: [usize; crate::GROUP_COUNT] = [
    SCHEDULER_BASE,
    SCHEDULER_BASE + SCHEDULER_STRIDE,
    SCHEDULER_BASE + 2 * SCHEDULER_STRIDE,
    SCHEDULER_BASE + 3 * SCHEDULER_STRIDE,
    SCHEDULER_BASE + 4 * SCHEDULER_STRIDE,
    SCHEDULER_BASE + 5 * SCHEDULER_STRIDE,
    SCHEDULER_BASE + 6 * SCHEDULER_STRIDE,
];

/// Register offsets inside one scheduler core.
pub mod scheduler {
    /// `ap_ctrl` block.
    pub const AP_CTRL: usize = 0x00;
    /// Global interrupt enable.
    pub const GIE: usize = 0x04;
    /// IP interrupt enable.
    pub const IER: usize = 0x08;
    /// IP interrupt status.
    pub const ISR: usize = 0x0C;
    /// Source DMA address (low 32 bits).
    pub const SOURCE_ADDRESS_LO: usize = 0x10;
    /// Source DMA address (high 32 bits).
    pub const SOURCE_ADDRESS_HI: usize = 0x14;
    /// Destination DMA address (low 32 bits).
    pub const DESTINATION_ADDRESS_LO: usize = 0x1C;
    /// Destination DMA address (high 32 bits).
    pub const DESTINATION_ADDRESS_HI: usize = 0x20;
    /// Image columns (pixels per row).
    pub const IMAGE_COLUMNS: usize = 0x28;
    /// Image rows handled by this core.
    pub const IMAGE_ROWS: usize = 0x30;

    /// `ap_ctrl` bits.
    pub mod ap_ctrl {
        /// Start the core.
        pub const START: u32 = 1 << 0;
        /// Core finished its last run.
        pub const DONE: u32 = 1 << 1;
        /// Core is idle.
        pub const IDLE: u32 = 1 << 2;
        /// Core can accept new arguments.
        pub const READY: u32 = 1 << 3;
    }
}

// ── Interrupt manager ────────────────────────────────────────────────────────

/// Base of the on-device interrupt manager.
pub const INTERRUPT_MANAGER_BASE: usize = 0x0003_0000;

/// Acknowledge register: the manager holds the next MSI until written.
pub const INTERRUPT_ACK: usize = INTERRUPT_MANAGER_BASE + 0x0C;

/// Value written to [`INTERRUPT_ACK`].
pub const INTERRUPT_ACK_VALUE: u32 = 1;

// ── Global timer ─────────────────────────────────────────────────────────────

/// Base of the global timer.
pub const GLOBAL_TIMER_BASE: usize = 0x0004_0000;
/// Cycle counter, low word.
pub const GLOBAL_TIMER_LOWER: usize = GLOBAL_TIMER_BASE + 0x08;
/// Cycle counter, high word.
pub const GLOBAL_TIMER_UPPER: usize = GLOBAL_TIMER_BASE + 0x0C;
/// Timer clock.
pub const GLOBAL_TIMER_HZ: u64 = 100_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_cores_do_not_overlap() {
        for pair in SCHEDULER_BASES.windows(2) {
            assert_eq!(pair[1] - pair[0], SCHEDULER_STRIDE);
        }
        assert!(scheduler::IMAGE_ROWS + 4 <= SCHEDULER_STRIDE);
        assert!(SCHEDULER_BASES[6] + SCHEDULER_STRIDE <= INTERRUPT_MANAGER_BASE);
    }

    #[test]
    fn argument_registers_are_distinct() {
        let offsets = [
            scheduler::AP_CTRL,
            scheduler::SOURCE_ADDRESS_LO,
            scheduler::SOURCE_ADDRESS_HI,
            scheduler::DESTINATION_ADDRESS_LO,
            scheduler::DESTINATION_ADDRESS_HI,
            scheduler::IMAGE_COLUMNS,
            scheduler::IMAGE_ROWS,
        ];
        for (i, a) in offsets.iter().enumerate() {
            for b in &offsets[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
