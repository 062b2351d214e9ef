//! PCIe BAR layout.
//!
//! ```text
//! BAR  Size     Type                  Purpose
//! ──── ──────── ───────────────────── ──────────────────────────────────────
//!  0   1 MB     32-bit non-prefetch   Scheduler cores, interrupt manager, timer
//!  1   256 KB   32-bit non-prefetch   BRAM window shared with hardware
//! ```

/// BAR0: control register space.
pub mod bar0 {
    /// Size in bytes.
    pub const SIZE: usize = 0x0010_0000;
    /// BAR index in sysfs (`resource0`).
    pub const INDEX: usize = 0;
}

/// BAR1: the BRAM window (metrics mirrors, status flags, SG lists).
pub mod bar1 {
    /// Size in bytes.
    pub const SIZE: usize = 0x0004_0000;
    /// BAR index in sysfs (`resource1`).
    pub const INDEX: usize = 1;
}

/// BAR index enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Bar {
    /// BAR0: control registers.
    Control = 0,
    /// BAR1: shared BRAM window.
    SharedBram = 1,
}

impl Bar {
    /// Size of this BAR in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Control => bar0::SIZE,
            Self::SharedBram => bar1::SIZE,
        }
    }

    /// sysfs resource index.
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }
}
