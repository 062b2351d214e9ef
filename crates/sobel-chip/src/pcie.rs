//! PCIe identifiers for the accelerator fabric.
//!
//! The fabric sits behind a Xilinx PCIe bridge; the IDs are the bridge
//! defaults left in place by the block design.

/// Xilinx vendor ID (PCI-SIG assigned).
pub const XILINX_VENDOR_ID: u16 = 0x10EE;

/// Device IDs the fabric has been built with.
pub mod device_id {
    /// Gen2 x4 endpoint (`lspci: 10ee:7024`).
    pub const GEN2_X4: u16 = 0x7024;
    /// Gen2 x8 endpoint (`lspci: 10ee:7028`).
    pub const GEN2_X8: u16 = 0x7028;
}

/// All known fabric device IDs.
pub const ALL_DEVICE_IDS: &[u16] = &[device_id::GEN2_X4, device_id::GEN2_X8];

/// MSI vectors requested by the driver, one per accelerator group.
pub const MSI_VECTORS: usize = crate::GROUP_COUNT;

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{:04x}:{:04x}", XILINX_VENDOR_ID, device_id::GEN2_X4)
}
