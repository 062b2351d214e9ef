//! Host driver for the Sobel accelerator fabric.
//!
//! Seven accelerator groups (2 direct, 4 indirect, 1 scatter-gather) sit
//! behind one PCIe endpoint. This crate arbitrates them between
//! concurrent processes and manages the DMA memory they work on.
//!
//! # Layers
//!
//! ```text
//! AcceleratorClient            one per requesting thread (client)
//!        │ open / mmap / ioctl
//!        ▼
//! Device ─┬─ ResourceTable     per-process records (table)
//!         ├─ allocator         REQUEST_ACCELERATOR_ACCESS, two policies
//!         ├─ sg                SET_PAGES / SG start / abort / UNMAP_PAGES
//!         ├─ irq               seven MSI bottom halves
//!         └─ endpoint          pre-process, post-process, metrics mmaps
//!        │
//!        ▼
//! RegisterBus (BAR0, BAR1) + DmaMapper
//!        │
//!        ├── MmapRegion / FabricManager     real fabric via sysfs
//!        └── SimulatedFabric                software fabric (sim)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use sobel_driver::sim::{CompletionMode, SimulatedFabric};
//! use sobel_driver::{AcceleratorClient, DriverConfig, Image, Pid};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let system = SimulatedFabric::boot(CompletionMode::Auto, DriverConfig::from_env())?;
//! let client = AcceleratorClient::connect(&system.device, Pid::current())?;
//! let done = client.process(&Image::test_pattern(480, 640))?;
//! println!("{} segment(s) on {:#04x}", done.plan.segment_count(), done.plan.groups().bits());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod allocator;
pub mod client;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dma;
pub mod endpoint;
mod error;
pub mod irq;
pub mod layout;
pub mod mmio;
pub mod policy;
pub mod sg;
pub mod sim;
pub mod table;

/// Hardware identification constants (re-exported from sobel-chip).
pub mod pcie_ids {
    pub use sobel_chip::pcie::device_id;
    pub use sobel_chip::pcie::{lspci_filter, ALL_DEVICE_IDS, MSI_VECTORS, XILINX_VENDOR_ID};
}

/// Register and BAR layout (re-exported from sobel-chip).
pub use sobel_chip::{bar, bram, regs};

pub use client::{AcceleratorClient, Image, Processed, UserBuffer};
pub use config::DriverConfig;
pub use device::{Device, DeviceHandle, DeviceResources, Ioctl, IoctlReply};
pub use discovery::{FabricInfo, FabricManager};
pub use dma::{CoherentBuffer, DmaMapper, PinnedPages, SoftIommu};
pub use endpoint::{EndpointFile, MappedBuffer, MmapEndpoint, MmapKind};
pub use error::{DriverError, Result};
pub use irq::{InterruptThreads, MsiLines};
pub use layout::{GroupMetrics, ImageInfo, MetricsView, ProcessMetrics};
pub use mmio::{MmapRegion, RegisterBus, SimulatedBar};
pub use policy::{AllocationPlan, AllocationPolicy, Segment};
pub use sg::SetPagesArgs;
pub use sobel_chip::{AcceleratorGroup, GroupKind, GroupMask};
pub use table::Pid;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AcceleratorClient, AcceleratorGroup, AllocationPolicy, Device, DriverConfig, DriverError,
        GroupMask, Image, Ioctl, IoctlReply, Pid, Result,
    };
}
