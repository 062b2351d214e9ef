//! Device context and per-process handles
//!
//! One [`Device`] exists per attached fabric. It owns everything that was
//! module-level state in a classic char driver: the two BARs, the DMA
//! mapper, the resource table, the seven group locks, the allocation wait
//! queue and the interrupt lines.
//!
//! ```text
//!                 Device::attach
//!                       │
//!        ┌──────────────┼─────────────────┐
//!        ▼              ▼                 ▼
//!   DeviceHandle    MmapEndpoint ×3   InterruptThreads
//!   (open/ioctl/    (open/mmap)       (one per group)
//!    release)
//! ```
//!
//! Lock order: table lock, then group locks in index order. Interrupt
//! handlers take the table lock and a single group lock.

use crate::config::DriverConfig;
use crate::dma::DmaMapper;
use crate::endpoint::{MmapEndpoint, MmapKind};
use crate::error::{DriverError, Result};
use crate::irq::{IrqEvent, MsiLines};
use crate::layout::BramWindow;
use crate::mmio::{read_split_counter, RegisterBus};
use crate::policy::AllocationPlan;
use crate::sg::SetPagesArgs;
use crate::table::{Pid, ResourceTable};
use sobel_chip::{regs, AcceleratorGroup, GROUP_COUNT};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Numeric ioctl command codes
pub mod commands {
    /// Allocate groups and start the contiguous ones
    pub const REQUEST_ACCELERATOR_ACCESS: u32 = 0;
    /// Start the SG group on the pages from SET_PAGES
    pub const REQUEST_ACCELERATOR_SG_ACCESS: u32 = 1;
    /// Pin and map the SG source/destination buffers
    pub const SET_PAGES: u32 = 2;
    /// Release the SG mapping
    pub const UNMAP_PAGES: u32 = 3;
    /// Clear every occupying pid and the busy summary
    pub const RESET_VARIABLES: u32 = 4;
    /// Hand back an SG grant that was never started
    pub const ABORT_SG_ACCESS: u32 = 5;
}

/// Hardware behind a [`Device`]
#[derive(Debug, Clone)]
pub struct DeviceResources {
    /// BAR0: scheduler cores, interrupt manager, global timer
    pub control: Arc<dyn RegisterBus>,
    /// BAR1: BRAM window
    pub bram: Arc<dyn RegisterBus>,
    /// Host/bus address translation
    pub dma: Arc<dyn DmaMapper>,
}

/// Queue of allocators waiting for a free group
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    /// Block until `ready` holds. `ready` is evaluated under the queue lock.
    pub(crate) fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !ready() {
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake every waiter so each re-checks its condition.
    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}

/// Attached fabric
#[derive(Debug)]
pub struct Device {
    pub(crate) control: Arc<dyn RegisterBus>,
    pub(crate) bram: BramWindow,
    pub(crate) dma: Arc<dyn DmaMapper>,
    pub(crate) config: DriverConfig,
    pub(crate) table: ResourceTable,
    group_locks: [Mutex<()>; GROUP_COUNT],
    pub(crate) wait_queue: WaitQueue,
    msi: MsiLines,
    msi_receivers: Mutex<Option<Vec<Receiver<IrqEvent>>>>,
}

impl Device {
    /// Build the context for one fabric.
    #[must_use]
    pub fn attach(resources: DeviceResources, config: DriverConfig) -> Arc<Self> {
        let (msi, receivers) = MsiLines::new();

        tracing::info!(
            "Attached fabric: {GROUP_COUNT} groups, policy {}, {} KB mmap windows",
            config.policy,
            config.mmap_size / 1024
        );

        Arc::new(Self {
            control: resources.control,
            bram: BramWindow::new(resources.bram),
            dma: resources.dma,
            config,
            table: ResourceTable::new(),
            group_locks: std::array::from_fn(|_| Mutex::new(())),
            wait_queue: WaitQueue::default(),
            msi,
            msi_receivers: Mutex::new(Some(receivers)),
        })
    }

    /// Open the device on behalf of `pid`.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` already has the device open.
    pub fn open(self: &Arc<Self>, pid: Pid) -> Result<DeviceHandle> {
        self.table.insert(pid)?;
        tracing::info!("Device opened by pid {pid}");
        Ok(DeviceHandle {
            device: Arc::clone(self),
            pid,
        })
    }

    /// One of the three mmap endpoints.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, kind: MmapKind) -> MmapEndpoint {
        MmapEndpoint::new(Arc::clone(self), kind)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// BRAM status block and metrics mirrors.
    #[must_use]
    pub const fn bram(&self) -> &BramWindow {
        &self.bram
    }

    /// Resource table.
    #[must_use]
    pub const fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// DMA mapper shared by all buffers.
    #[must_use]
    pub fn dma(&self) -> &Arc<dyn DmaMapper> {
        &self.dma
    }

    /// Top halves of the seven interrupt lines.
    #[must_use]
    pub fn msi_lines(&self) -> MsiLines {
        self.msi.clone()
    }

    pub(crate) fn take_msi_receivers(&self) -> Result<Vec<Receiver<IrqEvent>>> {
        self.msi_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DriverError::invalid_state("interrupt threads already started"))
    }

    /// Lock serialising `group`'s busy/pid words.
    pub(crate) fn group_lock(&self, group: AcceleratorGroup) -> MutexGuard<'_, ()> {
        self.group_locks[group.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current global timer value in cycles.
    #[must_use]
    pub fn read_timer(&self) -> u64 {
        read_split_counter(
            self.control.as_ref(),
            regs::GLOBAL_TIMER_LOWER,
            regs::GLOBAL_TIMER_UPPER,
        )
    }

    /// Clear every occupying pid and the busy summary word.
    ///
    /// Per-group busy flags are left as they are.
    pub fn reset_variables(&self) {
        for group in AcceleratorGroup::ALL {
            let _guard = self.group_lock(group);
            self.bram.clear_pid(group);
        }
        self.bram.clear_summary();
        tracing::info!("Occupying pids and busy summary reset");
    }
}

/// Decoded ioctl
#[derive(Debug)]
pub enum Ioctl {
    /// Allocate groups for the current image
    RequestAcceleratorAccess,
    /// Start the SG group
    RequestAcceleratorSgAccess,
    /// Pin and map SG buffers
    SetPages(SetPagesArgs),
    /// Release the SG mapping
    UnmapPages,
    /// Clear occupying pids and the busy summary
    ResetVariables,
    /// Release an unstarted SG grant
    AbortSgAccess,
}

impl Ioctl {
    /// Decode a numeric command. Only SET_PAGES takes an argument.
    ///
    /// # Errors
    ///
    /// Returns error for unknown codes or SET_PAGES without arguments.
    pub fn from_raw(cmd: u32, set_pages: Option<SetPagesArgs>) -> Result<Self> {
        match cmd {
            commands::REQUEST_ACCELERATOR_ACCESS => Ok(Self::RequestAcceleratorAccess),
            commands::REQUEST_ACCELERATOR_SG_ACCESS => Ok(Self::RequestAcceleratorSgAccess),
            commands::SET_PAGES => set_pages
                .map(Self::SetPages)
                .ok_or_else(|| DriverError::invalid_argument("SET_PAGES needs its argument struct")),
            commands::UNMAP_PAGES => Ok(Self::UnmapPages),
            commands::RESET_VARIABLES => Ok(Self::ResetVariables),
            commands::ABORT_SG_ACCESS => Ok(Self::AbortSgAccess),
            cmd => Err(DriverError::UnknownCommand { cmd }),
        }
    }

    /// Numeric command code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::RequestAcceleratorAccess => commands::REQUEST_ACCELERATOR_ACCESS,
            Self::RequestAcceleratorSgAccess => commands::REQUEST_ACCELERATOR_SG_ACCESS,
            Self::SetPages(_) => commands::SET_PAGES,
            Self::UnmapPages => commands::UNMAP_PAGES,
            Self::ResetVariables => commands::RESET_VARIABLES,
            Self::AbortSgAccess => commands::ABORT_SG_ACCESS,
        }
    }
}

/// Result of an ioctl
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    /// Groups granted by REQUEST_ACCELERATOR_ACCESS
    Granted(AllocationPlan),
    /// Command completed
    Done,
}

/// Device opened by one process
///
/// Dropping the handle is the release path: the process's record and
/// everything it owns are freed.
#[derive(Debug)]
pub struct DeviceHandle {
    device: Arc<Device>,
    pid: Pid,
}

impl DeviceHandle {
    /// Owning process.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Device this handle was opened on.
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Run one ioctl.
    ///
    /// REQUEST_ACCELERATOR_ACCESS blocks until a group is free.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    pub fn ioctl(&self, request: Ioctl) -> Result<IoctlReply> {
        tracing::debug!("pid {}: ioctl {}", self.pid, request.code());
        match request {
            Ioctl::RequestAcceleratorAccess => self
                .device
                .request_accelerator_access(self.pid)
                .map(IoctlReply::Granted),
            Ioctl::RequestAcceleratorSgAccess => {
                self.device.request_sg_access(self.pid)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::SetPages(args) => {
                if args.pid() != self.pid {
                    tracing::warn!(
                        "pid {} issued SET_PAGES on behalf of pid {}",
                        self.pid,
                        args.pid()
                    );
                }
                self.device.set_pages(&args)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::UnmapPages => {
                self.device.unmap_pages(self.pid)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::ResetVariables => {
                self.device.reset_variables();
                Ok(IoctlReply::Done)
            }
            Ioctl::AbortSgAccess => {
                self.device.abort_sg_access(self.pid)?;
                Ok(IoctlReply::Done)
            }
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.table.remove(self.pid);
        tracing::info!("Device released by pid {}", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SoftIommu;
    use crate::mmio::SimulatedBar;
    use sobel_chip::bar;

    fn device() -> Arc<Device> {
        Device::attach(
            DeviceResources {
                control: Arc::new(SimulatedBar::new(bar::bar0::SIZE)),
                bram: Arc::new(SimulatedBar::new(bar::bar1::SIZE)),
                dma: Arc::new(SoftIommu::new()),
            },
            DriverConfig::default(),
        )
    }

    #[test]
    fn commands_decode() {
        assert!(matches!(
            Ioctl::from_raw(commands::REQUEST_ACCELERATOR_ACCESS, None),
            Ok(Ioctl::RequestAcceleratorAccess)
        ));
        assert!(matches!(Ioctl::from_raw(4, None), Ok(Ioctl::ResetVariables)));
        assert!(matches!(
            Ioctl::from_raw(commands::SET_PAGES, None),
            Err(DriverError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Ioctl::from_raw(99, None),
            Err(DriverError::UnknownCommand { cmd: 99 })
        ));
        assert_eq!(Ioctl::UnmapPages.code(), 3);
        assert!(matches!(Ioctl::from_raw(5, None), Ok(Ioctl::AbortSgAccess)));
        assert_eq!(Ioctl::AbortSgAccess.code(), commands::ABORT_SG_ACCESS);
    }

    #[test]
    fn handle_owns_the_record() {
        let device = device();
        let pid = Pid::new(11).unwrap();
        let handle = device.open(pid).unwrap();
        assert!(device.table().contains(pid));
        assert!(matches!(device.open(pid), Err(DriverError::AlreadyOpen { .. })));
        drop(handle);
        assert!(device.table().is_empty());
    }

    #[test]
    fn reset_clears_pids_but_not_busy_flags() {
        let device = device();
        device.bram().claim(AcceleratorGroup::Indirect0, 5);
        device.bram().claim(AcceleratorGroup::ScatterGather, 6);
        device.reset_variables();
        for group in AcceleratorGroup::ALL {
            assert_eq!(device.bram().occupied_pid(group), 0);
        }
        assert!(device.bram().summary().is_empty());
        assert!(device.bram().is_busy(AcceleratorGroup::Indirect0));
        assert!(device.bram().is_busy(AcceleratorGroup::ScatterGather));
    }

    #[test]
    fn timer_combines_both_halves() {
        let device = device();
        device.control.write32(regs::GLOBAL_TIMER_LOWER, 5);
        device.control.write32(regs::GLOBAL_TIMER_UPPER, 1);
        assert_eq!(device.read_timer(), (1 << 32) | 5);
    }
}
