//! Scatter-gather path: SET_PAGES, REQUEST_ACCELERATOR_SG_ACCESS, UNMAP_PAGES
//!
//! The SG group cannot read the coherent pre-process buffer. Instead the
//! process hands over two page-aligned buffers of its own, the driver maps
//! them page by page and publishes the bus address of every page in BRAM:
//!
//! ```text
//! BRAM + 0x10000   src page 0 │ src page 1 │ ... │ src page n-1
//! BRAM + 0x20000   dst page 0 │ dst page 1 │ ... │ dst page n-1
//! ```
//!
//! UNMAP_PAGES must come after the SG group has completed and before the
//! destination buffer is read. A grant that cannot be started (SET_PAGES
//! or the start failed) is handed back with ABORT_SG_ACCESS.

use crate::device::Device;
use crate::dma::{pages_for, PinnedPages};
use crate::error::{DriverError, Result};
use crate::layout::MetricsView;
use crate::mmio::write_remote_register;
use crate::policy::image_bytes;
use crate::table::{self, Pid, SgMapping};
use sobel_chip::regs::scheduler;
use sobel_chip::{bram, AcceleratorGroup};
use std::sync::Arc;

/// Argument of SET_PAGES
#[derive(Debug, Clone, Copy)]
pub struct SetPagesArgs {
    pid: Pid,
    source: usize,
    destination: usize,
}

impl SetPagesArgs {
    /// Describe the SG buffers of `pid`.
    ///
    /// # Safety
    ///
    /// `source` and `destination` must each start a page-aligned
    /// allocation at least as large as the image whose geometry is in the
    /// process's metrics buffer, rounded up to whole pages. Both must stay
    /// allocated until UNMAP_PAGES or until the device handle is released,
    /// and must not be accessed while the SG group owns them.
    #[must_use]
    pub unsafe fn new(pid: Pid, source: *mut u8, destination: *mut u8) -> Self {
        Self {
            pid,
            source: source as usize,
            destination: destination as usize,
        }
    }

    /// Requesting process.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }
}

impl Device {
    /// Pin and map the SG source and destination buffers.
    ///
    /// A mapping left over from an earlier SET_PAGES is released first.
    ///
    /// # Errors
    ///
    /// Returns error if the record or its metrics buffer is missing, the
    /// image is empty, overflows or is too large for one SG list (the
    /// configured limit or the BRAM list capacity), or a page cannot be
    /// mapped. Pages mapped before the failure are released again.
    pub fn set_pages(&self, args: &SetPagesArgs) -> Result<()> {
        let mut records = self.table.lock();
        let record = table::find(&mut records, args.pid)?;
        let metrics = record
            .metrics
            .as_ref()
            .ok_or(DriverError::NotMapped { region: "metrics" })?;
        let info = MetricsView::new(metrics).image_info();

        let bytes = image_bytes(info.rows, info.columns)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                DriverError::invalid_argument(format!(
                    "image geometry {}x{} overflows",
                    info.rows, info.columns
                ))
            })?;
        let pages = pages_for(bytes);
        if pages == 0 {
            return Err(DriverError::invalid_argument("SET_PAGES with an empty image"));
        }
        let max = self.config.max_sg_pages.min(bram::MAX_SG_ENTRIES);
        if pages > max {
            return Err(DriverError::TooManyPages { pages, max });
        }

        if record.sg.take().is_some() {
            tracing::warn!("pid {}: SET_PAGES without UNMAP_PAGES, dropping old mapping", args.pid);
        }

        let source = PinnedPages::pin(Arc::clone(&self.dma), args.source, pages)?;
        let destination = PinnedPages::pin(Arc::clone(&self.dma), args.destination, pages)?;
        source.sync_for_device();
        destination.sync_for_device();

        tracing::debug!(
            "pid {}: mapped {pages} SG pages ({bytes} bytes) each way",
            args.pid
        );
        record.sg = Some(SgMapping {
            source,
            destination,
        });
        Ok(())
    }

    /// Publish `pid`'s page lists and start the SG group.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` has no SG mapping, its image has grown past
    /// the mapped pages, it does not hold the SG group or has already
    /// started it.
    pub fn request_sg_access(&self, pid: Pid) -> Result<()> {
        let mut records = self.table.lock();
        let record = table::find(&mut records, pid)?;
        let sg = record
            .sg
            .as_ref()
            .ok_or_else(|| DriverError::invalid_state("SG start before SET_PAGES"))?;
        let metrics = record
            .metrics
            .as_ref()
            .ok_or(DriverError::NotMapped { region: "metrics" })?;
        let info = MetricsView::new(metrics).image_info();
        let fits = image_bytes(info.rows, info.columns)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .is_some_and(|bytes| pages_for(bytes) <= sg.page_count());
        if !fits {
            return Err(DriverError::invalid_argument(format!(
                "{}x{} image no longer fits the {} pages from SET_PAGES",
                info.rows,
                info.columns,
                sg.page_count()
            )));
        }

        let group = AcceleratorGroup::ScatterGather;
        let _guard = self.group_lock(group);
        let owner = self.bram.occupied_pid(group);
        if owner != pid.get() {
            return Err(DriverError::invalid_state(format!(
                "SG group is held by pid {owner}, not {pid}"
            )));
        }
        if !record.sg_granted {
            return Err(DriverError::invalid_state("SG group already started"));
        }

        self.bram
            .write_sg_list(bram::SG_SOURCE_LIST, sg.source.bus_addresses());
        self.bram
            .write_sg_list(bram::SG_DESTINATION_LIST, sg.destination.bus_addresses());

        let base = group.scheduler_base();
        let control = self.control.as_ref();
        write_remote_register(control, base, scheduler::IMAGE_COLUMNS, info.columns);
        write_remote_register(control, base, scheduler::IMAGE_ROWS, info.rows);
        write_remote_register(control, base, scheduler::AP_CTRL, scheduler::ap_ctrl::START);

        tracing::debug!("pid {pid}: SG group started on {} pages", sg.page_count());
        record.sg_granted = false;
        Ok(())
    }

    /// Give back an SG grant that will never be started.
    ///
    /// For a process whose SET_PAGES or SG start failed after the
    /// allocator claimed the SG group. The group is released if `pid`
    /// still holds it and waiting allocators are woken.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` has no record or no unstarted SG grant.
    pub fn abort_sg_access(&self, pid: Pid) -> Result<()> {
        {
            let mut records = self.table.lock();
            let record = table::find(&mut records, pid)?;
            if !std::mem::take(&mut record.sg_granted) {
                return Err(DriverError::invalid_state("no unstarted SG grant to abort"));
            }

            let group = AcceleratorGroup::ScatterGather;
            let _guard = self.group_lock(group);
            let owner = self.bram.occupied_pid(group);
            if owner == pid.get() {
                self.bram.release(group);
                tracing::warn!("pid {pid}: SG grant aborted before start, group released");
            } else {
                tracing::warn!("pid {pid}: SG grant aborted, group now held by pid {owner}");
            }
        }
        self.wait_queue.wake_all();
        Ok(())
    }

    /// Release `pid`'s SG mapping. A no-op without a prior SET_PAGES.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` has no record.
    pub fn unmap_pages(&self, pid: Pid) -> Result<()> {
        let mapping = {
            let mut records = self.table.lock();
            table::find(&mut records, pid)?.sg.take()
        };
        match mapping {
            Some(mapping) => {
                tracing::debug!("pid {pid}: unmapping {} SG pages", mapping.page_count());
                drop(mapping);
            }
            None => tracing::debug!("pid {pid}: UNMAP_PAGES with nothing mapped"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::DeviceResources;
    use crate::dma::{CoherentBuffer, DmaMapper, SoftIommu, PAGE_SIZE};
    use crate::layout::ImageInfo;
    use crate::mmio::{RegisterBus, SimulatedBar};
    use sobel_chip::bar;

    struct Fixture {
        device: Arc<Device>,
        mmu: Arc<SoftIommu>,
        control: Arc<SimulatedBar>,
        pid: Pid,
        source: CoherentBuffer,
        destination: CoherentBuffer,
    }

    fn fixture(rows: u32, columns: u32) -> Fixture {
        fixture_with_limit(rows, columns, 16)
    }

    fn fixture_with_limit(rows: u32, columns: u32, max_sg_pages: usize) -> Fixture {
        let mmu = Arc::new(SoftIommu::new());
        let control = Arc::new(SimulatedBar::new(bar::bar0::SIZE));
        let device = Device::attach(
            DeviceResources {
                control: control.clone(),
                bram: Arc::new(SimulatedBar::new(bar::bar1::SIZE)),
                dma: mmu.clone(),
            },
            DriverConfig {
                max_sg_pages,
                ..DriverConfig::default()
            },
        );
        let pid = Pid::new(21).unwrap();
        device.table().insert(pid).unwrap();
        let metrics = Arc::new(CoherentBuffer::new(mmu.clone(), PAGE_SIZE).unwrap());
        MetricsView::new(&metrics).set_image_info(ImageInfo::new(rows, columns));
        table::find(&mut device.table().lock(), pid).unwrap().metrics = Some(metrics);

        // Stand-in for the process's own buffers
        let source = CoherentBuffer::new(mmu.clone(), 16 * PAGE_SIZE).unwrap();
        let destination = CoherentBuffer::new(mmu.clone(), 16 * PAGE_SIZE).unwrap();
        Fixture {
            device,
            mmu,
            control,
            pid,
            source,
            destination,
        }
    }

    fn args(f: &Fixture) -> SetPagesArgs {
        // SAFETY: both buffers are page-aligned, 16 pages long and outlive the test.
        unsafe {
            SetPagesArgs::new(
                f.pid,
                f.source.host_address() as *mut u8,
                f.destination.host_address() as *mut u8,
            )
        }
    }

    /// Claim the SG group the way the allocator does once every
    /// contiguous group is busy.
    fn grant_sg(f: &Fixture) {
        for group in AcceleratorGroup::CONTIGUOUS {
            f.device.bram().claim(group, 1);
        }
        let plan = f.device.request_accelerator_access(f.pid).unwrap();
        assert!(plan.uses_scatter_gather());
    }

    fn sg_granted(f: &Fixture) -> bool {
        table::find(&mut f.device.table().lock(), f.pid).unwrap().sg_granted
    }

    fn sg_pages(f: &Fixture) -> Option<usize> {
        let mut records = f.device.table().lock();
        table::find(&mut records, f.pid)
            .unwrap()
            .sg
            .as_ref()
            .map(SgMapping::page_count)
    }

    #[test]
    fn set_then_unmap_leaves_nothing_mapped() {
        let f = fixture(64, 64);
        let baseline = f.mmu.mapping_count();
        f.device.set_pages(&args(&f)).unwrap();
        assert_eq!(sg_pages(&f), Some(4));
        assert_eq!(f.mmu.mapping_count(), baseline + 8);
        assert_eq!(f.mmu.sync_count(), 8);

        f.device.unmap_pages(f.pid).unwrap();
        assert_eq!(sg_pages(&f), None);
        assert_eq!(f.mmu.mapping_count(), baseline);
    }

    #[test]
    fn unmap_without_set_pages_is_harmless() {
        let f = fixture(8, 8);
        f.device.unmap_pages(f.pid).unwrap();
        f.device.unmap_pages(f.pid).unwrap();
        assert_eq!(sg_pages(&f), None);
    }

    #[test]
    fn repeated_set_pages_replaces_mapping() {
        let f = fixture(32, 32);
        let baseline = f.mmu.mapping_count();
        f.device.set_pages(&args(&f)).unwrap();
        f.device.set_pages(&args(&f)).unwrap();
        assert_eq!(f.mmu.mapping_count(), baseline + 2);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let f = fixture(128, 256);
        let err = f.device.set_pages(&args(&f)).unwrap_err();
        assert!(matches!(err, DriverError::TooManyPages { pages: 32, max: 16 }));
        assert_eq!(sg_pages(&f), None);
    }

    #[test]
    fn list_longer_than_bram_is_rejected() {
        // 8193 pages: one more than a BRAM list holds
        let f = fixture_with_limit(8193, 1024, usize::MAX);
        let err = f.device.set_pages(&args(&f)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::TooManyPages {
                pages: 8193,
                max: bram::MAX_SG_ENTRIES
            }
        ));
        assert_eq!(sg_pages(&f), None);
    }

    #[test]
    fn overflowing_geometry_is_rejected() {
        let f = fixture(u32::MAX, u32::MAX);
        let err = f.device.set_pages(&args(&f)).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument { .. }));
        assert_eq!(sg_pages(&f), None);
    }

    #[test]
    fn sg_start_publishes_page_lists() {
        let f = fixture(64, 64);
        grant_sg(&f);
        assert!(sg_granted(&f));
        f.device.set_pages(&args(&f)).unwrap();
        f.device.request_sg_access(f.pid).unwrap();
        assert!(!sg_granted(&f));

        let published = f.device.bram().read_sg_list(bram::SG_SOURCE_LIST, 4);
        let first_page = f.mmu.translate(published[0]);
        assert_eq!(first_page, Some(f.source.host_address()));
        let last = f.device.bram().read_sg_list(bram::SG_DESTINATION_LIST, 4)[3];
        assert_eq!(f.mmu.translate(last), Some(f.destination.host_address() + 3 * PAGE_SIZE));

        let base = AcceleratorGroup::ScatterGather.scheduler_base();
        assert_eq!(f.control.read32(base + scheduler::IMAGE_ROWS), 64);
        assert_eq!(f.control.read32(base + scheduler::AP_CTRL), scheduler::ap_ctrl::START);
    }

    #[test]
    fn sg_start_is_guarded() {
        let f = fixture(64, 64);
        let err = f.device.request_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));

        f.device.set_pages(&args(&f)).unwrap();
        f.device.bram().claim(AcceleratorGroup::ScatterGather, 999);
        let err = f.device.request_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
    }

    #[test]
    fn sg_start_rejects_geometry_grown_after_set_pages() {
        let f = fixture(16, 16);
        grant_sg(&f);
        f.device.set_pages(&args(&f)).unwrap();
        let metrics = table::find(&mut f.device.table().lock(), f.pid)
            .unwrap()
            .metrics
            .clone()
            .unwrap();
        MetricsView::new(&metrics).set_image_info(ImageInfo::new(64, 64));

        let err = f.device.request_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument { .. }));
        let base = AcceleratorGroup::ScatterGather.scheduler_base();
        assert_eq!(f.control.read32(base + scheduler::AP_CTRL), 0);
        f.device.abort_sg_access(f.pid).unwrap();
        assert!(!f.device.bram().is_busy(AcceleratorGroup::ScatterGather));
    }

    #[test]
    fn sg_start_runs_once_per_grant() {
        let f = fixture(16, 16);
        grant_sg(&f);
        f.device.set_pages(&args(&f)).unwrap();
        f.device.request_sg_access(f.pid).unwrap();
        let err = f.device.request_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
    }

    #[test]
    fn abort_hands_back_unstarted_grant() {
        let f = fixture(16, 16);
        grant_sg(&f);
        let group = AcceleratorGroup::ScatterGather;
        assert!(f.device.bram().is_busy(group));

        f.device.abort_sg_access(f.pid).unwrap();
        assert!(!f.device.bram().is_busy(group));
        assert_eq!(f.device.bram().occupied_pid(group), 0);
        assert!(f.device.bram().free_mask().contains(group));
        assert!(!sg_granted(&f));

        let err = f.device.abort_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
        f.device.set_pages(&args(&f)).unwrap();
        let err = f.device.request_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
    }

    #[test]
    fn abort_leaves_started_group_alone() {
        let f = fixture(16, 16);
        grant_sg(&f);
        f.device.set_pages(&args(&f)).unwrap();
        f.device.request_sg_access(f.pid).unwrap();

        let err = f.device.abort_sg_access(f.pid).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
        assert_eq!(f.device.bram().occupied_pid(AcceleratorGroup::ScatterGather), 21);
    }
}
