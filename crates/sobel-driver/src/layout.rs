//! Shared memory layouts
//!
//! Two layouts are shared with parties outside the driver:
//!
//! - the BRAM window (BAR1), shared with the fabric: metrics mirrors, the
//!   busy/pid status block and the SG page lists
//! - the per-process metrics buffer, shared with the process that mmap'd
//!   it: image geometry going in, completion masks and timings coming out
//!
//! Both are plain `#[repr(C)]` words; typed access goes through
//! [`BramWindow`] and [`MetricsView`].

use crate::dma::CoherentBuffer;
use crate::mmio::RegisterBus;
use bytemuck::{Pod, Zeroable};
use sobel_chip::{bram, AcceleratorGroup, GroupMask, GROUP_COUNT};
use std::mem::{offset_of, size_of};
use std::sync::{Arc, Mutex, PoisonError};

/// Hardware metrics for one run of one group
///
/// Written by the fabric into its BRAM slot, copied by the interrupt
/// handler into the owning process's metrics buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GroupMetrics {
    /// APM: read transactions
    pub apm_read_transactions: u32,
    /// APM: bytes read
    pub apm_read_bytes: u32,
    /// APM: write transactions
    pub apm_write_transactions: u32,
    /// APM: bytes written
    pub apm_write_bytes: u32,
    /// APM: stream packets
    pub apm_packets: u32,
    /// APM: stream bytes
    pub apm_bytes: u32,
    /// APM: global clock counter, low word
    pub apm_gcc_l: u32,
    /// APM: global clock counter, high word
    pub apm_gcc_u: u32,
    /// CDMA fetch start, low word
    pub cdma_fetch_time_start_l: u32,
    /// CDMA fetch start, high word
    pub cdma_fetch_time_start_u: u32,
    /// CDMA fetch end, low word
    pub cdma_fetch_time_end_l: u32,
    /// CDMA fetch end, high word
    pub cdma_fetch_time_end_u: u32,
    /// CDMA send start, low word
    pub cdma_send_time_start_l: u32,
    /// CDMA send start, high word
    pub cdma_send_time_start_u: u32,
    /// CDMA send end, low word
    pub cdma_send_time_end_l: u32,
    /// CDMA send end, high word
    pub cdma_send_time_end_u: u32,
    /// Accelerator DMA start, low word
    pub dma_accel_time_start_l: u32,
    /// Accelerator DMA start, high word
    pub dma_accel_time_start_u: u32,
    /// Accelerator DMA end, low word
    pub dma_accel_time_end_l: u32,
    /// Accelerator DMA end, high word
    pub dma_accel_time_end_u: u32,
}

const _: () = assert!(size_of::<GroupMetrics>() == bram::METRICS_SLOT_SIZE);

impl GroupMetrics {
    /// Accelerator DMA time in timer cycles.
    #[must_use]
    pub fn accel_cycles(&self) -> u64 {
        let start = join(self.dma_accel_time_start_l, self.dma_accel_time_start_u);
        let end = join(self.dma_accel_time_end_l, self.dma_accel_time_end_u);
        end.saturating_sub(start)
    }
}

const fn join(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Image geometry written by the process before requesting access
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageInfo {
    /// Rows (pixels)
    pub rows: u32,
    /// Columns (pixels)
    pub columns: u32,
    /// Image size in bytes
    pub size: u32,
    _reserved: u32,
}

impl ImageInfo {
    /// Geometry for a `rows` × `columns` RGBA8 image. `size` saturates at
    /// `u32::MAX`.
    #[must_use]
    pub const fn new(rows: u32, columns: u32) -> Self {
        Self {
            rows,
            columns,
            size: rows.saturating_mul(columns).saturating_mul(4),
            _reserved: 0,
        }
    }
}

/// Per-process metrics buffer
///
/// `accel_occupied` is set by the allocator, `accel_completed` is OR-ed by
/// interrupt handlers; the process polls until they are equal and then
/// zeroes both.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ProcessMetrics {
    /// One slot per group, by group index
    pub groups: [GroupMetrics; GROUP_COUNT],
    /// Whole request, start
    pub total_time_start: u64,
    /// Whole request, end
    pub total_time_end: u64,
    /// Blocked waiting for a free group, start
    pub sleep_time_start: u64,
    /// Blocked waiting for a free group, end (written by the allocator)
    pub sleep_time_end: u64,
    /// Request preparation, start
    pub preparation_time_start: u64,
    /// Request preparation, end
    pub preparation_time_end: u64,
    /// Image load, start
    pub load_time_start: u64,
    /// Image load, end
    pub load_time_end: u64,
    /// Result save, start
    pub save_time_start: u64,
    /// Result save, end
    pub save_time_end: u64,
    /// SET_PAGES, start
    pub set_pages_overhead_time_start: u64,
    /// SET_PAGES, end
    pub set_pages_overhead_time_end: u64,
    /// UNMAP_PAGES, start
    pub unmap_pages_overhead_time_start: u64,
    /// UNMAP_PAGES, end
    pub unmap_pages_overhead_time_end: u64,
    /// Geometry of the current image
    pub image_info: ImageInfo,
    /// Groups that signalled completion
    pub accel_completed: u32,
    /// Groups granted to the current request
    pub accel_occupied: u32,
    /// Number of bands the image was split into
    pub image_segments: u32,
    _pad: u32,
}

const _: () = assert!(size_of::<ProcessMetrics>() == 704);

impl ProcessMetrics {
    /// Groups granted to the request this snapshot belongs to.
    #[must_use]
    pub const fn occupied(&self) -> GroupMask {
        GroupMask::from_bits(self.accel_occupied)
    }

    /// Groups that had completed when the snapshot was taken.
    #[must_use]
    pub const fn completed(&self) -> GroupMask {
        GroupMask::from_bits(self.accel_completed)
    }
}

/// Typed access to a [`ProcessMetrics`] living in a coherent buffer
#[derive(Debug, Clone, Copy)]
pub struct MetricsView<'a> {
    buffer: &'a CoherentBuffer,
}

/// 64-bit timestamp fields of [`ProcessMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Timestamp {
    TotalStart,
    TotalEnd,
    SleepStart,
    SleepEnd,
    PreparationStart,
    PreparationEnd,
    LoadStart,
    LoadEnd,
    SaveStart,
    SaveEnd,
    SetPagesStart,
    SetPagesEnd,
    UnmapPagesStart,
    UnmapPagesEnd,
}

impl Timestamp {
    const fn offset(self) -> usize {
        match self {
            Self::TotalStart => offset_of!(ProcessMetrics, total_time_start),
            Self::TotalEnd => offset_of!(ProcessMetrics, total_time_end),
            Self::SleepStart => offset_of!(ProcessMetrics, sleep_time_start),
            Self::SleepEnd => offset_of!(ProcessMetrics, sleep_time_end),
            Self::PreparationStart => offset_of!(ProcessMetrics, preparation_time_start),
            Self::PreparationEnd => offset_of!(ProcessMetrics, preparation_time_end),
            Self::LoadStart => offset_of!(ProcessMetrics, load_time_start),
            Self::LoadEnd => offset_of!(ProcessMetrics, load_time_end),
            Self::SaveStart => offset_of!(ProcessMetrics, save_time_start),
            Self::SaveEnd => offset_of!(ProcessMetrics, save_time_end),
            Self::SetPagesStart => offset_of!(ProcessMetrics, set_pages_overhead_time_start),
            Self::SetPagesEnd => offset_of!(ProcessMetrics, set_pages_overhead_time_end),
            Self::UnmapPagesStart => offset_of!(ProcessMetrics, unmap_pages_overhead_time_start),
            Self::UnmapPagesEnd => offset_of!(ProcessMetrics, unmap_pages_overhead_time_end),
        }
    }
}

const IMAGE_INFO: usize = offset_of!(ProcessMetrics, image_info);
const ACCEL_COMPLETED: usize = offset_of!(ProcessMetrics, accel_completed);
const ACCEL_OCCUPIED: usize = offset_of!(ProcessMetrics, accel_occupied);
const IMAGE_SEGMENTS: usize = offset_of!(ProcessMetrics, image_segments);

impl<'a> MetricsView<'a> {
    /// View over `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than [`ProcessMetrics`].
    #[must_use]
    pub fn new(buffer: &'a CoherentBuffer) -> Self {
        assert!(
            buffer.len() >= size_of::<ProcessMetrics>(),
            "metrics buffer too small"
        );
        Self { buffer }
    }

    /// Current image geometry.
    #[must_use]
    pub fn image_info(&self) -> ImageInfo {
        let mut info = ImageInfo::default();
        self.buffer
            .copy_to(IMAGE_INFO, bytemuck::bytes_of_mut(&mut info));
        info
    }

    /// Publish image geometry.
    pub fn set_image_info(&self, info: ImageInfo) {
        self.buffer.copy_from(IMAGE_INFO, bytemuck::bytes_of(&info));
    }

    /// Groups granted to the current request.
    #[must_use]
    pub fn accel_occupied(&self) -> GroupMask {
        GroupMask::from_bits(self.buffer.load_u32(ACCEL_OCCUPIED))
    }

    /// Groups that have signalled completion.
    #[must_use]
    pub fn accel_completed(&self) -> GroupMask {
        GroupMask::from_bits(self.buffer.load_u32(ACCEL_COMPLETED))
    }

    /// Add `group` to the occupied mask.
    pub fn mark_occupied(&self, group: AcceleratorGroup) {
        self.buffer.fetch_or_u32(ACCEL_OCCUPIED, group.bit());
    }

    /// Add `group` to the completed mask, returning the previous mask.
    pub fn mark_completed(&self, group: AcceleratorGroup) -> GroupMask {
        GroupMask::from_bits(self.buffer.fetch_or_u32(ACCEL_COMPLETED, group.bit()))
    }

    /// Zero both masks (completed first, so it never exceeds occupied).
    pub fn reset_masks(&self) {
        self.buffer.store_u32(ACCEL_COMPLETED, 0);
        self.buffer.store_u32(ACCEL_OCCUPIED, 0);
    }

    /// Number of bands of the current request.
    #[must_use]
    pub fn image_segments(&self) -> u32 {
        self.buffer.load_u32(IMAGE_SEGMENTS)
    }

    /// Record the number of bands.
    pub fn set_image_segments(&self, segments: u32) {
        self.buffer.store_u32(IMAGE_SEGMENTS, segments);
    }

    /// Read a timestamp.
    #[must_use]
    pub fn timestamp(&self, field: Timestamp) -> u64 {
        self.buffer.load_u64(field.offset())
    }

    /// Write a timestamp.
    pub fn set_timestamp(&self, field: Timestamp, cycles: u64) {
        self.buffer.store_u64(field.offset(), cycles);
    }

    /// Store `metrics` into `group`'s slot.
    pub fn store_group_metrics(&self, group: AcceleratorGroup, metrics: &GroupMetrics) {
        let offset = group.index() * size_of::<GroupMetrics>();
        self.buffer.copy_from(offset, bytemuck::bytes_of(metrics));
    }

    /// Copy of the whole block.
    #[must_use]
    pub fn snapshot(&self) -> ProcessMetrics {
        let mut metrics = ProcessMetrics::zeroed();
        self.buffer
            .copy_to(0, bytemuck::bytes_of_mut(&mut metrics));
        metrics
    }
}

/// Driver-side view of the BRAM window
///
/// Per-group words are only touched under that group's lock (held by the
/// caller). The summary word is shared by all groups, so its
/// read-modify-write is serialised here.
#[derive(Debug)]
pub struct BramWindow {
    bus: Arc<dyn RegisterBus>,
    summary_lock: Mutex<()>,
}

impl BramWindow {
    /// Window over `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            bus,
            summary_lock: Mutex::new(()),
        }
    }

    /// Underlying bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn RegisterBus> {
        &self.bus
    }

    /// Whether `group` is busy.
    #[must_use]
    pub fn is_busy(&self, group: AcceleratorGroup) -> bool {
        self.bus.read32(bram::busy(group.index())) != 0
    }

    /// Raw busy word of `group`.
    #[must_use]
    pub fn busy_word(&self, group: AcceleratorGroup) -> u32 {
        self.bus.read32(bram::busy(group.index()))
    }

    /// Groups whose busy flag is clear.
    #[must_use]
    pub fn free_mask(&self) -> GroupMask {
        AcceleratorGroup::ALL
            .into_iter()
            .filter(|g| !self.is_busy(*g))
            .collect()
    }

    /// Pid occupying `group` (0 when free).
    #[must_use]
    pub fn occupied_pid(&self, group: AcceleratorGroup) -> u32 {
        self.bus.read32(bram::occupied_pid(group.index()))
    }

    /// Summary word of busy groups.
    #[must_use]
    pub fn summary(&self) -> GroupMask {
        GroupMask::from_bits(self.bus.read32(bram::ACCELERATOR_BUSY))
    }

    fn update_summary(&self, f: impl FnOnce(GroupMask) -> GroupMask) {
        let _guard = self.summary_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = f(self.summary());
        self.bus.write32(bram::ACCELERATOR_BUSY, next.bits());
    }

    /// Mark `group` taken by `pid`. Caller holds the group lock.
    pub fn claim(&self, group: AcceleratorGroup, pid: u32) {
        self.bus.write32(bram::occupied_pid(group.index()), pid);
        self.bus.write32(bram::busy(group.index()), 1);
        self.update_summary(|mut mask| {
            mask.insert(group);
            mask
        });
    }

    /// Mark `group` free. Caller holds the group lock.
    pub fn release(&self, group: AcceleratorGroup) {
        self.bus.write32(bram::busy(group.index()), 0);
        self.bus.write32(bram::occupied_pid(group.index()), 0);
        self.update_summary(|mut mask| {
            mask.remove(group);
            mask
        });
    }

    /// Zero one group's pid word. Caller holds the group lock.
    pub fn clear_pid(&self, group: AcceleratorGroup) {
        self.bus.write32(bram::occupied_pid(group.index()), 0);
    }

    /// Zero the summary word.
    pub fn clear_summary(&self) {
        let _guard = self.summary_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.bus.write32(bram::ACCELERATOR_BUSY, 0);
    }

    /// Read `group`'s hardware metrics mirror.
    #[must_use]
    pub fn metrics_mirror(&self, group: AcceleratorGroup) -> GroupMetrics {
        let base = bram::metrics_slot(group.metrics_slot());
        let mut words = [0u32; bram::METRICS_SLOT_SIZE / 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.bus.read32(base + 4 * i);
        }
        bytemuck::cast(words)
    }

    /// Write `group`'s metrics mirror (done by the fabric).
    pub fn write_metrics_mirror(&self, group: AcceleratorGroup, metrics: &GroupMetrics) {
        let base = bram::metrics_slot(group.metrics_slot());
        let words: [u32; bram::METRICS_SLOT_SIZE / 4] = bytemuck::cast(*metrics);
        for (i, word) in words.iter().enumerate() {
            self.bus.write32(base + 4 * i, *word);
        }
    }

    /// Publish an SG page list at `base` (source or destination region).
    ///
    /// # Panics
    ///
    /// Panics if the list does not fit in one region.
    pub fn write_sg_list(&self, base: usize, addresses: &[u64]) {
        assert!(addresses.len() <= bram::MAX_SG_ENTRIES, "SG list too long");
        for (i, &address) in addresses.iter().enumerate() {
            self.bus.write64(base + 8 * i, address);
        }
    }

    /// Read `pages` entries of the SG list at `base`.
    #[must_use]
    pub fn read_sg_list(&self, base: usize, pages: usize) -> Vec<u64> {
        (0..pages.min(bram::MAX_SG_ENTRIES))
            .map(|i| self.bus.read64(base + 8 * i))
            .collect()
    }
}
