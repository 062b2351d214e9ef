//! DMA mapping
//!
//! Two kinds of memory reach the fabric:
//!
//! ```text
//! ┌──────────────────┐   map once, whole buffer   ┌──────────────┐
//! │ CoherentBuffer   │ ─────────────────────────▶ │              │
//! │ (driver-owned)   │                            │  DmaMapper   │──▶ bus addresses
//! ├──────────────────┤   map page by page         │  (IOMMU)     │
//! │ PinnedPages      │ ─────────────────────────▶ │              │
//! │ (caller-owned)   │                            └──────────────┘
//! └──────────────────┘
//! ```
//!
//! Coherent buffers back the three mmap endpoints. Pinned pages back the
//! scatter-gather lists: each page gets its own bus address, so the
//! fabric sees a non-contiguous buffer it has to walk.

use crate::error::{DriverError, Result};
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Host page size assumed by the SG lists.
pub const PAGE_SIZE: usize = 4096;

/// First bus address handed out by [`SoftIommu`] (256 MiB).
pub const IOVA_BASE: u64 = 0x1000_0000;

/// Host ↔ bus address translation
pub trait DmaMapper: std::fmt::Debug + Send + Sync {
    /// Make `len` bytes at host address `host` visible to the device.
    ///
    /// # Errors
    ///
    /// Returns error if the range cannot be mapped.
    fn map(&self, host: usize, len: usize) -> Result<u64>;

    /// Tear down a mapping returned by [`map`](Self::map).
    fn unmap(&self, bus: u64, len: usize);

    /// Flush CPU writes so the device sees them.
    fn sync_for_device(&self, _bus: u64, _len: usize) {}

    /// Host address behind `bus`, if mapped.
    fn translate(&self, bus: u64) -> Option<usize>;
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    host: usize,
    len: usize,
}

#[derive(Debug)]
struct IommuState {
    next: u64,
    mappings: BTreeMap<u64, Mapping>,
}

impl IommuState {
    fn lookup(&self, bus: u64, len: usize) -> Option<usize> {
        let (&start, mapping) = self.mappings.range(..=bus).next_back()?;
        let offset = usize::try_from(bus - start).ok()?;
        (offset + len <= mapping.len).then_some(mapping.host + offset)
    }
}

/// Software IOMMU
///
/// Bus addresses are bump-allocated from [`IOVA_BASE`] with one unmapped
/// page between consecutive mappings. Device-side accesses go through
/// [`dma_read`](Self::dma_read)/[`dma_write`](Self::dma_write), which hold
/// the translation lock for the whole copy so a concurrent unmap cannot
/// pull the memory away mid-transfer.
#[derive(Debug)]
pub struct SoftIommu {
    state: Mutex<IommuState>,
    syncs: AtomicUsize,
}

impl Default for SoftIommu {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftIommu {
    /// Empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IommuState {
                next: IOVA_BASE,
                mappings: BTreeMap::new(),
            }),
            syncs: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IommuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live mappings.
    pub fn mapping_count(&self) -> usize {
        self.state().mappings.len()
    }

    /// Number of `sync_for_device` calls so far.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Device read: copy from bus memory into `dst`.
    ///
    /// # Errors
    ///
    /// Returns error if any byte of the range is unmapped.
    pub fn dma_read(&self, bus: u64, dst: &mut [u8]) -> Result<()> {
        let state = self.state();
        let host = state.lookup(bus, dst.len()).ok_or_else(|| {
            DriverError::dma_map_failed(format!("read of unmapped bus range {bus:#x}+{:#x}", dst.len()))
        })?;
        // SAFETY: copy out of mapped host memory.
        // Invariants: (1) [host, host+len) lies inside a live mapping (lookup);
        // (2) the mapping's owner unmaps before freeing, and unmap needs the lock we hold;
        // (3) dst is a distinct Rust slice, so the ranges cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(host as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Device write: copy `src` into bus memory.
    ///
    /// # Errors
    ///
    /// Returns error if any byte of the range is unmapped.
    pub fn dma_write(&self, bus: u64, src: &[u8]) -> Result<()> {
        let state = self.state();
        let host = state.lookup(bus, src.len()).ok_or_else(|| {
            DriverError::dma_map_failed(format!("write to unmapped bus range {bus:#x}+{:#x}", src.len()))
        })?;
        // SAFETY: same invariants as dma_read; the owner granted the device write access
        // by mapping the range.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), host as *mut u8, src.len()) };
        Ok(())
    }
}

impl DmaMapper for SoftIommu {
    fn map(&self, host: usize, len: usize) -> Result<u64> {
        if host == 0 || len == 0 {
            return Err(DriverError::dma_map_failed(format!(
                "refusing to map {host:#x}+{len:#x}"
            )));
        }
        let mut state = self.state();
        let bus = state.next;
        // One guard page keeps neighbouring mappings non-contiguous
        state.next += (len.div_ceil(PAGE_SIZE) as u64 + 1) * PAGE_SIZE as u64;
        state.mappings.insert(bus, Mapping { host, len });
        tracing::trace!("IOMMU map {host:#x}+{len:#x} -> {bus:#x}");
        Ok(bus)
    }

    fn unmap(&self, bus: u64, len: usize) {
        match self.state().mappings.remove(&bus) {
            Some(mapping) if mapping.len == len => tracing::trace!("IOMMU unmap {bus:#x}"),
            Some(mapping) => tracing::warn!(
                "IOMMU unmap {bus:#x}: length {len:#x} does not match mapping {:#x}",
                mapping.len
            ),
            None => tracing::warn!("IOMMU unmap of unknown bus address {bus:#x}"),
        }
    }

    fn sync_for_device(&self, bus: u64, len: usize) {
        tracing::trace!("IOMMU sync {bus:#x}+{len:#x} for device");
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn translate(&self, bus: u64) -> Option<usize> {
        self.state().lookup(bus, 1)
    }
}

/// Page-aligned, zeroed, device-mapped buffer
///
/// Shared between the driver, the process that mmap'd it and the device,
/// so all access goes through `&self`: word accessors are atomic, byte
/// copies are plain.
#[derive(Debug)]
pub struct CoherentBuffer {
    ptr: NonNull<u8>,
    len: usize,
    bus: u64,
    locked: bool,
    mapper: Arc<dyn DmaMapper>,
}

impl CoherentBuffer {
    /// Allocate `len` bytes and map them through `mapper`.
    ///
    /// # Errors
    ///
    /// Returns error if `len` is zero, the allocation fails, or the
    /// mapping is refused.
    pub fn new(mapper: Arc<dyn DmaMapper>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(DriverError::invalid_argument("zero-length DMA buffer"));
        }
        let layout = Self::layout(len)?;

        // SAFETY: Raw alloc_zeroed for a page-aligned DMA buffer. Invariants:
        // (1) layout has non-zero size and power-of-two align; (2) null is checked below;
        // (3) freed in Drop with the same layout.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| DriverError::allocation_failed(format!("{len} byte DMA buffer")))?;

        // SAFETY: mlock of memory we just allocated; [ptr, ptr+len) is inside the allocation.
        let locked = match unsafe { mlock(ptr.as_ptr().cast(), len) } {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("mlock of {len} byte DMA buffer failed ({e}), continuing unlocked");
                false
            }
        };

        let bus = match mapper.map(ptr.as_ptr() as usize, len) {
            Ok(bus) => bus,
            Err(e) => {
                // SAFETY: cleanup of the allocation above on the error path; nothing mapped it.
                unsafe {
                    if locked {
                        let _ = munlock(ptr.as_ptr().cast(), len);
                    }
                    std::alloc::dealloc(ptr.as_ptr(), layout);
                }
                return Err(e);
            }
        };

        tracing::debug!("Created coherent buffer: {len:#x} bytes at bus {bus:#x}");

        Ok(Self {
            ptr,
            len,
            bus,
            locked,
            mapper,
        })
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| DriverError::allocation_failed(format!("invalid DMA buffer layout: {e}")))
    }

    /// Device-visible address.
    pub const fn bus_address(&self) -> u64 {
        self.bus
    }

    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length buffers are rejected at creation.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host address of the first byte.
    pub fn host_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn at(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "DMA buffer access {offset:#x}+{size} out of bounds ({:#x})",
            self.len
        );
        // SAFETY: offset+size <= len, so the result stays inside the allocation.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    fn word32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "Unaligned DMA buffer access at {offset:#x}");
        // SAFETY: AtomicU32::from_ptr needs a 4-aligned pointer valid for the lifetime of
        // the reference. Alignment is checked above (base is page-aligned), at() checks bounds; the
        // allocation lives as long as &self. All concurrent word access uses atomics.
        unsafe { AtomicU32::from_ptr(self.at(offset, 4).cast()) }
    }

    fn word64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0, "Unaligned DMA buffer access at {offset:#x}");
        // SAFETY: as word32, with 8-byte alignment.
        unsafe { AtomicU64::from_ptr(self.at(offset, 8).cast()) }
    }

    /// Atomic 32-bit load.
    pub fn load_u32(&self, offset: usize) -> u32 {
        self.word32(offset).load(Ordering::Acquire)
    }

    /// Atomic 32-bit store.
    pub fn store_u32(&self, offset: usize, value: u32) {
        self.word32(offset).store(value, Ordering::Release);
    }

    /// Atomic 32-bit OR, returning the previous value.
    pub fn fetch_or_u32(&self, offset: usize, bits: u32) -> u32 {
        self.word32(offset).fetch_or(bits, Ordering::AcqRel)
    }

    /// Atomic 64-bit load.
    pub fn load_u64(&self, offset: usize) -> u64 {
        self.word64(offset).load(Ordering::Acquire)
    }

    /// Atomic 64-bit store.
    pub fn store_u64(&self, offset: usize, value: u64) {
        self.word64(offset).store(value, Ordering::Release);
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn copy_from(&self, offset: usize, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let dst = self.at(offset, src.len());
        // SAFETY: dst valid for src.len() bytes (checked by at()); src is a separate slice.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }

    /// Copy from the buffer at `offset` into `dst`.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        let src = self.at(offset, dst.len());
        // SAFETY: src valid for dst.len() bytes (checked by at()); dst is a separate slice.
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }
}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        self.mapper.unmap(self.bus, self.len);

        // SAFETY: munlock of the range mlock'd in new().
        if self.locked {
            if let Err(e) = unsafe { munlock(self.ptr.as_ptr().cast(), self.len) } {
                tracing::warn!("munlock failed during drop: {e}");
            }
        }

        match Self::layout(self.len) {
            // SAFETY: dealloc must match alloc_zeroed in new(). Invariants: (1) ptr from
            // alloc in new(); (2) same layout; (3) the device mapping is already gone.
            Ok(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
            Err(e) => tracing::error!("Leaking coherent buffer: {e}"),
        }

        tracing::debug!("Freed coherent buffer at bus {:#x}", self.bus);
    }
}

// SAFETY: Send - the buffer owns its allocation; the mapper is Send + Sync.
unsafe impl Send for CoherentBuffer {}

// SAFETY: Sync - shared access is either atomic (word accessors) or a byte copy
// the callers order with the allocation protocol (writer finishes before the
// request that hands the buffer to the device, reader starts after completion).
unsafe impl Sync for CoherentBuffer {}

/// Caller-owned pages mapped one at a time for scatter-gather
#[derive(Debug)]
pub struct PinnedPages {
    mapper: Arc<dyn DmaMapper>,
    user_addr: usize,
    len: usize,
    locked: bool,
    bus_addresses: Vec<u64>,
}

impl PinnedPages {
    /// Lock and map `pages` pages starting at `user_addr`.
    ///
    /// Pages mapped before a failure are unmapped again when the partial
    /// result is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if `user_addr` is null or not page-aligned, or if a
    /// page cannot be mapped.
    pub fn pin(mapper: Arc<dyn DmaMapper>, user_addr: usize, pages: usize) -> Result<Self> {
        if user_addr == 0 || user_addr % PAGE_SIZE != 0 {
            return Err(DriverError::invalid_argument(format!(
                "user buffer {user_addr:#x} is not page-aligned"
            )));
        }

        let len = pages * PAGE_SIZE;
        // SAFETY: mlock only changes residency. The caller's contract on the set-pages
        // arguments guarantees [user_addr, user_addr+len) is a live allocation.
        let locked = match unsafe { mlock(user_addr as *mut std::ffi::c_void, len) } {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("mlock of {pages} user pages failed ({e}), continuing unlocked");
                false
            }
        };

        let mut pinned = Self {
            mapper,
            user_addr,
            len,
            locked,
            bus_addresses: Vec::with_capacity(pages),
        };
        for page in 0..pages {
            let bus = pinned.mapper.map(user_addr + page * PAGE_SIZE, PAGE_SIZE)?;
            pinned.bus_addresses.push(bus);
        }

        tracing::debug!("Pinned {pages} pages at {user_addr:#x}");
        Ok(pinned)
    }

    /// One bus address per page.
    pub fn bus_addresses(&self) -> &[u64] {
        &self.bus_addresses
    }

    /// Number of pinned pages.
    pub fn page_count(&self) -> usize {
        self.bus_addresses.len()
    }

    /// Flush the whole range for the device.
    pub fn sync_for_device(&self) {
        for &bus in &self.bus_addresses {
            self.mapper.sync_for_device(bus, PAGE_SIZE);
        }
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        for &bus in &self.bus_addresses {
            self.mapper.unmap(bus, PAGE_SIZE);
        }
        if self.locked {
            // SAFETY: munlock of the range mlock'd in pin().
            if let Err(e) = unsafe { munlock(self.user_addr as *mut std::ffi::c_void, self.len) } {
                tracing::warn!("munlock of user pages failed: {e}");
            }
        }
        tracing::debug!("Released {} pinned pages", self.bus_addresses.len());
    }
}

/// Pages needed for `bytes` bytes.
#[must_use]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
