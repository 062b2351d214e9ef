//! Register and memory access layer
//!
//! Every access to the fabric is a 32-bit read or write against one of its
//! two BARs: BAR0 (scheduler cores, interrupt manager, timer) and BAR1 (the
//! BRAM window). [`RegisterBus`] is that primitive; everything above it is
//! written against the trait so the software fabric can stand in for the
//! hardware.
//!
//! Real BARs are mapped from `/sys/bus/pci/devices/{addr}/resourceN` with
//! rustix (no libc).

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{DriverError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// 32-bit register access to one BAR.
pub trait RegisterBus: std::fmt::Debug + Send + Sync {
    /// Read the 32-bit word at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit word at `offset`.
    fn write32(&self, offset: usize, value: u32);

    /// Size of the BAR in bytes.
    fn size(&self) -> usize;

    /// Read a 64-bit value stored as two words, low word first.
    fn read64(&self, offset: usize) -> u64 {
        let lo = u64::from(self.read32(offset));
        let hi = u64::from(self.read32(offset + 4));
        (hi << 32) | lo
    }

    /// Write a 64-bit value as two words, low word first.
    #[allow(clippy::cast_possible_truncation)]
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Write `value` to register `offset` of the block at `base`.
pub fn write_remote_register(bus: &dyn RegisterBus, base: usize, offset: usize, value: u32) {
    tracing::trace!("Write u32 @ {:#x} = {value:#x}", base + offset);
    bus.write32(base + offset, value);
}

/// Read register `offset` of the block at `base`.
pub fn read_remote_register(bus: &dyn RegisterBus, base: usize, offset: usize) -> u32 {
    let value = bus.read32(base + offset);
    tracing::trace!("Read u32 @ {:#x} = {value:#x}", base + offset);
    value
}

/// Read a free-running 64-bit counter exposed as two 32-bit halves.
///
/// Re-reads the upper half so a carry between the two reads is not
/// mistaken for a 4-billion-cycle jump.
pub fn read_split_counter(bus: &dyn RegisterBus, lower: usize, upper: usize) -> u64 {
    loop {
        let hi = bus.read32(upper);
        let lo = bus.read32(lower);
        if bus.read32(upper) == hi {
            return (u64::from(hi) << 32) | u64::from(lo);
        }
    }
}

/// Memory-mapped PCIe BAR
///
/// Bounds-checked volatile access; the mapping is released on drop.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    pcie_address: String,
    bar_index: usize,
}

impl MmapRegion {
    /// Map BAR `bar_index` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns error if the resource file is missing, cannot be opened,
    /// reports a zero size, or mmap fails.
    pub fn new(pcie_address: &str, bar_index: usize) -> Result<Self> {
        Self::from_sysfs(&Path::new("/sys/bus/pci/devices").join(pcie_address), bar_index)
    }

    /// Map `resource{bar_index}` below a sysfs device directory.
    ///
    /// # Errors
    ///
    /// Same as [`MmapRegion::new`].
    pub fn from_sysfs(device_dir: &Path, bar_index: usize) -> Result<Self> {
        let pcie_address = device_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let resource = device_dir.join(format!("resource{bar_index}"));
        let path = resource.display();

        tracing::debug!("Mapping PCIe BAR: {path}");

        if !resource.exists() {
            return Err(DriverError::device_not_found(&resource));
        }

        let file = OpenOptions::new().read(true).write(true).open(&resource)?;

        // Truncation acceptable: BAR sizes fit in usize on 64-bit (our only target)
        #[allow(clippy::cast_possible_truncation)]
        let size = file.metadata()?.len() as usize;

        if size == 0 {
            return Err(DriverError::invalid_state(format!(
                "BAR{bar_index} of {pcie_address} has size 0 (device not enabled?)"
            )));
        }

        // SAFETY: mmap of a sysfs PCI resource file.
        // - fd is valid (just opened) and kept alive in `_file` for the mapping's lifetime
        // - size is non-zero and equals the resource length
        // - MAP_SHARED + READ|WRITE is what sysfs resource files require for MMIO
        // - unmapped exactly once in Drop
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| DriverError::dma_map_failed(format!("mmap {path} failed: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| DriverError::dma_map_failed(format!("mmap {path} returned null")))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({} KB at {ptr:p})",
            size / 1024,
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            pcie_address,
            bar_index,
        })
    }

    /// PCIe address of the mapped device
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// BAR index
    #[must_use]
    pub const fn bar_index(&self) -> usize {
        self.bar_index
    }
}

impl RegisterBus for MmapRegion {
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap in new(), valid for self.size; (2) offset+4 <= size;
        // (3) registers are 4-byte aligned.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_volatile(value);
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping BAR{} for {}", self.bar_index, self.pcie_address);

        // SAFETY: ptr/size are exactly what mmap returned in new(); Drop runs once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send - MmapRegion owns its mapping; mmap'd memory is process-wide.
unsafe impl Send for MmapRegion {}

// SAFETY: Sync - every access is a single bounds-checked volatile word access,
// which the device serialises; no other interior state is mutated.
unsafe impl Sync for MmapRegion {}

/// BAR backed by host memory
///
/// Plain words with no side effects. Backs the BRAM window when running
/// against the software fabric, and is the storage behind the fabric's own
/// control registers.
#[derive(Debug)]
pub struct SimulatedBar {
    words: Box<[AtomicU32]>,
}

impl SimulatedBar {
    /// Zero-filled BAR of `size` bytes (rounded up to whole words).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "Unaligned register offset {offset:#x}");
        self.words
            .get(offset / 4)
            .unwrap_or_else(|| panic!("Register offset {offset:#x} out of bounds"))
    }
}

impl RegisterBus for SimulatedBar {
    fn read32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release);
    }

    fn size(&self) -> usize {
        self.words.len() * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_bar_reads_back_writes() {
        let bar = SimulatedBar::new(64);
        bar.write32(0x10, 0xdead_beef);
        assert_eq!(bar.read32(0x10), 0xdead_beef);
        assert_eq!(bar.read32(0x14), 0);
        assert_eq!(bar.size(), 64);
    }

    #[test]
    fn split_64_bit_access_is_low_word_first() {
        let bar = SimulatedBar::new(16);
        bar.write64(0x8, 0x0123_4567_89ab_cdef);
        assert_eq!(bar.read32(0x8), 0x89ab_cdef);
        assert_eq!(bar.read32(0xC), 0x0123_4567);
        assert_eq!(bar.read64(0x8), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn remote_register_helpers_add_base() {
        let bar = SimulatedBar::new(0x200);
        write_remote_register(&bar, 0x100, 0x28, 64);
        assert_eq!(bar.read32(0x128), 64);
        assert_eq!(read_remote_register(&bar, 0x100, 0x28), 64);
    }

    #[test]
    fn split_counter_combines_halves() {
        let bar = SimulatedBar::new(16);
        bar.write32(0x0, 7);
        bar.write32(0x4, 2);
        assert_eq!(read_split_counter(&bar, 0x0, 0x4), (2 << 32) | 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn simulated_bar_rejects_out_of_bounds() {
        let bar = SimulatedBar::new(8);
        bar.read32(8);
    }

    #[test]
    #[ignore] // Requires hardware
    fn test_map_control_bar() {
        let region = MmapRegion::new("0000:01:00.0", 0).expect("BAR0 mapping");
        assert!(region.size() >= sobel_chip::bar::bar0::SIZE);
    }
}
