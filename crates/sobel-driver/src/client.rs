//! Userspace side of the contract
//!
//! One [`AcceleratorClient`] per requesting thread. Processing an image
//! goes through the same steps a process talking to the char device would:
//!
//! ```text
//! open device + 3 endpoints, mmap each
//! metrics.image_info = geometry
//! copy image ──▶ pre-process buffer
//! ioctl REQUEST_ACCELERATOR_ACCESS          (may block for a free group)
//!   SG granted? stage into own pages, SET_PAGES, REQUEST_ACCELERATOR_SG_ACCESS
//! spin until accel_completed == accel_occupied
//!   SG granted? UNMAP_PAGES, result from own pages
//! copy result ──▶ post-process buffer
//! snapshot metrics, zero both masks
//! ```

use crate::device::{Device, DeviceHandle, Ioctl, IoctlReply};
use crate::dma::PAGE_SIZE;
use crate::endpoint::{EndpointFile, MappedBuffer, MmapKind};
use crate::error::{DriverError, Result};
use crate::layout::{ImageInfo, MetricsView, ProcessMetrics, Timestamp};
use crate::policy::{AllocationPlan, BYTES_PER_PIXEL};
use crate::sg::SetPagesArgs;
use crate::table::Pid;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

/// RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    rows: u32,
    columns: u32,
    data: Vec<u8>,
}

impl Image {
    /// Wrap raw RGBA8 pixels.
    ///
    /// # Errors
    ///
    /// Returns error if `data` does not hold exactly `rows * columns` pixels.
    pub fn new(rows: u32, columns: u32, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(rows, columns);
        if data.len() != expected {
            return Err(DriverError::invalid_argument(format!(
                "{rows}x{columns} image needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            columns,
            data,
        })
    }

    /// Deterministic image with edges in both directions.
    #[must_use]
    pub fn test_pattern(rows: u32, columns: u32) -> Self {
        let mut data = Vec::with_capacity(byte_len(rows, columns));
        for y in 0..rows {
            for x in 0..columns {
                let block = ((x / 8 + y / 8) % 2) * 160;
                // Always below 256
                #[allow(clippy::cast_possible_truncation)]
                let v = (block + (x + 2 * y) % 64) as u8;
                data.extend_from_slice(&[v, v / 2, 255 - v, 0xFF]);
            }
        }
        Self {
            rows,
            columns,
            data,
        }
    }

    /// Rows.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Columns.
    #[must_use]
    pub const fn columns(&self) -> u32 {
        self.columns
    }

    /// Pixel bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn byte_len(rows: u32, columns: u32) -> usize {
    (u64::from(rows) * u64::from(columns) * BYTES_PER_PIXEL) as usize
}

/// Page-aligned buffer owned by the client, used for SG transfers
#[derive(Debug)]
pub struct UserBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl UserBuffer {
    /// Zeroed buffer of at least `len` bytes, rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns error if the allocation fails.
    pub fn new(len: usize) -> Result<Self> {
        let len = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size and page alignment; null is checked;
        // freed in Drop with the same layout.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| DriverError::allocation_failed(format!("{len} byte user buffer")))?;
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| DriverError::allocation_failed(format!("invalid user buffer layout: {e}")))
    }

    /// Size in bytes (whole pages).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start of the buffer.
    #[must_use]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr valid for len bytes, owned by self; &self excludes writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr valid for len bytes; &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for UserBuffer {
    fn drop(&mut self) {
        match Self::layout(self.len) {
            // SAFETY: ptr came from alloc_zeroed with this layout.
            Ok(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
            Err(e) => tracing::error!("Leaking user buffer: {e}"),
        }
    }
}

// SAFETY: owns its allocation; aliasing is governed by &/&mut self.
unsafe impl Send for UserBuffer {}

/// Outcome of one request
#[derive(Debug, Clone)]
pub struct Processed {
    /// Filtered image
    pub image: Image,
    /// Groups that served the request
    pub plan: AllocationPlan,
    /// Metrics block as it stood at completion
    pub metrics: ProcessMetrics,
}

/// Device handle plus the three mapped endpoints of one thread
#[derive(Debug)]
pub struct AcceleratorClient {
    pre_process: MappedBuffer,
    post_process: MappedBuffer,
    metrics: MappedBuffer,
    _files: Vec<EndpointFile>,
    handle: DeviceHandle,
}

impl AcceleratorClient {
    /// Open `device` as `pid` and map all three endpoints.
    ///
    /// # Errors
    ///
    /// Returns error if the open or any mmap fails.
    pub fn connect(device: &Arc<Device>, pid: Pid) -> Result<Self> {
        let handle = device.open(pid)?;
        let size = device.config().mmap_size;

        let mut files = Vec::with_capacity(MmapKind::ALL.len());
        let mut mapped = Vec::with_capacity(MmapKind::ALL.len());
        for kind in MmapKind::ALL {
            let file = device.endpoint(kind).open(pid);
            mapped.push(file.mmap(size)?);
            files.push(file);
        }
        let [pre_process, post_process, metrics]: [MappedBuffer; 3] = mapped
            .try_into()
            .map_err(|_| DriverError::invalid_state("endpoint count mismatch"))?;

        Ok(Self {
            pre_process,
            post_process,
            metrics,
            _files: files,
            handle,
        })
    }

    /// Pid this client runs as.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.handle.pid()
    }

    /// Post-process buffer as last written.
    #[must_use]
    pub fn post_process(&self) -> &MappedBuffer {
        &self.post_process
    }

    /// Metrics buffer shared with the driver.
    #[must_use]
    pub fn metrics(&self) -> &MappedBuffer {
        &self.metrics
    }

    /// Filter `image` on the fabric.
    ///
    /// # Errors
    ///
    /// Returns error if the image does not fit the mmap windows or an
    /// ioctl fails. An SG grant that could not be started is handed back
    /// and the masks are cleared, so the client stays usable.
    pub fn process(&self, image: &Image) -> Result<Processed> {
        let view = self.metrics.metrics()?;
        let device = self.handle.device();
        let bytes = image.byte_len();
        if bytes == 0 || bytes > self.pre_process.buffer().len() {
            return Err(DriverError::invalid_argument(format!(
                "{}x{} image does not fit a {} byte window",
                image.rows(),
                image.columns(),
                self.pre_process.buffer().len()
            )));
        }

        view.set_timestamp(Timestamp::TotalStart, device.read_timer());
        view.set_timestamp(Timestamp::PreparationStart, device.read_timer());
        view.set_image_info(ImageInfo::new(image.rows(), image.columns()));
        view.set_timestamp(Timestamp::PreparationEnd, device.read_timer());

        view.set_timestamp(Timestamp::LoadStart, device.read_timer());
        self.pre_process.buffer().copy_from(0, image.data());
        view.set_timestamp(Timestamp::LoadEnd, device.read_timer());

        view.set_timestamp(Timestamp::SleepStart, device.read_timer());
        let plan = match self.handle.ioctl(Ioctl::RequestAcceleratorAccess)? {
            IoctlReply::Granted(plan) => plan,
            IoctlReply::Done => return Err(DriverError::invalid_state("allocation granted nothing")),
        };

        let mut result = vec![0u8; bytes];
        if plan.uses_scatter_gather() {
            let mut source = UserBuffer::new(bytes)?;
            let mut destination = UserBuffer::new(bytes)?;
            source.as_mut_slice()[..bytes].copy_from_slice(image.data());
            self.run_scatter_gather(&view, &source, &mut destination)?;
            result.copy_from_slice(&destination.as_slice()[..bytes]);
        } else {
            wait_for_completion(&view);
            self.pre_process.buffer().copy_to(0, &mut result);
        }

        view.set_timestamp(Timestamp::SaveStart, device.read_timer());
        self.post_process.buffer().copy_from(0, &result);
        view.set_timestamp(Timestamp::SaveEnd, device.read_timer());
        view.set_timestamp(Timestamp::TotalEnd, device.read_timer());

        let metrics = view.snapshot();
        view.reset_masks();

        tracing::debug!(
            "pid {}: {}x{} done on {:#04x}",
            self.pid(),
            image.rows(),
            image.columns(),
            plan.groups().bits()
        );
        Ok(Processed {
            image: Image::new(image.rows(), image.columns(), result)?,
            plan,
            metrics,
        })
    }

    /// SET_PAGES, start, wait, UNMAP_PAGES. The pages are unmapped before
    /// returning whenever SET_PAGES succeeded, so both buffers may be
    /// freed afterwards. If the group never starts the grant is aborted.
    fn run_scatter_gather(
        &self,
        view: &MetricsView<'_>,
        source: &UserBuffer,
        destination: &mut UserBuffer,
    ) -> Result<()> {
        let device = self.handle.device();

        view.set_timestamp(Timestamp::SetPagesStart, device.read_timer());
        // SAFETY: both buffers are page-aligned, cover the image rounded up to
        // pages, and outlive the UNMAP_PAGES below; neither is touched until then.
        let args = unsafe {
            SetPagesArgs::new(self.pid(), source.as_mut_ptr(), destination.as_mut_ptr())
        };
        if let Err(e) = self.handle.ioctl(Ioctl::SetPages(args)) {
            self.abort_scatter_gather(view);
            return Err(e);
        }
        view.set_timestamp(Timestamp::SetPagesEnd, device.read_timer());

        let started = self.handle.ioctl(Ioctl::RequestAcceleratorSgAccess);
        if started.is_ok() {
            wait_for_completion(view);
        }

        view.set_timestamp(Timestamp::UnmapPagesStart, device.read_timer());
        let unmapped = self.handle.ioctl(Ioctl::UnmapPages);
        view.set_timestamp(Timestamp::UnmapPagesEnd, device.read_timer());

        if let Err(e) = started {
            self.abort_scatter_gather(view);
            return Err(e);
        }
        unmapped?;
        Ok(())
    }

    /// Return an SG grant that never started and clear the masks it set.
    fn abort_scatter_gather(&self, view: &MetricsView<'_>) {
        if let Err(e) = self.handle.ioctl(Ioctl::AbortSgAccess) {
            tracing::warn!("pid {}: could not hand back SG grant: {e}", self.pid());
        }
        view.reset_masks();
    }
}

/// Spin until every granted group has completed.
fn wait_for_completion(view: &MetricsView<'_>) {
    loop {
        let occupied = view.accel_occupied();
        if !occupied.is_empty() && view.accel_completed() == occupied {
            return;
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_rejects_wrong_length() {
        assert!(Image::new(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            Image::new(2, 2, vec![0; 15]),
            Err(DriverError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_pattern_is_opaque_and_sized() {
        let image = Image::test_pattern(13, 7);
        assert_eq!(image.byte_len(), 13 * 7 * 4);
        assert!(image.data().chunks_exact(4).all(|p| p[3] == 0xFF));
        assert_eq!(image, Image::test_pattern(13, 7));
    }

    #[test]
    fn user_buffer_is_page_aligned_and_rounded() {
        let mut buffer = UserBuffer::new(5000).unwrap();
        assert_eq!(buffer.len(), 2 * PAGE_SIZE);
        assert_eq!(buffer.as_mut_ptr() as usize % PAGE_SIZE, 0);
        buffer.as_mut_slice()[4999] = 7;
        assert_eq!(buffer.as_slice()[4999], 7);
        assert_eq!(UserBuffer::new(0).unwrap().len(), PAGE_SIZE);
    }
}
