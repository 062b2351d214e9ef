//! mmap endpoints
//!
//! Three endpoints hand out driver-allocated coherent buffers:
//!
//! | Endpoint       | Buffer                                   |
//! |----------------|------------------------------------------|
//! | `pre_process`  | image in, filtered in place by the groups |
//! | `post_process` | result written back by the process        |
//! | `metrics`      | [`ProcessMetrics`](crate::layout::ProcessMetrics) |
//!
//! Each mmap allocates a fresh buffer and records it in the caller's
//! resource record.

use crate::device::Device;
use crate::dma::CoherentBuffer;
use crate::error::{DriverError, Result};
use crate::layout::MetricsView;
use crate::table::{self, Pid};
use std::fmt;
use std::sync::Arc;

/// Which buffer an endpoint provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmapKind {
    /// Source image, processed in place
    PreProcess,
    /// Destination image
    PostProcess,
    /// Per-process metrics block
    Metrics,
}

impl MmapKind {
    /// All endpoints.
    pub const ALL: [Self; 3] = [Self::PreProcess, Self::PostProcess, Self::Metrics];

    /// Endpoint name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PreProcess => "pre_process_mmap",
            Self::PostProcess => "post_process_mmap",
            Self::Metrics => "shared_repo_mmap",
        }
    }
}

impl fmt::Display for MmapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One mmap endpoint of a device
#[derive(Debug, Clone)]
pub struct MmapEndpoint {
    device: Arc<Device>,
    kind: MmapKind,
}

impl MmapEndpoint {
    pub(crate) const fn new(device: Arc<Device>, kind: MmapKind) -> Self {
        Self { device, kind }
    }

    /// Buffer kind.
    #[must_use]
    pub const fn kind(&self) -> MmapKind {
        self.kind
    }

    /// Open the endpoint for `pid`.
    #[must_use]
    pub fn open(&self, pid: Pid) -> EndpointFile {
        tracing::debug!("{} opened by pid {pid}", self.kind);
        EndpointFile {
            device: Arc::clone(&self.device),
            kind: self.kind,
            pid,
        }
    }
}

/// Open endpoint
#[derive(Debug)]
pub struct EndpointFile {
    device: Arc<Device>,
    kind: MmapKind,
    pid: Pid,
}

impl EndpointFile {
    /// Allocate a buffer of `len` bytes and register it for the process.
    ///
    /// Mapping the same endpoint twice replaces the registered buffer; the
    /// previous one lives on until the process drops its mapping.
    ///
    /// # Errors
    ///
    /// Returns error if `len` is not the configured window size, the
    /// process has no record, or the allocation fails.
    pub fn mmap(&self, len: usize) -> Result<MappedBuffer> {
        let expected = self.device.config().mmap_size;
        if len != expected {
            return Err(DriverError::invalid_argument(format!(
                "{} maps exactly {expected} bytes, not {len}",
                self.kind
            )));
        }

        let buffer = Arc::new(CoherentBuffer::new(Arc::clone(self.device.dma()), len)?);

        let mut records = self.device.table().lock();
        let record = table::find(&mut records, self.pid)?;
        let slot = match self.kind {
            MmapKind::PreProcess => &mut record.pre_process,
            MmapKind::PostProcess => &mut record.post_process,
            MmapKind::Metrics => &mut record.metrics,
        };
        if slot.replace(Arc::clone(&buffer)).is_some() {
            tracing::warn!("pid {}: {} mapped again, replacing buffer", self.pid, self.kind);
        }

        tracing::debug!(
            "pid {}: {} mapped at bus {:#x}",
            self.pid,
            self.kind,
            buffer.bus_address()
        );
        Ok(MappedBuffer {
            kind: self.kind,
            buffer,
        })
    }
}

impl Drop for EndpointFile {
    fn drop(&mut self) {
        tracing::debug!("{} released by pid {}", self.kind, self.pid);
    }
}

/// Process-side view of an mmap'd buffer
#[derive(Debug, Clone)]
pub struct MappedBuffer {
    kind: MmapKind,
    buffer: Arc<CoherentBuffer>,
}

impl MappedBuffer {
    /// Endpoint it came from.
    #[must_use]
    pub const fn kind(&self) -> MmapKind {
        self.kind
    }

    /// Underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &CoherentBuffer {
        &self.buffer
    }

    /// Metrics view, for buffers from the metrics endpoint.
    ///
    /// # Errors
    ///
    /// Returns error for the image endpoints.
    pub fn metrics(&self) -> Result<MetricsView<'_>> {
        match self.kind {
            MmapKind::Metrics => Ok(MetricsView::new(&self.buffer)),
            other => Err(DriverError::invalid_argument(format!(
                "{other} does not hold metrics"
            ))),
        }
    }
}
