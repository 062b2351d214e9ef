//! Per-process resource table
//!
//! One record per open handle, keyed by pid. Records own the process's
//! coherent buffers and its SG mapping; dropping a record releases them.
//!
//! The table lock is the outermost lock in the driver. Allocation and
//! interrupt handling both look a record up and act on it inside the same
//! critical section, so a record cannot disappear between the two.

use crate::dma::{CoherentBuffer, PinnedPages};
use crate::error::{DriverError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Process identifier (0 is reserved for "no owner")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u32);

impl Pid {
    /// Wrap a raw pid.
    ///
    /// # Errors
    ///
    /// Returns error for pid 0, which the status block uses for "free".
    pub fn new(raw: u32) -> Result<Self> {
        if raw == 0 {
            return Err(DriverError::invalid_argument("pid 0 is reserved"));
        }
        Ok(Self(raw))
    }

    /// Pid of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        // A live thread never has tid 0
        Self(rustix::thread::gettid().as_raw_nonzero().get().unsigned_abs())
    }

    /// Raw value as stored in the status block.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source and destination pages of one SG transfer
#[derive(Debug)]
pub struct SgMapping {
    /// Pages the fabric reads
    pub source: PinnedPages,
    /// Pages the fabric writes
    pub destination: PinnedPages,
}

impl SgMapping {
    /// Pages per list.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.source.page_count()
    }
}

/// Everything the driver holds on behalf of one process
#[derive(Debug)]
pub struct ProcessResourceRecord {
    /// Owner
    pub pid: Pid,
    /// Pre-process (source, processed in place) buffer
    pub pre_process: Option<Arc<CoherentBuffer>>,
    /// Post-process buffer
    pub post_process: Option<Arc<CoherentBuffer>>,
    /// Metrics buffer
    pub metrics: Option<Arc<CoherentBuffer>>,
    /// SG mapping between SET_PAGES and UNMAP_PAGES
    pub sg: Option<SgMapping>,
    /// SG group claimed by the allocator and not yet started
    pub sg_granted: bool,
}

impl ProcessResourceRecord {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            pre_process: None,
            post_process: None,
            metrics: None,
            sg: None,
            sg_granted: false,
        }
    }
}

/// Records of all open handles
#[derive(Debug, Default)]
pub struct ResourceTable {
    records: Mutex<HashMap<Pid, ProcessResourceRecord>>,
}

/// Table held locked
pub type TableGuard<'a> = MutexGuard<'a, HashMap<Pid, ProcessResourceRecord>>;

impl ResourceTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the table lock.
    ///
    /// A panic while holding it leaves the map itself intact, so poisoning
    /// is ignored.
    pub fn lock(&self) -> TableGuard<'_> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the record for `pid`.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` already has a record.
    pub fn insert(&self, pid: Pid) -> Result<()> {
        let mut records = self.lock();
        if records.contains_key(&pid) {
            return Err(DriverError::AlreadyOpen { pid: pid.get() });
        }
        records.insert(pid, ProcessResourceRecord::new(pid));
        tracing::debug!("Resource record created for pid {pid}");
        Ok(())
    }

    /// Drop `pid`'s record and everything it owns.
    ///
    /// Buffers still mmap'd by the process stay alive until it lets go of
    /// them. Returns whether a record existed.
    pub fn remove(&self, pid: Pid) -> bool {
        // Release outside the lock: unmapping pages can be slow
        let record = self.lock().remove(&pid);
        match record {
            Some(record) => {
                if record.sg.is_some() {
                    tracing::warn!("pid {pid} closed with SG pages still mapped");
                }
                drop(record);
                tracing::debug!("Resource record released for pid {pid}");
                true
            }
            None => {
                tracing::warn!("Release of pid {pid} without a resource record");
                false
            }
        }
    }

    /// Whether `pid` has a record.
    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Look up `pid` in a locked table.
///
/// # Errors
///
/// A missing record after open is a logic error; it is logged and returned.
pub fn find<'a>(
    records: &'a mut TableGuard<'_>,
    pid: Pid,
) -> Result<&'a mut ProcessResourceRecord> {
    records.get_mut(&pid).ok_or_else(|| {
        tracing::error!("No resource record for pid {pid}");
        DriverError::NoRecord { pid: pid.get() }
    })
}
