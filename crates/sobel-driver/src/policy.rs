//! Allocation policies and row partitioning
//!
//! A policy looks at the set of free groups and decides which ones one
//! request gets. Under greedy allocation the image is then cut into
//! horizontal bands, one per group:
//!
//! ```text
//! rows = 13, segments = 6        segment_size = 2, remainder = 1
//!
//!   direct-0    rows  0..3   (3)  byte offset 0
//!   direct-1    rows  3..5   (2)  byte offset 3 * cols * 4
//!   indirect-0  rows  5..7   (2)  ...
//!   indirect-1  rows  7..9   (2)
//!   indirect-2  rows  9..11  (2)
//!   indirect-3  rows 11..13  (2)
//! ```

use sobel_chip::{AcceleratorGroup, GroupMask};
use std::fmt;
use std::str::FromStr;

/// Bytes per pixel in every buffer the fabric touches (RGBA8).
pub const BYTES_PER_PIXEL: u64 = 4;

/// How free groups are handed out to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationPolicy {
    /// First free group in priority order serves the whole image
    #[default]
    BestAvailable,
    /// Every free direct/indirect group at once, SG alone as fallback
    Greedy,
}

impl AllocationPolicy {
    /// Select groups out of `free` and partition `rows` across them.
    ///
    /// `None` when nothing usable is free; the caller goes back to waiting.
    /// Also `None` when the image size overflows [`image_bytes`], which
    /// callers must rule out first.
    #[must_use]
    pub fn plan(self, free: GroupMask, rows: u32, columns: u32) -> Option<AllocationPlan> {
        // Every band offset is bounded by the total
        image_bytes(rows, columns)?;

        let selected: Vec<AcceleratorGroup> = match self {
            Self::BestAvailable => free.iter().take(1).collect(),
            Self::Greedy => {
                let contiguous: Vec<_> = AcceleratorGroup::CONTIGUOUS
                    .into_iter()
                    .filter(|g| free.contains(*g))
                    .collect();
                if contiguous.is_empty() && free.contains(AcceleratorGroup::ScatterGather) {
                    vec![AcceleratorGroup::ScatterGather]
                } else {
                    contiguous
                }
            }
        };

        if selected.is_empty() {
            return None;
        }

        let segments = partition_rows(rows, selected.len())
            .into_iter()
            .zip(selected)
            .scan(0u64, |offset, (rows, group)| {
                let segment = Segment {
                    group,
                    rows,
                    byte_offset: *offset,
                };
                *offset += u64::from(rows) * u64::from(columns) * BYTES_PER_PIXEL;
                Some(segment)
            })
            .collect();

        Some(AllocationPlan { segments })
    }

    /// Lower-case name as accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BestAvailable => "best-available",
            Self::Greedy => "greedy",
        }
    }
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllocationPolicy {
    type Err = crate::error::DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-available" | "best_available" | "best" => Ok(Self::BestAvailable),
            "greedy" => Ok(Self::Greedy),
            other => Err(crate::error::DriverError::invalid_argument(format!(
                "unknown allocation policy '{other}' (expected greedy or best-available)"
            ))),
        }
    }
}

/// Size in bytes of a `rows` × `columns` RGBA8 image, `None` on overflow.
#[must_use]
pub fn image_bytes(rows: u32, columns: u32) -> Option<u64> {
    u64::from(rows)
        .checked_mul(u64::from(columns))?
        .checked_mul(BYTES_PER_PIXEL)
}

/// Split `rows` into `segments` bands.
///
/// Every band gets `rows / segments`; the first `rows % segments` bands get
/// one more. Bands of zero rows are possible when `rows < segments`.
///
/// # Panics
///
/// Panics if `segments` is zero.
#[must_use]
pub fn partition_rows(rows: u32, segments: usize) -> Vec<u32> {
    assert!(segments > 0, "cannot partition into zero segments");
    // At most GROUP_COUNT segments
    #[allow(clippy::cast_possible_truncation)]
    let count = segments as u32;
    let segment_size = rows / count;
    let remainder = rows - segment_size * count;
    (0..count)
        .map(|i| segment_size + u32::from(i < remainder))
        .collect()
}

/// One band of the image assigned to one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Group processing this band
    pub group: AcceleratorGroup,
    /// Rows in the band
    pub rows: u32,
    /// Byte offset of the band's first row in the pre-process buffer
    pub byte_offset: u64,
}

/// Groups granted to one request, in selection order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    /// One entry per selected group
    pub segments: Vec<Segment>,
}

impl AllocationPlan {
    /// Number of segments (`image_segments`).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Selected groups as a mask (`accel_occupied` after programming).
    #[must_use]
    pub fn groups(&self) -> GroupMask {
        self.segments.iter().map(|s| s.group).collect()
    }

    /// Whether the scatter-gather group was granted.
    #[must_use]
    pub fn uses_scatter_gather(&self) -> bool {
        self.groups().contains(AcceleratorGroup::ScatterGather)
    }

    /// Row count per segment, in selection order.
    #[must_use]
    pub fn segment_rows(&self) -> Vec<u32> {
        self.segments.iter().map(|s| s.rows).collect()
    }
}
