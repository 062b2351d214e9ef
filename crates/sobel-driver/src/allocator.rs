//! REQUEST_ACCELERATOR_ACCESS
//!
//! ```text
//! wait until any group is free ──▶ table lock ──▶ find record
//!        ▲                                          │
//!        │                                          ▼
//!        │                              geometry / pre-process size
//!        │ nothing usable                           │
//!        └──────────────────────────── policy.plan(free mask)
//!                                                   │
//!                  for each segment, in selection order:
//!                    sleep_time_end = timer
//!                    group lock: pid, busy, summary, accel_occupied
//!                    non-SG: src/dst, columns, rows, START
//! ```
//!
//! There is no timeout: if no completion ever frees a group, the caller
//! waits forever.

use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::layout::{MetricsView, Timestamp};
use crate::mmio::write_remote_register;
use crate::policy::{image_bytes, AllocationPlan, Segment};
use crate::table::{self, Pid};
use sobel_chip::regs::scheduler;
use sobel_chip::{AcceleratorGroup, GroupKind};
use std::sync::Arc;

impl Device {
    /// Allocate groups for `pid`'s current image and start the
    /// contiguous ones.
    ///
    /// The SG group, if granted, is only claimed here; it starts on
    /// REQUEST_ACCELERATOR_SG_ACCESS once its page lists exist.
    ///
    /// # Errors
    ///
    /// Returns error if `pid` has no record, its metrics (or, for
    /// contiguous groups, pre-process) buffer is not mapped, or the image
    /// geometry is empty, overflows or is larger than the pre-process
    /// buffer. Nothing is claimed on error.
    pub fn request_accelerator_access(&self, pid: Pid) -> Result<AllocationPlan> {
        loop {
            self.wait_queue
                .wait_until(|| !self.bram.free_mask().is_empty());

            let mut records = self.table.lock();
            let record = table::find(&mut records, pid)?;
            let metrics = Arc::clone(
                record
                    .metrics
                    .as_ref()
                    .ok_or(DriverError::NotMapped { region: "metrics" })?,
            );
            let view = MetricsView::new(&metrics);

            let info = view.image_info();
            if info.rows == 0 || info.columns == 0 {
                return Err(DriverError::invalid_argument(format!(
                    "image geometry {}x{} is empty",
                    info.rows, info.columns
                )));
            }
            let bytes = image_bytes(info.rows, info.columns).ok_or_else(|| {
                DriverError::invalid_argument(format!(
                    "image geometry {}x{} overflows",
                    info.rows, info.columns
                ))
            })?;
            if let Some(buffer) = &record.pre_process {
                if bytes > buffer.len() as u64 {
                    return Err(DriverError::invalid_argument(format!(
                        "{}x{} image ({bytes} bytes) exceeds the {} byte pre-process buffer",
                        info.rows,
                        info.columns,
                        buffer.len()
                    )));
                }
            }

            let free = self.bram.free_mask();
            let Some(plan) = self.config.policy.plan(free, info.rows, info.columns) else {
                // Another allocator took the last usable group first
                tracing::trace!("pid {pid}: nothing usable in free mask {:#04x}", free.bits());
                continue;
            };

            let pre_process = if plan.segments.iter().any(|s| !is_sg(s.group)) {
                Some(
                    record
                        .pre_process
                        .as_ref()
                        .ok_or(DriverError::NotMapped { region: "pre-process" })?
                        .bus_address(),
                )
            } else {
                None
            };

            // Segment count fits in u32: at most GROUP_COUNT
            #[allow(clippy::cast_possible_truncation)]
            view.set_image_segments(plan.segment_count() as u32);

            for segment in &plan.segments {
                view.set_timestamp(Timestamp::SleepEnd, self.read_timer());
                {
                    let _guard = self.group_lock(segment.group);
                    self.bram.claim(segment.group, pid.get());
                    view.mark_occupied(segment.group);
                }
                if let Some(base) = pre_process.filter(|_| !is_sg(segment.group)) {
                    self.program_group(segment, base, info.columns);
                }
            }
            record.sg_granted = plan.uses_scatter_gather();

            tracing::info!(
                "pid {pid}: granted {} group(s) {:#04x} for {}x{} under {}",
                plan.segment_count(),
                plan.groups().bits(),
                info.rows,
                info.columns,
                self.config.policy
            );
            return Ok(plan);
        }
    }

    /// Point `segment`'s group at its band of the pre-process buffer and
    /// start it. Source and destination are the same band.
    #[allow(clippy::cast_possible_truncation)]
    fn program_group(&self, segment: &Segment, buffer_bus: u64, columns: u32) {
        let base = segment.group.scheduler_base();
        let address = buffer_bus + segment.byte_offset;
        let control = self.control.as_ref();

        tracing::debug!(
            "{}: {} rows at {address:#x} ({:?})",
            segment.group,
            segment.rows,
            segment.group.kind()
        );

        write_remote_register(control, base, scheduler::SOURCE_ADDRESS_LO, address as u32);
        write_remote_register(control, base, scheduler::SOURCE_ADDRESS_HI, (address >> 32) as u32);
        write_remote_register(control, base, scheduler::DESTINATION_ADDRESS_LO, address as u32);
        write_remote_register(
            control,
            base,
            scheduler::DESTINATION_ADDRESS_HI,
            (address >> 32) as u32,
        );
        write_remote_register(control, base, scheduler::IMAGE_COLUMNS, columns);
        write_remote_register(control, base, scheduler::IMAGE_ROWS, segment.rows);
        write_remote_register(control, base, scheduler::AP_CTRL, scheduler::ap_ctrl::START);
    }
}

fn is_sg(group: AcceleratorGroup) -> bool {
    group.kind() == GroupKind::ScatterGather
}
