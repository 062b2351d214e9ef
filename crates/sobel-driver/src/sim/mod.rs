//! Software fabric
//!
//! Stands in for the FPGA so the whole driver can run in CI. It implements
//! BAR0 the way the scheduler cores, interrupt manager and timer behave,
//! uses a plain [`SimulatedBar`] as the BRAM window and a [`SoftIommu`] for
//! DMA:
//!
//! ```text
//! driver writes AP_CTRL.START ──▶ job queued for the group
//!                                      │  Manual: complete(group)
//!                                      │  Auto:   worker thread
//!                                      ▼
//!          read band (contiguous via IOMMU, or SG via BRAM page lists)
//!          Sobel ──▶ write band back ──▶ metrics mirror ──▶ DONE|IDLE
//!                                      │
//!                                      ▼
//!                              MsiLines::raise(group)
//! ```

pub mod sobel;

use crate::config::DriverConfig;
use crate::device::{Device, DeviceResources};
use crate::dma::{SoftIommu, PAGE_SIZE};
use crate::error::{DriverError, Result};
use crate::irq::{InterruptThreads, MsiLines};
use crate::layout::{BramWindow, GroupMetrics};
use crate::mmio::{RegisterBus, SimulatedBar};
use sobel_chip::regs::{self, scheduler};
use sobel_chip::{bar, bram, AcceleratorGroup, GroupKind, GroupMask};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

/// How queued jobs get executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Jobs wait for [`SimulatedFabric::complete`]
    Manual,
    /// A worker thread runs jobs as soon as they start
    Auto,
}

#[derive(Debug, Default)]
struct JobQueue {
    pending: VecDeque<AcceleratorGroup>,
    shutdown: bool,
}

#[derive(Debug)]
struct FabricState {
    registers: SimulatedBar,
    bram: Arc<SimulatedBar>,
    window: BramWindow,
    iommu: Arc<SoftIommu>,
    epoch: Instant,
    jobs: Mutex<JobQueue>,
    job_ready: Condvar,
    msi: Mutex<Option<MsiLines>>,
    acks: AtomicUsize,
    completed: AtomicUsize,
    mode: CompletionMode,
}

impl FabricState {
    fn jobs(&self) -> MutexGuard<'_, JobQueue> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // 100 MHz: one cycle per 10 ns
    #[allow(clippy::cast_possible_truncation)]
    fn cycles(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() / 10) as u64
    }

    fn start(&self, group: AcceleratorGroup) {
        let mut jobs = self.jobs();
        if jobs.pending.contains(&group) {
            tracing::warn!("sim: {group} started while already running, ignored");
            return;
        }
        jobs.pending.push_back(group);
        drop(jobs);
        tracing::trace!("sim: {group} started");
        if self.mode == CompletionMode::Auto {
            self.job_ready.notify_one();
        }
    }

    fn reg(&self, group: AcceleratorGroup, offset: usize) -> u32 {
        self.registers.read32(group.scheduler_base() + offset)
    }

    /// Run `group`'s job to completion and raise its MSI.
    fn execute(&self, group: AcceleratorGroup) {
        let rows = self.reg(group, scheduler::IMAGE_ROWS) as usize;
        let columns = self.reg(group, scheduler::IMAGE_COLUMNS) as usize;
        let bytes = rows * columns * sobel::PIXEL_BYTES;

        let start = self.cycles();
        let moved = if bytes == 0 {
            Ok(0)
        } else if group.kind() == GroupKind::ScatterGather {
            self.run_scatter_gather(rows, columns)
        } else {
            self.run_contiguous(group, rows, columns)
        };
        let end = self.cycles();

        let pages = match moved {
            Ok(pages) => pages,
            Err(e) => {
                tracing::error!("sim: {group} DMA fault: {e}");
                0
            }
        };
        self.window
            .write_metrics_mirror(group, &job_metrics(group, bytes, pages, rows, start, end));
        self.registers.write32(
            group.scheduler_base() + scheduler::AP_CTRL,
            scheduler::ap_ctrl::DONE | scheduler::ap_ctrl::IDLE,
        );
        self.completed.fetch_add(1, Ordering::Relaxed);

        let msi = self.msi.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match msi {
            Some(lines) => lines.raise(group),
            None => tracing::debug!("sim: {group} done, no MSI lines connected"),
        }
    }

    fn address(&self, group: AcceleratorGroup, lo: usize, hi: usize) -> u64 {
        u64::from(self.reg(group, lo)) | (u64::from(self.reg(group, hi)) << 32)
    }

    fn run_contiguous(&self, group: AcceleratorGroup, rows: usize, columns: usize) -> Result<usize> {
        let source = self.address(group, scheduler::SOURCE_ADDRESS_LO, scheduler::SOURCE_ADDRESS_HI);
        let destination = self.address(
            group,
            scheduler::DESTINATION_ADDRESS_LO,
            scheduler::DESTINATION_ADDRESS_HI,
        );
        let mut band = vec![0u8; rows * columns * sobel::PIXEL_BYTES];
        self.iommu.dma_read(source, &mut band)?;
        let filtered = sobel::sobel(&band, rows, columns);
        self.iommu.dma_write(destination, &filtered)?;
        Ok(band.len().div_ceil(PAGE_SIZE))
    }

    fn run_scatter_gather(&self, rows: usize, columns: usize) -> Result<usize> {
        let bytes = rows * columns * sobel::PIXEL_BYTES;
        let pages = bytes.div_ceil(PAGE_SIZE);
        let sources = self.window.read_sg_list(bram::SG_SOURCE_LIST, pages);
        let destinations = self.window.read_sg_list(bram::SG_DESTINATION_LIST, pages);

        let mut image = vec![0u8; bytes];
        for (chunk, &page) in image.chunks_mut(PAGE_SIZE).zip(&sources) {
            self.iommu.dma_read(page, chunk)?;
        }
        let filtered = sobel::sobel(&image, rows, columns);
        for (chunk, &page) in filtered.chunks(PAGE_SIZE).zip(&destinations) {
            self.iommu.dma_write(page, chunk)?;
        }
        Ok(pages)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn job_metrics(
    group: AcceleratorGroup,
    bytes: usize,
    pages: usize,
    rows: usize,
    start: u64,
    end: u64,
) -> GroupMetrics {
    let split = |cycles: u64| (cycles as u32, (cycles >> 32) as u32);
    let (start_l, start_u) = split(start);
    let (end_l, end_u) = split(end);
    let bytes = bytes as u32;
    let pages = pages as u32;

    let mut metrics = GroupMetrics {
        apm_read_transactions: pages,
        apm_read_bytes: bytes,
        apm_write_transactions: pages,
        apm_write_bytes: bytes,
        apm_packets: rows as u32,
        apm_bytes: bytes,
        apm_gcc_l: end_l,
        apm_gcc_u: end_u,
        dma_accel_time_start_l: start_l,
        dma_accel_time_start_u: start_u,
        dma_accel_time_end_l: end_l,
        dma_accel_time_end_u: end_u,
        ..GroupMetrics::default()
    };
    if group.kind() == GroupKind::Indirect {
        metrics.cdma_fetch_time_start_l = start_l;
        metrics.cdma_fetch_time_start_u = start_u;
        metrics.cdma_fetch_time_end_l = start_l;
        metrics.cdma_fetch_time_end_u = start_u;
        metrics.cdma_send_time_start_l = end_l;
        metrics.cdma_send_time_start_u = end_u;
        metrics.cdma_send_time_end_l = end_l;
        metrics.cdma_send_time_end_u = end_u;
    }
    metrics
}

/// BAR0 as seen by the driver
#[derive(Debug)]
struct ControlBar {
    state: Arc<FabricState>,
}

impl RegisterBus for ControlBar {
    #[allow(clippy::cast_possible_truncation)]
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            regs::GLOBAL_TIMER_LOWER => self.state.cycles() as u32,
            regs::GLOBAL_TIMER_UPPER => (self.state.cycles() >> 32) as u32,
            _ => self.state.registers.read32(offset),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.state.registers.write32(offset, value);
        if offset == regs::INTERRUPT_ACK {
            self.state.acks.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(relative) = offset.checked_sub(regs::SCHEDULER_BASE) else {
            return;
        };
        if relative % regs::SCHEDULER_STRIDE == scheduler::AP_CTRL
            && value & scheduler::ap_ctrl::START != 0
        {
            if let Some(group) = AcceleratorGroup::from_index(relative / regs::SCHEDULER_STRIDE) {
                self.state.start(group);
            }
        }
    }

    fn size(&self) -> usize {
        self.state.registers.size()
    }
}

/// Simulated accelerator fabric
#[derive(Debug)]
pub struct SimulatedFabric {
    state: Arc<FabricState>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedFabric {
    /// Power up a fabric.
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread cannot be spawned.
    pub fn new(mode: CompletionMode) -> Result<Self> {
        let bram = Arc::new(SimulatedBar::new(bar::bar1::SIZE));
        let state = Arc::new(FabricState {
            registers: SimulatedBar::new(bar::bar0::SIZE),
            window: BramWindow::new(bram.clone()),
            bram,
            iommu: Arc::new(SoftIommu::new()),
            epoch: Instant::now(),
            jobs: Mutex::new(JobQueue::default()),
            job_ready: Condvar::new(),
            msi: Mutex::new(None),
            acks: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            mode,
        });

        let worker = match mode {
            CompletionMode::Manual => None,
            CompletionMode::Auto => {
                let state = Arc::clone(&state);
                Some(
                    std::thread::Builder::new()
                        .name("sobel-sim".into())
                        .spawn(move || run_worker(&state))?,
                )
            }
        };

        tracing::info!("Simulated fabric powered up ({mode:?})");
        Ok(Self { state, worker })
    }

    /// Resources for [`Device::attach`].
    #[must_use]
    pub fn resources(&self) -> DeviceResources {
        DeviceResources {
            control: Arc::new(ControlBar {
                state: Arc::clone(&self.state),
            }),
            bram: self.state.bram.clone(),
            dma: self.state.iommu.clone(),
        }
    }

    /// Route completions to `lines`.
    pub fn connect(&self, lines: MsiLines) {
        *self.state.msi.lock().unwrap_or_else(PoisonError::into_inner) = Some(lines);
    }

    /// The fabric's IOMMU.
    #[must_use]
    pub fn iommu(&self) -> &Arc<SoftIommu> {
        &self.state.iommu
    }

    /// The BRAM window.
    #[must_use]
    pub fn bram(&self) -> &Arc<SimulatedBar> {
        &self.state.bram
    }

    /// Groups started but not yet completed.
    #[must_use]
    pub fn pending(&self) -> GroupMask {
        self.state.jobs().pending.iter().copied().collect()
    }

    /// Interrupt acknowledgements received.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.state.acks.load(Ordering::Relaxed)
    }

    /// Jobs executed.
    #[must_use]
    pub fn completed_jobs(&self) -> usize {
        self.state.completed.load(Ordering::Relaxed)
    }

    /// Run `group`'s pending job now (manual mode).
    ///
    /// # Errors
    ///
    /// Returns error if `group` has no pending job.
    pub fn complete(&self, group: AcceleratorGroup) -> Result<()> {
        {
            let mut jobs = self.state.jobs();
            let position = jobs
                .pending
                .iter()
                .position(|g| *g == group)
                .ok_or_else(|| DriverError::invalid_state(format!("{group} has no pending job")))?;
            jobs.pending.remove(position);
        }
        self.state.execute(group);
        Ok(())
    }

    /// Fabric, device and interrupt threads wired together.
    ///
    /// # Errors
    ///
    /// Returns error if a thread cannot be spawned.
    pub fn boot(mode: CompletionMode, config: DriverConfig) -> Result<SimulatedSystem> {
        let fabric = Self::new(mode)?;
        let device = Device::attach(fabric.resources(), config);
        let interrupts = device.spawn_interrupt_threads()?;
        fabric.connect(device.msi_lines());
        Ok(SimulatedSystem {
            fabric,
            interrupts,
            device,
        })
    }
}

fn run_worker(state: &FabricState) {
    loop {
        let group = {
            let mut jobs = state.jobs();
            loop {
                if jobs.shutdown {
                    return;
                }
                if let Some(group) = jobs.pending.pop_front() {
                    break group;
                }
                jobs = state
                    .job_ready
                    .wait(jobs)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        state.execute(group);
    }
}

impl Drop for SimulatedFabric {
    fn drop(&mut self) {
        self.state.jobs().shutdown = true;
        self.state.job_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Simulated fabric worker panicked");
            }
        }
        tracing::debug!("Simulated fabric powered down");
    }
}

/// A simulated fabric with a device attached and interrupts running
///
/// Fields drop in order: the fabric stops first, then the interrupt
/// threads, then the device.
#[derive(Debug)]
pub struct SimulatedSystem {
    /// The fabric
    pub fabric: SimulatedFabric,
    /// Bottom halves
    pub interrupts: InterruptThreads,
    /// The device context
    pub device: Arc<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_bit_queues_a_job() {
        let fabric = SimulatedFabric::new(CompletionMode::Manual).unwrap();
        let control = fabric.resources().control;
        let base = AcceleratorGroup::Indirect1.scheduler_base();
        control.write32(base + scheduler::IMAGE_ROWS, 3);
        control.write32(base + scheduler::AP_CTRL, scheduler::ap_ctrl::START);
        assert_eq!(fabric.pending(), GroupMask::from_bits(AcceleratorGroup::Indirect1.bit()));
        assert!(fabric.complete(AcceleratorGroup::Direct0).is_err());
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn completing_a_job_filters_in_place() {
        let fabric = SimulatedFabric::new(CompletionMode::Manual).unwrap();
        let control = fabric.resources().control;
        let (rows, columns) = (4usize, 4usize);
        let buffer =
            crate::dma::CoherentBuffer::new(fabric.iommu().clone(), PAGE_SIZE).unwrap();
        let mut image = Vec::new();
        for _ in 0..rows {
            for x in 0..columns {
                let v = if x < 2 { 0 } else { 90 };
                image.extend_from_slice(&[v, v, v, 0xFF]);
            }
        }
        buffer.copy_from(0, &image);

        let group = AcceleratorGroup::Direct0;
        let base = group.scheduler_base();
        let bus = buffer.bus_address();
        for (offset, value) in [
            (scheduler::SOURCE_ADDRESS_LO, bus as u32),
            (scheduler::SOURCE_ADDRESS_HI, (bus >> 32) as u32),
            (scheduler::DESTINATION_ADDRESS_LO, bus as u32),
            (scheduler::DESTINATION_ADDRESS_HI, (bus >> 32) as u32),
            (scheduler::IMAGE_COLUMNS, columns as u32),
            (scheduler::IMAGE_ROWS, rows as u32),
            (scheduler::AP_CTRL, scheduler::ap_ctrl::START),
        ] {
            control.write32(base + offset, value);
        }
        fabric.complete(group).unwrap();

        let mut out = vec![0u8; image.len()];
        buffer.copy_to(0, &mut out);
        assert_eq!(out, sobel::sobel(&image, rows, columns));
        assert_eq!(
            control.read32(base + scheduler::AP_CTRL),
            scheduler::ap_ctrl::DONE | scheduler::ap_ctrl::IDLE
        );
        let window = BramWindow::new(fabric.bram().clone());
        assert_eq!(window.metrics_mirror(group).apm_read_bytes, 64);
        assert_eq!(fabric.completed_jobs(), 1);
    }

    #[test]
    fn ack_register_is_counted() {
        let fabric = SimulatedFabric::new(CompletionMode::Manual).unwrap();
        let control = fabric.resources().control;
        control.write32(regs::INTERRUPT_ACK, regs::INTERRUPT_ACK_VALUE);
        control.write32(regs::INTERRUPT_ACK, regs::INTERRUPT_ACK_VALUE);
        assert_eq!(fabric.acks(), 2);
    }

    #[test]
    fn timer_runs() {
        let fabric = SimulatedFabric::new(CompletionMode::Manual).unwrap();
        let control = fabric.resources().control;
        let first = crate::mmio::read_split_counter(
            control.as_ref(),
            regs::GLOBAL_TIMER_LOWER,
            regs::GLOBAL_TIMER_UPPER,
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = crate::mmio::read_split_counter(
            control.as_ref(),
            regs::GLOBAL_TIMER_LOWER,
            regs::GLOBAL_TIMER_UPPER,
        );
        assert!(second - first >= 100_000);
    }

    #[test]
    fn auto_mode_worker_stops_on_drop() {
        let fabric = SimulatedFabric::new(CompletionMode::Auto).unwrap();
        let control = fabric.resources().control;
        control.write32(
            AcceleratorGroup::Direct1.scheduler_base() + scheduler::AP_CTRL,
            scheduler::ap_ctrl::START,
        );
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while fabric.completed_jobs() == 0 {
            assert!(Instant::now() < deadline, "worker never ran the job");
            std::thread::yield_now();
        }
        drop(fabric);
    }
}
