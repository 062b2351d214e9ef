//! Completion interrupts
//!
//! Every group has its own MSI vector. The top half ([`MsiLines::raise`])
//! only queues an event; one bottom-half thread per group runs
//! [`Device::service_interrupt`]:
//!
//! 1. table lock, then the group's lock
//! 2. find the record of the pid occupying the group
//! 3. copy the group's metrics mirror into that process's metrics slot
//!    and OR the group into `accel_completed`
//! 4. free the group and acknowledge the interrupt manager
//! 5. wake every blocked allocator
//!
//! A completion nobody claims is logged; the group is still freed and
//! acknowledged so the fabric is not left stalled.

use crate::device::Device;
use crate::error::Result;
use crate::layout::MetricsView;
use crate::table::Pid;
use sobel_chip::{regs, AcceleratorGroup, GROUP_COUNT};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Event delivered to a bottom-half thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// The group's MSI fired
    Msi,
    /// Stop the thread
    Shutdown,
}

/// Top halves of the seven MSI vectors
#[derive(Debug, Clone)]
pub struct MsiLines {
    lines: Vec<Sender<IrqEvent>>,
}

impl MsiLines {
    pub(crate) fn new() -> (Self, Vec<Receiver<IrqEvent>>) {
        let (lines, receivers) = (0..GROUP_COUNT).map(|_| mpsc::channel()).unzip();
        (Self { lines }, receivers)
    }

    fn send(&self, group: AcceleratorGroup, event: IrqEvent) {
        if self.lines[group.index()].send(event).is_err() {
            tracing::debug!("{group}: {event:?} dropped, no interrupt thread");
        }
    }

    /// Signal completion of `group`.
    pub fn raise(&self, group: AcceleratorGroup) {
        tracing::trace!("MSI {}", group.index());
        self.send(group, IrqEvent::Msi);
    }
}

/// Running bottom-half threads; stopped and joined on drop
#[derive(Debug)]
pub struct InterruptThreads {
    lines: MsiLines,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for InterruptThreads {
    fn drop(&mut self) {
        for group in AcceleratorGroup::ALL {
            self.lines.send(group, IrqEvent::Shutdown);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Interrupt thread panicked");
            }
        }
        tracing::debug!("Interrupt threads stopped");
    }
}

impl Device {
    /// Start one bottom-half thread per group.
    ///
    /// # Errors
    ///
    /// Returns error if the threads were already started or a thread
    /// cannot be spawned.
    pub fn spawn_interrupt_threads(self: &Arc<Self>) -> Result<InterruptThreads> {
        let receivers = self.take_msi_receivers()?;
        let mut threads = InterruptThreads {
            lines: self.msi_lines(),
            handles: Vec::with_capacity(GROUP_COUNT),
        };
        for (group, events) in AcceleratorGroup::ALL.into_iter().zip(receivers) {
            let device = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("sobel-irq-{}", group.index()))
                .spawn(move || {
                    for event in events {
                        match event {
                            IrqEvent::Msi => device.service_interrupt(group),
                            IrqEvent::Shutdown => break,
                        }
                    }
                })?;
            threads.handles.push(handle);
        }
        tracing::info!("Started {GROUP_COUNT} interrupt threads");
        Ok(threads)
    }

    /// Bottom half for `group`'s completion interrupt.
    pub fn service_interrupt(&self, group: AcceleratorGroup) {
        {
            let records = self.table.lock();
            let _guard = self.group_lock(group);

            let owner = self.bram.occupied_pid(group);
            let record = Pid::new(owner).ok().and_then(|pid| records.get(&pid));
            match record.map(|r| (r.pid, r.metrics.as_ref())) {
                Some((pid, Some(metrics))) => {
                    let view = MetricsView::new(metrics);
                    view.store_group_metrics(group, &self.bram.metrics_mirror(group));
                    if view.accel_occupied().contains(group) {
                        view.mark_completed(group);
                        tracing::debug!("{group} completed for pid {pid}");
                    } else {
                        tracing::warn!("{group} completed for pid {pid}, which no longer expects it");
                    }
                }
                Some((pid, None)) => {
                    tracing::warn!("{group} completed for pid {pid}, which has no metrics buffer");
                }
                None => {
                    tracing::warn!("{group} completed with no record for occupying pid {owner}");
                }
            }

            self.bram.release(group);
            self.control
                .write32(regs::INTERRUPT_ACK, regs::INTERRUPT_ACK_VALUE);
        }
        self.wait_queue.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::DeviceResources;
    use crate::dma::{CoherentBuffer, SoftIommu};
    use crate::layout::GroupMetrics;
    use crate::mmio::{RegisterBus, SimulatedBar};
    use crate::table;
    use sobel_chip::bar;
    use std::time::{Duration, Instant};

    fn device() -> (Arc<Device>, Arc<SimulatedBar>) {
        let control = Arc::new(SimulatedBar::new(bar::bar0::SIZE));
        let device = Device::attach(
            DeviceResources {
                control: control.clone(),
                bram: Arc::new(SimulatedBar::new(bar::bar1::SIZE)),
                dma: Arc::new(SoftIommu::new()),
            },
            DriverConfig::default(),
        );
        (device, control)
    }

    fn with_metrics(device: &Arc<Device>, raw: u32) -> Arc<CoherentBuffer> {
        let pid = Pid::new(raw).unwrap();
        device.table().insert(pid).unwrap();
        let metrics = Arc::new(CoherentBuffer::new(Arc::clone(device.dma()), 4096).unwrap());
        table::find(&mut device.table().lock(), pid).unwrap().metrics = Some(metrics.clone());
        metrics
    }

    #[test]
    fn completion_copies_metrics_and_frees_group() {
        let (device, control) = device();
        let metrics = with_metrics(&device, 31);
        let group = AcceleratorGroup::Indirect2;
        let view = MetricsView::new(&metrics);
        device.bram().claim(group, 31);
        view.mark_occupied(group);
        let mirror = GroupMetrics {
            apm_write_bytes: 4096,
            ..GroupMetrics::default()
        };
        device.bram().write_metrics_mirror(group, &mirror);

        device.service_interrupt(group);

        assert_eq!(view.accel_completed(), view.accel_occupied());
        assert_eq!(view.snapshot().groups[group.index()], mirror);
        assert!(!device.bram().is_busy(group));
        assert_eq!(device.bram().occupied_pid(group), 0);
        assert_eq!(control.read32(regs::INTERRUPT_ACK), regs::INTERRUPT_ACK_VALUE);
    }

    #[test]
    fn completion_never_exceeds_occupied() {
        let (device, _) = device();
        let metrics = with_metrics(&device, 32);
        device.bram().claim(AcceleratorGroup::Direct0, 32);
        device.service_interrupt(AcceleratorGroup::Direct0);
        assert!(MetricsView::new(&metrics).accel_completed().is_empty());
        assert!(!device.bram().is_busy(AcceleratorGroup::Direct0));
    }

    #[test]
    fn orphan_completion_still_frees_group() {
        let (device, control) = device();
        device.bram().claim(AcceleratorGroup::ScatterGather, 77);
        device.service_interrupt(AcceleratorGroup::ScatterGather);
        assert!(device.bram().free_mask().contains(AcceleratorGroup::ScatterGather));
        assert_eq!(control.read32(regs::INTERRUPT_ACK), regs::INTERRUPT_ACK_VALUE);
    }

    #[test]
    fn threads_service_raised_lines() {
        let (device, _) = device();
        let threads = device.spawn_interrupt_threads().unwrap();
        assert!(device.spawn_interrupt_threads().is_err());

        device.bram().claim(AcceleratorGroup::Direct1, 9);
        device.msi_lines().raise(AcceleratorGroup::Direct1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while device.bram().is_busy(AcceleratorGroup::Direct1) {
            assert!(Instant::now() < deadline, "interrupt never serviced");
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(threads);
    }
}
