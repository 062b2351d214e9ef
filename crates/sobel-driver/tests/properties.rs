//! Invariants that must hold across any interleaving of requests and
//! completions.

use sobel_driver::layout::MetricsView;
use sobel_driver::sim::{CompletionMode, SimulatedFabric};
use sobel_driver::{
    AcceleratorClient, AcceleratorGroup, AllocationPolicy, Device, DriverConfig, GroupMask, Image,
    ImageInfo, Ioctl, IoctlReply, MmapKind, Pid,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn config(policy: AllocationPolicy) -> DriverConfig {
    DriverConfig {
        mmap_size: 1 << 16,
        ..DriverConfig::default()
    }
    .with_policy(policy)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Free,
    Occupied(u32),
}

fn state(device: &Device, group: AcceleratorGroup) -> GroupState {
    if device.bram().is_busy(group) {
        GroupState::Occupied(device.bram().occupied_pid(group))
    } else {
        GroupState::Free
    }
}

#[test]
fn group_alternates_between_free_and_one_owner() {
    let fabric = SimulatedFabric::new(CompletionMode::Manual).unwrap();
    let device = Device::attach(fabric.resources(), config(AllocationPolicy::BestAvailable));
    let group = AcceleratorGroup::Direct0;

    let pids: Vec<Pid> = (1..=4).map(|raw| Pid::new(raw).unwrap()).collect();
    let mut sessions = Vec::new();
    for &pid in &pids {
        let handle = device.open(pid).unwrap();
        let metrics = device.endpoint(MmapKind::Metrics).open(pid).mmap(1 << 16).unwrap();
        let pre = device.endpoint(MmapKind::PreProcess).open(pid).mmap(1 << 16).unwrap();
        metrics.metrics().unwrap().set_image_info(ImageInfo::new(8, 8));
        sessions.push((pid, handle, metrics, pre));
    }

    let mut trace = vec![state(&device, group)];
    for round in 0..5 {
        for (pid, handle, metrics, _pre) in &sessions {
            let reply = handle.ioctl(Ioctl::RequestAcceleratorAccess).unwrap();
            assert!(matches!(reply, IoctlReply::Granted(ref plan) if plan.groups().contains(group)));
            trace.push(state(&device, group));

            fabric.complete(group).unwrap();
            device.service_interrupt(group);
            trace.push(state(&device, group));

            let view = metrics.metrics().unwrap();
            assert_eq!(view.accel_completed(), view.accel_occupied(), "round {round} pid {pid}");
            view.reset_masks();
        }
    }

    assert_eq!(trace.len(), 1 + 2 * 5 * pids.len());
    for pair in trace.windows(2) {
        match pair {
            [GroupState::Free, GroupState::Occupied(pid)] => assert_ne!(*pid, 0),
            [GroupState::Occupied(_), GroupState::Free] => {}
            other => panic!("illegal transition {other:?}"),
        }
    }
    let owners: Vec<u32> = trace
        .iter()
        .filter_map(|s| match s {
            GroupState::Occupied(pid) => Some(*pid),
            GroupState::Free => None,
        })
        .collect();
    assert_eq!(&owners[..4], &[1, 2, 3, 4]);
}

#[test]
fn completed_is_always_a_subset_of_occupied() {
    let system = SimulatedFabric::boot(CompletionMode::Auto, config(AllocationPolicy::Greedy)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let observations = Arc::new(AtomicUsize::new(0));

    let observer = {
        let device = Arc::clone(&system.device);
        let stop = Arc::clone(&stop);
        let observations = Arc::clone(&observations);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                // Allocations and completions both run under the table lock,
                // and clients clear completed before occupied.
                let records = device.table().lock();
                for record in records.values() {
                    if let Some(metrics) = &record.metrics {
                        let view = MetricsView::new(metrics);
                        let occupied = view.accel_occupied();
                        let completed = view.accel_completed();
                        assert!(
                            completed.is_subset_of(occupied),
                            "pid {}: completed {:#04x} not within occupied {:#04x}",
                            record.pid,
                            completed.bits(),
                            occupied.bits()
                        );
                        observations.fetch_add(1, Ordering::Relaxed);
                    }
                }
                drop(records);
                std::thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..6u32)
        .map(|i| {
            let device = Arc::clone(&system.device);
            std::thread::spawn(move || {
                let client = AcceleratorClient::connect(&device, Pid::new(500 + i).unwrap()).unwrap();
                for round in 0..6 {
                    let image = Image::test_pattern(7 + round + i, 16);
                    client.process(&image).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    observer.join().unwrap();
    assert!(observations.load(Ordering::Relaxed) > 0);
}

#[test]
fn plans_cover_every_row_exactly_once() {
    for policy in [AllocationPolicy::BestAvailable, AllocationPolicy::Greedy] {
        for bits in 1..=GroupMask::ALL.bits() {
            let free = GroupMask::from_bits(bits);
            for rows in [1, 2, 5, 6, 7, 13, 480] {
                let plan = policy.plan(free, rows, 10).unwrap();
                assert!(plan.groups().is_subset_of(free), "{policy} {bits:#04x}");
                assert_eq!(plan.segment_rows().iter().sum::<u32>(), rows);

                let mut offset = 0;
                for segment in &plan.segments {
                    assert_eq!(segment.byte_offset, offset);
                    offset += u64::from(segment.rows) * 10 * 4;
                }

                let sg = plan.uses_scatter_gather();
                if sg {
                    assert_eq!(plan.segment_count(), 1, "SG is never combined");
                }
                let contiguous_free = AcceleratorGroup::CONTIGUOUS
                    .iter()
                    .any(|g| free.contains(*g));
                assert_eq!(sg, !contiguous_free, "{policy} {bits:#04x}");
            }
        }
    }
}
