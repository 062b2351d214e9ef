//! Hardware validation tests
//!
//! Run against a programmed fabric with `cargo test -- --ignored`.

use sobel_chip::bar::Bar;
use sobel_chip::regs;
use sobel_driver::mmio::read_split_counter;
use sobel_driver::{AcceleratorGroup, FabricManager, RegisterBus};

#[test]
#[ignore] // Requires hardware
fn test_fabric_discovery() {
    let manager = FabricManager::discover().expect("Discovery");
    assert!(manager.fabric_count() > 0, "No fabric found");
    for fabric in manager.fabrics() {
        println!(
            "Fabric {}: {} (device {:#06x})",
            fabric.index, fabric.pcie_address, fabric.device_id
        );
    }
}

#[test]
#[ignore] // Requires hardware
fn test_global_timer_advances() {
    let manager = FabricManager::discover().expect("Discovery");
    let control = manager.first().expect("Fabric").map_bar(Bar::Control).expect("BAR0");
    assert_eq!(control.size(), Bar::Control.size());

    let first = read_split_counter(&control, regs::GLOBAL_TIMER_LOWER, regs::GLOBAL_TIMER_UPPER);
    std::thread::sleep(std::time::Duration::from_millis(1));
    let second = read_split_counter(&control, regs::GLOBAL_TIMER_LOWER, regs::GLOBAL_TIMER_UPPER);
    assert!(second > first, "Timer stalled at {first}");
}

#[test]
#[ignore] // Requires hardware
fn test_idle_fabric_reports_free_groups() {
    let manager = FabricManager::discover().expect("Discovery");
    let bram = manager.first().expect("Fabric").map_bar(Bar::SharedBram).expect("BAR1");
    let window = sobel_driver::layout::BramWindow::new(std::sync::Arc::new(bram));
    for group in AcceleratorGroup::ALL {
        println!(
            "{group}: busy={} pid={}",
            window.is_busy(group),
            window.occupied_pid(group)
        );
    }
}
