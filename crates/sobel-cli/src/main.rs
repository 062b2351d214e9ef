//! `sobel`: command-line interface for the Sobel accelerator fabric.
//!
//! ```text
//! USAGE:
//!   sobel enumerate                 List all fabrics on the PCI bus
//!   sobel peek <device>             Timer and group status of one fabric
//!   sobel reset <device>            Clear occupying pids (RESET_VARIABLES)
//!   sobel run [options]             Concurrent workload on the simulated fabric
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sobel_driver::bar::Bar;
use sobel_driver::layout::BramWindow;
use sobel_driver::mmio::read_split_counter;
use sobel_driver::sim::{CompletionMode, SimulatedFabric};
use sobel_driver::{
    AcceleratorClient, AcceleratorGroup, AllocationPolicy, DriverConfig, DriverError, FabricInfo,
    FabricManager, Image, Pid, RegisterBus, SoftIommu,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sobel", about = "Sobel accelerator fabric CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all fabrics on the PCI bus.
    Enumerate,
    /// Print the global timer and per-group status of one fabric.
    Peek {
        /// PCIe address (e.g. 0000:01:00.0) or fabric index (e.g. 0).
        device: String,
    },
    /// Clear every occupying pid and the busy summary of one fabric.
    Reset {
        /// PCIe address (e.g. 0000:01:00.0) or fabric index (e.g. 0).
        device: String,
    },
    /// Filter images from several threads on the simulated fabric.
    Run {
        /// Allocation policy (best-available or greedy).
        #[arg(long, default_value = "best-available")]
        policy: AllocationPolicy,
        /// Concurrent requesting threads.
        #[arg(long, default_value_t = 4)]
        threads: u32,
        /// Image rows.
        #[arg(long, default_value_t = 480)]
        rows: u32,
        /// Image columns.
        #[arg(long, default_value_t = 640)]
        cols: u32,
        /// Images per thread.
        #[arg(long, default_value_t = 10)]
        iterations: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Peek { device } => cmd_peek(&device)?,
        Cmd::Reset { device } => cmd_reset(&device)?,
        Cmd::Run {
            policy,
            threads,
            rows,
            cols,
            iterations,
        } => cmd_run(policy, threads, rows, cols, iterations)?,
    }

    Ok(())
}

fn cmd_enumerate() -> Result<()> {
    enumerate(FabricManager::discover(), &mut std::io::stdout().lock())
}

/// Print what discovery found, or what to look for when the bus holds no
/// fabric.
fn enumerate(found: sobel_driver::Result<FabricManager>, out: &mut impl Write) -> Result<()> {
    let mgr = match found {
        Ok(mgr) => mgr,
        Err(DriverError::NoDevicesFound) => {
            writeln!(out, "Sobel fabrics: 0")?;
            writeln!(out, "Looking for: {}", sobel_driver::pcie_ids::lspci_filter())?;
            return Ok(());
        }
        Err(e) => return Err(e).context("discovering fabrics"),
    };

    writeln!(out, "Sobel fabrics: {}", mgr.fabric_count())?;
    for info in mgr.fabrics() {
        writeln!(
            out,
            "[{}] {} device {:#06x}  {}",
            info.index,
            info.pcie_address,
            info.device_id,
            info.sysfs_path.display()
        )?;
    }

    Ok(())
}

/// Accept index or PCIe address.
fn find_fabric(mgr: &FabricManager, device: &str) -> Result<FabricInfo> {
    let found = if let Ok(idx) = device.parse::<usize>() {
        mgr.fabrics().get(idx)
    } else {
        mgr.fabrics().iter().find(|f| f.pcie_address == device)
    };
    found
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Fabric not found: {device}"))
}

fn cmd_peek(device: &str) -> Result<()> {
    let mgr = FabricManager::discover()?;
    let info = find_fabric(&mgr, device)?;

    let control = info.map_bar(Bar::Control).context("mapping BAR0")?;
    let bram = BramWindow::new(Arc::new(info.map_bar(Bar::SharedBram).context("mapping BAR1")?));

    let timer = read_split_counter(
        &control,
        sobel_driver::regs::GLOBAL_TIMER_LOWER,
        sobel_driver::regs::GLOBAL_TIMER_UPPER,
    );
    println!("Fabric       : {}", info.pcie_address);
    println!("Global timer : {timer} cycles");
    println!("Busy summary : {:#04x}", bram.summary().bits());
    println!();
    println!("  group          busy  pid       ap_ctrl");
    for group in AcceleratorGroup::ALL {
        let ap_ctrl = control.read32(group.scheduler_base() + sobel_driver::regs::scheduler::AP_CTRL);
        println!(
            "  {:<14} {:<5} {:<9} {ap_ctrl:#06x}",
            group.name(),
            bram.is_busy(group),
            bram.occupied_pid(group)
        );
    }

    Ok(())
}

fn cmd_reset(device: &str) -> Result<()> {
    let mgr = FabricManager::discover()?;
    let info = find_fabric(&mgr, device)?;

    // No DMA happens here, so the software IOVA space is enough
    let fabric = info.attach(Arc::new(SoftIommu::new()), DriverConfig::from_env())?;
    fabric.reset_variables();
    tracing::info!("RESET_VARIABLES issued on {}", info.pcie_address);
    println!("Reset occupying pids on {}", info.pcie_address);

    Ok(())
}

#[derive(Debug, Default)]
struct ThreadStats {
    images: u64,
    segments: u64,
    scatter_gather: u64,
    total_cycles: u64,
    sleep_cycles: u64,
}

fn cmd_run(
    policy: AllocationPolicy,
    threads: u32,
    rows: u32,
    cols: u32,
    iterations: u32,
) -> Result<()> {
    let config = DriverConfig::from_env().with_policy(policy);
    let system = SimulatedFabric::boot(CompletionMode::Auto, config)?;
    let image = Arc::new(Image::test_pattern(rows, cols));
    tracing::info!("Simulated run: {threads} thread(s), {iterations} image(s) each, policy {policy}");

    println!("Simulated fabric, policy {policy}, {threads} thread(s) x {iterations} image(s) of {rows}x{cols}");
    let started = Instant::now();

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let device = Arc::clone(&system.device);
            let image = Arc::clone(&image);
            std::thread::Builder::new()
                .name(format!("sobel-run-{t}"))
                .spawn(move || -> Result<ThreadStats> {
                    let client = AcceleratorClient::connect(&device, Pid::current())?;
                    let mut stats = ThreadStats::default();
                    for _ in 0..iterations {
                        let done = client.process(&image)?;
                        let m = &done.metrics;
                        stats.images += 1;
                        stats.segments += u64::from(m.image_segments);
                        stats.scatter_gather += u64::from(done.plan.uses_scatter_gather());
                        stats.total_cycles += m.total_time_end.saturating_sub(m.total_time_start);
                        stats.sleep_cycles += m.sleep_time_end.saturating_sub(m.sleep_time_start);
                    }
                    Ok(stats)
                })
                .context("spawning worker")
        })
        .collect::<Result<_>>()?;

    let mut total = ThreadStats::default();
    for (t, worker) in workers.into_iter().enumerate() {
        let stats = worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker {t} panicked"))??;
        println!(
            "  thread {t}: {} image(s), {} segment(s), {} via SG",
            stats.images, stats.segments, stats.scatter_gather
        );
        total.images += stats.images;
        total.segments += stats.segments;
        total.scatter_gather += stats.scatter_gather;
        total.total_cycles += stats.total_cycles;
        total.sleep_cycles += stats.sleep_cycles;
    }

    let elapsed = started.elapsed();
    tracing::info!("Run finished: {} image(s) in {elapsed:?}", total.images);
    let images = total.images.max(1);
    println!();
    println!("Images       : {}", total.images);
    println!("Avg segments : {:.2}", total.segments as f64 / images as f64);
    println!("Avg total    : {} cycles", total.total_cycles / images);
    println!("Avg sleep    : {} cycles", total.sleep_cycles / images);
    println!("Interrupts   : {}", system.fabric.acks());
    println!(
        "Throughput   : {:.1} images/s",
        total.images as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
