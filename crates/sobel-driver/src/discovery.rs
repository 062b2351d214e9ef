//! Runtime fabric discovery
//!
//! Scans PCIe sysfs for Xilinx endpoints carrying a known fabric device ID
//! and maps their BARs.

use crate::config::DriverConfig;
use crate::device::{Device, DeviceResources};
use crate::dma::DmaMapper;
use crate::error::{DriverError, Result};
use crate::mmio::MmapRegion;
use sobel_chip::bar::Bar;
use sobel_chip::pcie::{ALL_DEVICE_IDS, XILINX_VENDOR_ID};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default sysfs root for PCI devices.
pub const PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A fabric found on the PCI bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricInfo {
    /// Index in discovery order (sorted by PCIe address)
    pub index: usize,
    /// PCIe address (0000:01:00.0, etc.)
    pub pcie_address: String,
    /// PCI device ID
    pub device_id: u16,
    /// sysfs directory
    pub sysfs_path: PathBuf,
}

/// Discovered fabrics
#[derive(Debug)]
pub struct FabricManager {
    fabrics: Vec<FabricInfo>,
}

impl FabricManager {
    /// Discover all fabrics on the system.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NoDevicesFound` if none are present.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(PCI_DEVICES))
    }

    /// Discover fabrics below a sysfs-style directory.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read or holds no fabric.
    pub fn discover_in(root: &Path) -> Result<Self> {
        tracing::info!("Discovering accelerator fabrics under {}", root.display());

        let entries = std::fs::read_dir(root).map_err(|_| DriverError::device_not_found(root))?;

        let mut found: Vec<(String, u16, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let vendor = read_hex_sysfs(&path.join("vendor")).ok();
            let device = read_hex_sysfs(&path.join("device")).ok();

            if let (Some(vendor), Some(device)) = (vendor, device) {
                if vendor == XILINX_VENDOR_ID && ALL_DEVICE_IDS.contains(&device) {
                    let address = entry.file_name().to_string_lossy().to_string();
                    tracing::debug!("Found fabric {XILINX_VENDOR_ID:04x}:{device:04x} at {address}");
                    found.push((address, device, path));
                }
            }
        }

        if found.is_empty() {
            tracing::warn!("No accelerator fabric found");
            return Err(DriverError::NoDevicesFound);
        }

        // Stable ordering across boots
        found.sort_by(|a, b| a.0.cmp(&b.0));
        let fabrics: Vec<_> = found
            .into_iter()
            .enumerate()
            .map(|(index, (pcie_address, device_id, sysfs_path))| FabricInfo {
                index,
                pcie_address,
                device_id,
                sysfs_path,
            })
            .collect();

        tracing::info!("Discovered {} fabric(s)", fabrics.len());
        Ok(Self { fabrics })
    }

    /// Number of fabrics.
    #[must_use]
    pub fn fabric_count(&self) -> usize {
        self.fabrics.len()
    }

    /// All fabrics.
    #[must_use]
    pub fn fabrics(&self) -> &[FabricInfo] {
        &self.fabrics
    }

    /// First fabric.
    ///
    /// # Errors
    ///
    /// Returns error if the list is empty.
    pub fn first(&self) -> Result<&FabricInfo> {
        self.fabrics.first().ok_or(DriverError::NoDevicesFound)
    }
}

impl FabricInfo {
    /// Map one BAR of this fabric.
    ///
    /// # Errors
    ///
    /// Returns error if the BAR cannot be mapped or is smaller than the
    /// register map needs.
    pub fn map_bar(&self, bar: Bar) -> Result<MmapRegion> {
        let region = MmapRegion::from_sysfs(&self.sysfs_path, bar.index())?;
        if crate::mmio::RegisterBus::size(&region) < bar.size() {
            return Err(DriverError::invalid_state(format!(
                "{} BAR{} is {:#x} bytes, expected at least {:#x}",
                self.pcie_address,
                bar.index(),
                crate::mmio::RegisterBus::size(&region),
                bar.size()
            )));
        }
        Ok(region)
    }

    /// Map both BARs and attach a device context.
    ///
    /// # Errors
    ///
    /// Returns error if either BAR cannot be mapped.
    pub fn attach(&self, dma: Arc<dyn DmaMapper>, config: DriverConfig) -> Result<Arc<Device>> {
        let control = self.map_bar(Bar::Control)?;
        let bram = self.map_bar(Bar::SharedBram)?;
        Ok(Device::attach(
            DeviceResources {
                control: Arc::new(control),
                bram: Arc::new(bram),
                dma,
            },
            config,
        ))
    }
}

/// Read a hexadecimal sysfs attribute (`0x10ee\n`).
fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16)
        .map_err(|e| DriverError::invalid_argument(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(devices: &[(&str, &str, &str)]) -> TempDir {
        let root = TempDir::new().unwrap();
        for (address, vendor, device) in devices {
            let dir = root.path().join(address);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
            std::fs::write(dir.join("device"), format!("{device}\n")).unwrap();
        }
        root
    }

    #[test]
    fn finds_fabrics_in_address_order() {
        let root = fake_sysfs(&[
            ("0000:03:00.0", "0x10ee", "0x7028"),
            ("0000:00:1f.3", "0x8086", "0xa348"),
            ("0000:01:00.0", "0x10ee", "0x7024"),
            ("0000:02:00.0", "0x10ee", "0x9038"),
        ]);
        let manager = FabricManager::discover_in(root.path()).unwrap();
        assert_eq!(manager.fabric_count(), 2);
        assert_eq!(manager.first().unwrap().pcie_address, "0000:01:00.0");
        assert_eq!(manager.fabrics()[1].device_id, 0x7028);
        assert_eq!(manager.fabrics()[1].index, 1);
    }

    #[test]
    fn empty_bus_reports_no_devices() {
        let root = fake_sysfs(&[("0000:00:00.0", "0x8086", "0x1237")]);
        assert!(matches!(
            FabricManager::discover_in(root.path()),
            Err(DriverError::NoDevicesFound)
        ));
    }

    #[test]
    fn missing_resource_is_device_not_found() {
        let root = fake_sysfs(&[("0000:01:00.0", "0x10ee", "0x7024")]);
        let manager = FabricManager::discover_in(root.path()).unwrap();
        assert!(matches!(
            manager.first().unwrap().map_bar(Bar::Control),
            Err(DriverError::DeviceNotFound { .. })
        ));
    }
}
