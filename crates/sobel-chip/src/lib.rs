//! Silicon model for the Sobel accelerator fabric.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the FPGA exposes over PCIe: identifiers, BAR layout,
//! the register map of every accelerator group's scheduler core, and the
//! byte layout of the BRAM window shared between host and hardware.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, MSI vector count |
//! | [`bar`] | BAR layout (BAR0 control, BAR1 shared BRAM window) |
//! | [`group`] | The seven accelerator groups, their kinds and bitmask bits |
//! | [`regs`] | BAR0 register map: scheduler cores, interrupt manager, timer |
//! | [`bram`] | BRAM window layout: metrics slots, status flags, SG lists |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod bram;
pub mod group;
pub mod pcie;
pub mod regs;

pub use group::{AcceleratorGroup, GroupKind, GroupMask, GROUP_COUNT};
