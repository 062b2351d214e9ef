//! Accelerator groups.
//!
//! Seven independently schedulable pipelines, each a DMA front end feeding a
//! Sobel filter core. Their index order is also the allocation priority
//! order: direct before indirect before scatter-gather.
//!
//! ```text
//! index  group            kind            bit
//! ─────  ───────────────  ──────────────  ────
//!   0    Direct0          Direct          0x01
//!   1    Direct1          Direct          0x02
//!   2    Indirect0        Indirect        0x04
//!   3    Indirect1        Indirect        0x08
//!   4    Indirect2        Indirect        0x10
//!   5    Indirect3        Indirect        0x20
//!   6    ScatterGather    ScatterGather   0x40
//! ```

use crate::regs;

/// Number of accelerator groups on the fabric.
pub const GROUP_COUNT: usize = 7;

/// How a group moves data between host memory and its filter core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Filter core reads/writes host memory directly over PCIe.
    Direct,
    /// CDMA fetch/send engines stage data through on-device DDR.
    Indirect,
    /// DMA engine walks per-page address lists published in BRAM.
    ScatterGather,
}

/// One accelerator group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AcceleratorGroup {
    /// First direct group.
    Direct0 = 0,
    /// Second direct group.
    Direct1 = 1,
    /// First indirect group.
    Indirect0 = 2,
    /// Second indirect group.
    Indirect1 = 3,
    /// Third indirect group.
    Indirect2 = 4,
    /// Fourth indirect group.
    Indirect3 = 5,
    /// The scatter-gather group.
    ScatterGather = 6,
}

impl AcceleratorGroup {
    /// All groups in priority order.
    pub const ALL: [Self; GROUP_COUNT] = [
        Self::Direct0,
        Self::Direct1,
        Self::Indirect0,
        Self::Indirect1,
        Self::Indirect2,
        Self::Indirect3,
        Self::ScatterGather,
    ];

    /// The six groups that share the pre-process buffer (everything but SG).
    pub const CONTIGUOUS: [Self; 6] = [
        Self::Direct0,
        Self::Direct1,
        Self::Indirect0,
        Self::Indirect1,
        Self::Indirect2,
        Self::Indirect3,
    ];

    /// Group from its index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < GROUP_COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Zero-based index (priority and lock order).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// This group's bit in `accel_occupied` / `accel_completed`.
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Data-movement kind.
    #[must_use]
    pub const fn kind(self) -> GroupKind {
        match self {
            Self::Direct0 | Self::Direct1 => GroupKind::Direct,
            Self::Indirect0 | Self::Indirect1 | Self::Indirect2 | Self::Indirect3 => {
                GroupKind::Indirect
            }
            Self::ScatterGather => GroupKind::ScatterGather,
        }
    }

    /// Base of this group's scheduler core in BAR0.
    #[must_use]
    pub const fn scheduler_base(self) -> usize {
        regs::SCHEDULER_BASES[self as usize]
    }

    /// Slot in the BRAM metrics array (slot 0 is unused).
    #[must_use]
    pub const fn metrics_slot(self) -> usize {
        self as usize + 1
    }

    /// Short human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Direct0 => "direct-0",
            Self::Direct1 => "direct-1",
            Self::Indirect0 => "indirect-0",
            Self::Indirect1 => "indirect-1",
            Self::Indirect2 => "indirect-2",
            Self::Indirect3 => "indirect-3",
            Self::ScatterGather => "scatter-gather",
        }
    }
}

impl std::fmt::Display for AcceleratorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of accelerator groups, bit `i` = group index `i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupMask(u32);

impl GroupMask {
    /// No groups.
    pub const EMPTY: Self = Self(0);
    /// All seven groups.
    pub const ALL: Self = Self((1 << GROUP_COUNT) - 1);

    /// Mask from raw bits; bits above the group range are dropped.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether `group` is in the set.
    #[must_use]
    pub const fn contains(self, group: AcceleratorGroup) -> bool {
        self.0 & group.bit() != 0
    }

    /// Add `group`.
    pub fn insert(&mut self, group: AcceleratorGroup) {
        self.0 |= group.bit();
    }

    /// Remove `group`.
    pub fn remove(&mut self, group: AcceleratorGroup) {
        self.0 &= !group.bit();
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of groups in the set.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether every group of `self` is also in `other`.
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Complement within the seven groups.
    #[must_use]
    pub const fn complement(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }

    /// Groups in the set, in priority order.
    pub fn iter(self) -> impl Iterator<Item = AcceleratorGroup> {
        AcceleratorGroup::ALL
            .into_iter()
            .filter(move |g| self.contains(*g))
    }
}

impl FromIterator<AcceleratorGroup> for GroupMask {
    fn from_iter<I: IntoIterator<Item = AcceleratorGroup>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for group in iter {
            mask.insert(group);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_follow_priority_order() {
        for (i, group) in AcceleratorGroup::ALL.iter().enumerate() {
            assert_eq!(group.index(), i);
            assert_eq!(group.bit(), 1 << i);
            assert_eq!(AcceleratorGroup::from_index(i), Some(*group));
        }
        assert_eq!(AcceleratorGroup::from_index(GROUP_COUNT), None);
    }

    #[test]
    fn kinds_match_fabric() {
        let kinds: Vec<_> = AcceleratorGroup::ALL.iter().map(|g| g.kind()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == GroupKind::Direct).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == GroupKind::Indirect).count(), 4);
        assert_eq!(kinds[6], GroupKind::ScatterGather);
    }

    #[test]
    fn mask_iterates_in_priority_order() {
        let mask: GroupMask = [AcceleratorGroup::ScatterGather, AcceleratorGroup::Direct1]
            .into_iter()
            .collect();
        let groups: Vec<_> = mask.iter().collect();
        assert_eq!(
            groups,
            vec![AcceleratorGroup::Direct1, AcceleratorGroup::ScatterGather]
        );
        assert_eq!(mask.len(), 2);
        assert_eq!(mask.complement().len(), 5);
        assert!(GroupMask::from_bits(0x02).is_subset_of(mask));
        assert_eq!(GroupMask::from_bits(0xFF), GroupMask::ALL);
    }

    #[test]
    fn metrics_slot_skips_unused_slot_zero() {
        assert_eq!(AcceleratorGroup::Direct0.metrics_slot(), 1);
        assert_eq!(AcceleratorGroup::ScatterGather.metrics_slot(), 7);
    }
}
