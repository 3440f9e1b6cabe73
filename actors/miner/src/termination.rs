// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fvm_ipld_bitfield::BitField;
use fvm_shared::clock::ChainEpoch;

/// Accumulator for draining early-termination queues across partitions and
/// deadlines. Sectors are grouped by the epoch at which they were terminated,
/// which the fee calculation needs.
#[derive(Default)]
pub struct TerminationResult {
    pub sectors: BTreeMap<ChainEpoch, BitField>,
    pub partitions_processed: u64,
    pub sectors_processed: u64,
}

impl TerminationResult {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds sectors terminated at the given epoch, merging with anything
    /// already collected for it.
    pub fn record(&mut self, epoch: ChainEpoch, sectors: BitField) {
        self.sectors
            .entry(epoch)
            .and_modify(|present| *present |= &sectors)
            .or_insert(sectors);
    }

    /// Folds another drain result into this one.
    pub fn absorb(&mut self, other: TerminationResult) {
        self.partitions_processed += other.partitions_processed;
        self.sectors_processed += other.sectors_processed;
        for (epoch, sectors) in other.sectors {
            self.record(epoch, sectors);
        }
    }

    /// Whether another partition/sector may still be drained under the limits.
    pub fn within_limits(&self, max_partitions: u64, max_sectors: u64) -> bool {
        self.partitions_processed < max_partitions && self.sectors_processed < max_sectors
    }

    pub fn is_empty(&self) -> bool {
        self.sectors_processed == 0
    }

    /// Visits the collected groups in epoch order.
    pub fn iter(&self) -> impl Iterator<Item = (ChainEpoch, &BitField)> {
        self.sectors.iter().map(|(&epoch, sectors)| (epoch, sectors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_merges_same_epoch() {
        let mut result = TerminationResult::new();
        result.record(10, BitField::try_from_bits([1, 2]).unwrap());
        result.record(10, BitField::try_from_bits([2, 3]).unwrap());

        assert_eq!(1, result.sectors.len());
        assert_eq!(3, result.sectors.get(&10).unwrap().len());
    }

    #[test]
    fn absorb_combines_counts_and_groups() {
        let mut a = TerminationResult::new();
        a.record(10, BitField::try_from_bits([1]).unwrap());
        a.partitions_processed = 1;
        a.sectors_processed = 1;

        let mut b = TerminationResult::new();
        b.record(20, BitField::try_from_bits([2]).unwrap());
        b.partitions_processed = 1;
        b.sectors_processed = 1;

        a.absorb(b);
        assert_eq!(2, a.partitions_processed);
        assert_eq!(2, a.sectors_processed);
        assert_eq!(2, a.sectors.len());
        assert!(a.within_limits(3, 3));
        assert!(!a.within_limits(2, 3));
    }
}
