// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use anyhow::anyhow;
use fvm_ipld_bitfield::BitField;
use storage_actors_runtime::runtime::Policy;

/// An in-memory grouping of sector numbers by deadline and partition, used to
/// walk fault/recovery/termination declarations in a fixed order.
#[derive(Default)]
pub struct DeadlineSectorMap(BTreeMap<u64, PartitionSectorMap>);

impl DeadlineSectorMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Files a declaration under its deadline and partition, merging with any
    /// earlier declaration for the same slot.
    pub fn insert(
        &mut self,
        policy: &Policy,
        deadline: u64,
        partition: u64,
        sector_numbers: BitField,
    ) -> anyhow::Result<()> {
        if deadline >= policy.wpost_period_deadlines {
            return Err(anyhow!("deadline index {} out of range", deadline));
        }
        self.0.entry(deadline).or_default().insert(partition, sector_numbers);
        Ok(())
    }

    pub fn insert_values(
        &mut self,
        policy: &Policy,
        deadline: u64,
        partition: u64,
        sector_numbers: &[u64],
    ) -> anyhow::Result<()> {
        self.insert(
            policy,
            deadline,
            partition,
            BitField::try_from_bits(sector_numbers.iter().copied())?,
        )
    }

    /// Total partitions and sectors filed, with overflow checked.
    pub fn count(&self) -> anyhow::Result<(u64, u64)> {
        let mut partitions: u64 = 0;
        let mut sectors: u64 = 0;
        for by_partition in self.0.values() {
            let (p, s) = by_partition.count()?;
            partitions =
                partitions.checked_add(p).ok_or_else(|| anyhow!("partition count overflow"))?;
            sectors = sectors.checked_add(s).ok_or_else(|| anyhow!("sector count overflow"))?;
        }
        Ok((partitions, sectors))
    }

    /// Fails if the map addresses more partitions or sectors than allowed in
    /// one message.
    pub fn enforce_limits(&self, max_partitions: u64, max_sectors: u64) -> anyhow::Result<()> {
        let (partitions, sectors) = self.count()?;
        if partitions > max_partitions {
            return Err(anyhow!("{} partitions addressed, max {}", partitions, max_partitions));
        }
        if sectors > max_sectors {
            return Err(anyhow!("{} sectors addressed, max {}", sectors, max_sectors));
        }
        Ok(())
    }

    /// Walks deadlines in increasing index order.
    pub fn iter(&mut self) -> impl Iterator<Item = (u64, &mut PartitionSectorMap)> + '_ {
        self.0.iter_mut().map(|(&deadline, by_partition)| (deadline, by_partition))
    }
}

/// Sector numbers grouped by partition index within one deadline.
#[derive(Default)]
pub struct PartitionSectorMap(BTreeMap<u64, BitField>);

impl PartitionSectorMap {
    /// Merges sector numbers into the partition's entry.
    pub fn insert(&mut self, partition: u64, sector_numbers: BitField) {
        self.0
            .entry(partition)
            .and_modify(|present| *present |= &sector_numbers)
            .or_insert(sector_numbers);
    }

    pub fn insert_values(&mut self, partition: u64, sector_numbers: &[u64]) -> anyhow::Result<()> {
        self.insert(partition, BitField::try_from_bits(sector_numbers.iter().copied())?);
        Ok(())
    }

    pub fn count(&self) -> anyhow::Result<(u64, u64)> {
        let mut sectors: u64 = 0;
        for field in self.0.values() {
            sectors =
                sectors.checked_add(field.len()).ok_or_else(|| anyhow!("sector count overflow"))?;
        }
        Ok((self.0.len() as u64, sectors))
    }

    /// Walks partitions in increasing index order.
    pub fn iter(&mut self) -> impl Iterator<Item = (u64, &mut BitField)> + '_ {
        self.0.iter_mut().map(|(&partition, field)| (partition, field))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_for_one_slot_merge() {
        let policy = Policy::default();
        let mut map = DeadlineSectorMap::new();
        map.insert_values(&policy, 0, 1, &[1, 2, 3]).unwrap();
        map.insert_values(&policy, 0, 1, &[3, 4]).unwrap();

        let (partitions, sectors) = map.count().unwrap();
        assert_eq!(1, partitions);
        assert_eq!(4, sectors);
    }

    #[test]
    fn limits_are_enforced() {
        let policy = Policy::default();
        let mut map = DeadlineSectorMap::new();
        map.insert_values(&policy, 1, 0, &[1, 2, 3]).unwrap();
        map.insert_values(&policy, 2, 0, &[4]).unwrap();

        assert!(map.enforce_limits(2, 4).is_ok());
        assert!(map.enforce_limits(1, 4).is_err());
        assert!(map.enforce_limits(2, 3).is_err());
    }

    #[test]
    fn out_of_range_deadline_is_rejected() {
        let policy = Policy::default();
        let mut map = DeadlineSectorMap::new();
        assert!(map.insert_values(&policy, policy.wpost_period_deadlines, 0, &[1]).is_err());
    }
}
