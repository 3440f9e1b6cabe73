// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;

use anyhow::anyhow;

use super::{Deadline, SectorOnChainInfo};

fn div_rounding_up(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor > 0)
}

struct DeadlineAssignmentInfo {
    index: usize,
    live_sectors: u64,
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    fn partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.total_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn compact_partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.live_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn is_full_now(&self, partition_size: u64) -> bool {
        self.total_sectors % partition_size == 0
    }

    fn max_partitions_reached(&self, partition_size: u64, max_partitions: u64) -> bool {
        self.total_sectors >= partition_size * max_partitions
    }
}

fn cmp(a: &DeadlineAssignmentInfo, b: &DeadlineAssignmentInfo, partition_size: u64, max_partitions: u64) -> Ordering {
    // When assigning partitions to deadlines, we're trying to optimize the
    // following:
    //
    // First, avoid increasing the maximum number of partitions in any
    // deadline, across all deadlines, after compaction. This would
    // necessitate invoking WindowedPoSt with more than the average number of
    // sectors.
    //
    // Second, avoid forcing the miner to repeatedly compact partitions. A
    // miner would be "forced" to compact a partition when a the number of
    // partitions in any given deadline goes above the average partitions per
    // deadline.

    // Above all else, make sure we don't exceed the maximum number of partitions.
    {
        let a_maxed = a.max_partitions_reached(partition_size, max_partitions);
        let b_maxed = b.max_partitions_reached(partition_size, max_partitions);
        if a_maxed != b_maxed {
            // prefer the deadline that hasn't reached the max
            return if a_maxed { Ordering::Greater } else { Ordering::Less };
        }
        if a_maxed && b_maxed {
            return a.index.cmp(&b.index);
        }
    }

    // Otherwise, minimize the maximum number of partitions after compaction.
    match a
        .compact_partitions_after_assignment(partition_size)
        .cmp(&b.compact_partitions_after_assignment(partition_size))
    {
        Ordering::Equal => {}
        o => return o,
    }

    // Then, minimize the maximum number of partitions, period.
    match a
        .partitions_after_assignment(partition_size)
        .cmp(&b.partitions_after_assignment(partition_size))
    {
        Ordering::Equal => {}
        o => return o,
    }

    // Then, prefer filling up partially-filled partitions over opening new ones.
    match (a.is_full_now(partition_size), b.is_full_now(partition_size)) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {
            // Fill the fuller of the two open partitions first.
            match a.total_sectors.cmp(&b.total_sectors).reverse() {
                Ordering::Equal => {}
                o => return o,
            }
        }
        (true, true) => {}
    }

    // Next, prefer deadlines with fewer live sectors.
    match a.live_sectors.cmp(&b.live_sectors) {
        Ordering::Equal => {}
        o => return o,
    }

    // Finally, fall back on the deadline index for determinism.
    a.index.cmp(&b.index)
}

/// Assigns partitions to deadlines, first filling partial partitions, then
/// adding new partitions to deadlines with the fewest live sectors.
pub fn assign_deadlines(
    max_partitions: u64,
    partition_size: u64,
    deadlines: &[Option<Deadline>],
    sectors: Vec<SectorOnChainInfo>,
) -> anyhow::Result<Vec<Vec<SectorOnChainInfo>>> {
    struct Entry {
        info: DeadlineAssignmentInfo,
        sectors: Vec<SectorOnChainInfo>,
    }

    let mut entries: Vec<Entry> = deadlines
        .iter()
        .enumerate()
        .filter_map(|(index, deadline)| deadline.as_ref().map(|dl| (index, dl)))
        .map(|(index, deadline)| Entry {
            info: DeadlineAssignmentInfo {
                index,
                live_sectors: deadline.live_sectors,
                total_sectors: deadline.total_sectors,
            },
            sectors: Vec::new(),
        })
        .collect();

    if entries.is_empty() {
        return Err(anyhow!("no open deadlines to assign sectors to"));
    }

    for sector in sectors {
        // Assignment changes exactly one entry each round, so a linear scan for
        // the minimum is plenty for 48 deadlines.
        let next = entries
            .iter_mut()
            .min_by(|a, b| cmp(&a.info, &b.info, partition_size, max_partitions))
            .expect("at least one open deadline");

        if next.info.max_partitions_reached(partition_size, max_partitions) {
            return Err(anyhow!(
                "maxPartitions limit {} reached for all deadlines",
                max_partitions
            ));
        }

        next.sectors.push(sector);
        next.info.live_sectors += 1;
        next.info.total_sectors += 1;
    }

    let mut out = vec![Vec::new(); deadlines.len()];
    for entry in entries {
        out[entry.info.index] = entry.sectors;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use fvm_ipld_blockstore::MemoryBlockstore;

    use super::*;

    fn empty_deadlines(count: usize) -> Vec<Option<Deadline>> {
        let store = MemoryBlockstore::default();
        (0..count).map(|_| Some(Deadline::new(&store).unwrap())).collect()
    }

    fn sector(number: u64) -> SectorOnChainInfo {
        SectorOnChainInfo { sector_number: number, ..Default::default() }
    }

    #[test]
    fn fills_one_partition_before_spreading() {
        let partition_size = 4;
        let mut deadlines = empty_deadlines(4);
        // Deadline 0 is closed for assignment.
        deadlines[0] = None;

        let assignment =
            assign_deadlines(100, partition_size, &deadlines, (0..4).map(sector).collect())
                .unwrap();

        assert!(assignment[0].is_empty());
        // All sectors land in a single deadline to fill one partition.
        assert_eq!(assignment[1].len(), 4);
        assert!(assignment[2].is_empty());
        assert!(assignment[3].is_empty());
    }

    #[test]
    fn spreads_full_partitions_across_deadlines() {
        let partition_size = 2;
        let mut deadlines = empty_deadlines(3);
        deadlines[0] = None;

        let assignment =
            assign_deadlines(100, partition_size, &deadlines, (0..4).map(sector).collect())
                .unwrap();

        // Two full partitions, one per open deadline.
        assert_eq!(assignment[1].len(), 2);
        assert_eq!(assignment[2].len(), 2);
    }

    #[test]
    fn fails_when_all_deadlines_are_full() {
        let partition_size = 1;
        let deadlines = empty_deadlines(2);

        let err = assign_deadlines(1, partition_size, &deadlines, (0..3).map(sector).collect());
        assert!(err.is_err());
    }
}
