// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::sector::SectorNumber;
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::Array;

use super::{DeadlineInfo, Deadlines, Partition};

pub fn new_deadline_info(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    DeadlineInfo::new(policy, proving_period_start, deadline_idx, current_epoch)
}

impl Deadlines {
    /// Scans deadlines and partitions for the one holding the sector number.
    pub fn find_sector<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<(u64, u64)> {
        for deadline_idx in 0..self.due.len() as u64 {
            let deadline = self.load_deadline(policy, store, deadline_idx)?;
            let partitions = Array::<Partition, _>::load(&deadline.partitions, store)?;

            let mut found_partition = None;
            partitions.for_each_while(|partition_idx, partition| {
                if partition.sectors.get(sector_number) {
                    found_partition = Some(partition_idx);
                }
                Ok(found_partition.is_none())
            })?;

            if let Some(partition_idx) = found_partition {
                return Ok((deadline_idx, partition_idx));
            }
        }

        Err(anyhow!("sector {} not assigned to any deadline", sector_number))
    }
}

/// A deadline accepts mutations (declarations, terminations, compactions) only
/// while it is at least one full challenge window away from opening. The
/// currently-open deadline and the one about to open are frozen.
pub fn deadline_is_mutable(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    let upcoming =
        new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
            .next_not_elapsed();

    current_epoch < upcoming.open - policy.wpost_challenge_window
}

pub fn quant_spec_for_deadline(policy: &Policy, di: &DeadlineInfo) -> QuantSpec {
    QuantSpec { unit: policy.wpost_proving_period, offset: di.last() }
}

/// Whether a proof logged for this deadline's last window may be disputed now.
/// Disputes are barred while the window is still open, and lapse once the
/// dispute window after its close has passed (at which point the deadline may
/// have been compacted).
pub fn deadline_available_for_optimistic_post_dispute(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    if proving_period_start > current_epoch {
        return false;
    }

    let upcoming =
        new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
            .next_not_elapsed();
    let previous_close = upcoming.close - policy.wpost_proving_period;

    !upcoming.is_open() && current_epoch < previous_close + policy.wpost_dispute_window
}

/// Whether the deadline may be compacted now. Compaction needs the deadline to
/// be mutable and its last window's proofs to be beyond dispute, since it
/// would invalidate the dispute snapshot.
pub fn deadline_available_for_compaction(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    deadline_is_mutable(policy, proving_period_start, deadline_idx, current_epoch)
        && !deadline_available_for_optimistic_post_dispute(
            policy,
            proving_period_start,
            deadline_idx,
            current_epoch,
        )
}

/// Computes the live deadline position from the period offset alone, without
/// consulting recorded cron state. `period_start_seed` is any epoch congruent
/// to the miner's period start.
pub fn new_deadline_info_from_offset_and_epoch(
    policy: &Policy,
    period_start_seed: ChainEpoch,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    let grid = QuantSpec { unit: policy.wpost_proving_period, offset: period_start_seed };
    let period_start = grid.quantize_down(current_epoch);
    let index = ((current_epoch - period_start) / policy.wpost_challenge_window) as u64
        % policy.wpost_period_deadlines;
    new_deadline_info(policy, period_start, index, current_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_next_deadlines_are_frozen() {
        let policy = Policy::default();
        // At the period's first epoch, deadline 0 is open and 1 is on deck.
        assert!(!deadline_is_mutable(&policy, 0, 0, 0));
        assert!(!deadline_is_mutable(&policy, 0, 1, 0));
        assert!(deadline_is_mutable(&policy, 0, 2, 0));
    }

    #[test]
    fn dispute_window_spans_close_to_cutoff() {
        let policy = Policy::default();
        let close = policy.wpost_challenge_window; // deadline 0's close
        assert!(deadline_available_for_optimistic_post_dispute(&policy, 0, 0, close));
        assert!(deadline_available_for_optimistic_post_dispute(
            &policy,
            0,
            0,
            close + policy.wpost_dispute_window - 1
        ));
        assert!(!deadline_available_for_optimistic_post_dispute(
            &policy,
            0,
            0,
            close + policy.wpost_dispute_window
        ));
    }
}
