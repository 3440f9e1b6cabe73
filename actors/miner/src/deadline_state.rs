// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use cid::multihash::Code;
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::CborStore;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::sector::{PoStProof, SectorSize};
use num_traits::Signed;
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::{actor_error, Array};

use super::{
    EpochQueue, ExpirationSet, Partition, PartitionSectorMap, PoStPartition, PowerPair,
    SectorOnChainInfo, Sectors, TerminationResult,
};

// AMT branching factors, chosen for the typical mutation patterns of each array.
const PARTITIONS_AMT_BITWIDTH: u32 = 3;
const PARTITION_EXPIRATIONS_AMT_BITWIDTH: u32 = 5;
// A handful of proofs per window at most; keep the tree flat.
const PROOFS_AMT_BITWIDTH: u32 = 2;

/// The top-level index of deadlines in a proving period: one CID per deadline,
/// in deadline order.
#[derive(Serialize_tuple, Deserialize_tuple)]
pub struct Deadlines {
    /// New-sector placement currently requires loading every deadline to pick
    /// the least-loaded one; inlining the per-deadline counters here would
    /// make that cheaper at the cost of a bigger root object.
    pub due: Vec<Cid>, // []Deadline
}

impl Deadlines {
    pub fn new(policy: &Policy, empty_deadline: Cid) -> Self {
        Self { due: vec![empty_deadline; policy.wpost_period_deadlines as usize] }
    }

    pub fn load_deadline<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        index: u64,
    ) -> anyhow::Result<Deadline> {
        let cid = self
            .due
            .get(index as usize)
            .ok_or_else(|| anyhow!(actor_error!(illegal_argument, "invalid deadline {}", index)))?;
        let _ = policy;

        store
            .get_cbor(cid)
            .with_context(|| format!("reading deadline {}", index))?
            .ok_or_else(|| {
                anyhow!(actor_error!(illegal_state, "deadline {} not found in store", index))
            })
    }

    pub fn for_each<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        mut f: impl FnMut(u64, Deadline) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for index in 0..self.due.len() as u64 {
            f(index, self.load_deadline(policy, store, index)?)?;
        }
        Ok(())
    }

    pub fn update_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        index: u64,
        deadline: &Deadline,
    ) -> anyhow::Result<()> {
        if index >= policy.wpost_period_deadlines {
            return Err(anyhow!("invalid deadline {}", index));
        }
        deadline.check_counters()?;

        self.due[index as usize] = store
            .put_cbor(deadline, Code::Blake2b256)
            .with_context(|| format!("writing deadline {}", index))?;
        Ok(())
    }
}

/// One challenge window's worth of partitions, with the bookkeeping needed to
/// accept proofs optimistically and still let them be disputed afterwards.
///
/// While a window is open, submitted proofs are only recorded (in
/// `proof_log`), not verified. When the window closes, the proof log and the
/// partition and sector tables are frozen into the `*_snapshot` fields, against
/// which a later dispute re-runs verification.
#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct Deadline {
    /// Partitions in assignment order (AMT[PartitionNumber]Partition, dense keys).
    pub partitions: Cid,

    /// Epochs at which some partition here may have sectors due to expire,
    /// quantized to this deadline's close (AMT[ChainEpoch]BitField of
    /// partition numbers). Entries are only removed once their epoch passes;
    /// recoveries may resurrect sectors scheduled in them.
    pub expirations_epochs: Cid,

    /// Partitions covered by a proof in the current window, whether that proof
    /// was logged optimistically or verified on the spot.
    pub partitions_posted: BitField,

    /// Partitions holding sectors in their early-termination queues.
    pub early_terminations: BitField,

    /// Count of live (non-terminated) sectors across all partitions.
    pub live_sectors: u64,

    /// Count of every sector ever assigned, dead or alive.
    pub total_sectors: u64,

    /// Sum of the partitions' faulty power.
    pub faulty_power: PowerPair,

    /// Proofs accepted without verification during the current window
    /// (AMT[]PoStRecord). Verified proofs never appear here.
    pub optimistic_post_submissions: Cid,

    /// The sector table as of the last window close, for dispute verification.
    pub sectors_snapshot: Cid,

    /// The partitions array as of the last window close.
    pub partitions_snapshot: Cid,

    /// The proof log as of the last window close. A successful dispute removes
    /// its target from this snapshot so it cannot be disputed twice.
    pub optimistic_post_submissions_snapshot: Cid,
}

/// A logged, optimistically accepted Window PoSt.
#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct PoStRecord {
    /// The partitions the proof covered.
    pub partitions: BitField,
    /// One proof per registered proof type present (normally exactly one).
    pub proofs: Vec<PoStProof>,
}

/// Snapshot material assembled for disputing one logged proof.
pub struct PoStDispute {
    /// Every sector in the proven partitions, from the snapshot.
    pub all_sectors: BitField,
    /// The subset a verifier would have skipped (faulty/terminated/unproven).
    pub ignored_sectors: BitField,
    /// The snapshot's active sectors per partition; these become faults if the
    /// dispute succeeds.
    pub targets: PartitionSectorMap,
    /// Power to penalize on a successful dispute. May include power that has
    /// since expired or moved, so it must not feed power-table updates.
    pub power: PowerPair,
}

/// Outcome of recording a proof submission against a deadline.
pub struct PoStResult {
    /// Change to network power implied by this submission (activated unproven
    /// power plus recoveries, minus skipped faults).
    pub power_delta: PowerPair,
    pub new_faulty_power: PowerPair,
    pub retracted_recovery_power: PowerPair,
    pub recovered_power: PowerPair,
    /// All sectors in the proven partitions.
    pub sectors: BitField,
    /// The subset of `sectors` to ignore when checking the proof.
    pub ignored_sectors: BitField,
    /// The partitions proven.
    pub partitions: BitField,
}

impl Deadline {
    pub fn new<BS: Blockstore>(store: &BS) -> anyhow::Result<Self> {
        let no_partitions = Array::<Partition, BS>::new_with_bit_width(store, PARTITIONS_AMT_BITWIDTH)
            .flush()
            .context("building empty partitions array")?;
        let no_expirations =
            Array::<BitField, BS>::new_with_bit_width(store, PARTITION_EXPIRATIONS_AMT_BITWIDTH)
                .flush()
                .context("building empty partition-expiration queue")?;
        let no_proofs = Array::<PoStRecord, BS>::new_with_bit_width(store, PROOFS_AMT_BITWIDTH)
            .flush()
            .context("building empty proof log")?;
        let no_sectors = Array::<SectorOnChainInfo, BS>::new(store)
            .flush()
            .context("building empty sectors snapshot")?;

        Ok(Self {
            partitions: no_partitions,
            expirations_epochs: no_expirations,
            partitions_posted: BitField::new(),
            early_terminations: BitField::new(),
            live_sectors: 0,
            total_sectors: 0,
            faulty_power: PowerPair::zero(),
            optimistic_post_submissions: no_proofs,
            sectors_snapshot: no_sectors,
            partitions_snapshot: no_partitions,
            optimistic_post_submissions_snapshot: no_proofs,
        })
    }

    pub fn partitions_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<Array<'db, Partition, BS>> {
        Array::load(&self.partitions, store).context("opening partitions array")
    }

    pub fn snapshot_partitions_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<Array<'db, Partition, BS>> {
        Array::load(&self.partitions_snapshot, store).context("opening partitions snapshot")
    }

    pub fn pending_proofs_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<Array<'db, PoStRecord, BS>> {
        Array::load(&self.optimistic_post_submissions, store).context("opening proof log")
    }

    pub fn snapshot_proofs_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<Array<'db, PoStRecord, BS>> {
        Array::load(&self.optimistic_post_submissions_snapshot, store)
            .context("opening proof log snapshot")
    }

    pub fn load_partition<BS: Blockstore>(
        &self,
        store: &BS,
        index: u64,
    ) -> anyhow::Result<Partition> {
        read_partition(&self.partitions_amt(store)?, index)
    }

    pub fn snapshot_partition<BS: Blockstore>(
        &self,
        store: &BS,
        index: u64,
    ) -> anyhow::Result<Partition> {
        read_partition(&self.snapshot_partitions_amt(store)?, index)
    }

    /// Notes that some partitions may see expirations at an epoch.
    pub fn add_expiration_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        expiration: ChainEpoch,
        partitions: &[u64],
        quant: QuantSpec,
    ) -> anyhow::Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }

        let mut queue = EpochQueue::load(store, &self.expirations_epochs, quant)
            .context("opening partition-expiration queue")?;
        queue
            .enqueue_values(expiration, partitions.iter().copied())
            .context("noting partition expirations")?;
        self.expirations_epochs = queue.entries.flush()?;
        Ok(())
    }

    /// Retires all sectors due through `until` from every partition scheduled
    /// by then, returning the aggregate.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<ExpirationSet> {
        let (due_partitions, any) = self.pop_expired_partitions(store, until, quant)?;
        if !any {
            return Ok(ExpirationSet::empty());
        }

        let mut partitions = self.partitions_amt(store)?;
        let mut total = ExpirationSet::empty();
        let mut with_early = Vec::<u64>::new();

        for index in due_partitions.iter() {
            let expired = with_partition(&mut partitions, index, |partition| {
                partition
                    .pop_expired_sectors(store, until, quant)
                    .with_context(|| format!("expiring sectors in partition {}", index))
            })?;

            if !expired.early_sectors.is_empty() {
                with_early.push(index);
            }

            total.add(
                &expired.on_time_sectors,
                &expired.early_sectors,
                &expired.on_time_pledge,
                &expired.active_power,
                &expired.faulty_power,
            )?;
        }

        self.partitions = partitions.flush()?;

        for index in with_early {
            self.early_terminations.set(index);
        }
        self.live_sectors -= total.len();
        self.faulty_power -= &total.faulty_power;

        Ok(total)
    }

    /// Assigns new sectors, topping up the final partition before opening new
    /// ones. Must not be called on a deadline that is currently or imminently
    /// being challenged.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        partition_size: u64,
        proven: bool,
        mut sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        if sectors.is_empty() {
            return Ok(PowerPair::zero());
        }

        self.live_sectors += sectors.len() as u64;
        self.total_sectors += sectors.len() as u64;

        let mut partitions = self.partitions_amt(store)?;
        let mut total_power = PowerPair::zero();
        let mut expirations_touched = HashMap::<ChainEpoch, Vec<u64>>::new();

        let mut index = partitions.count().saturating_sub(1);
        while !sectors.is_empty() {
            let mut partition = match partitions.get(index)? {
                Some(p) => p.clone(),
                None => Partition::new(store)?,
            };

            let room = partition_size.saturating_sub(partition.sectors.len()) as usize;
            if room == 0 {
                index += 1;
                continue;
            }

            let (batch, rest) = sectors.split_at(room.min(sectors.len()));
            sectors = rest;

            total_power += &partition.add_sectors(store, proven, batch, sector_size, quant)?;
            partitions.set(index, partition)?;

            for sector in batch {
                expirations_touched.entry(sector.expiration).or_default().push(index);
            }
        }

        self.partitions = partitions.flush()?;

        let mut queue = EpochQueue::load(store, &self.expirations_epochs, quant)
            .context("opening partition-expiration queue")?;
        queue.enqueue_many(&expirations_touched).context("noting new sector expirations")?;
        self.expirations_epochs = queue.entries.flush()?;

        Ok(total_power)
    }

    /// Drains early terminations from flagged partitions, up to the limits.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        store: &BS,
        max_partitions: u64,
        max_sectors: u64,
    ) -> anyhow::Result<(TerminationResult, bool)> {
        let mut partitions = self.partitions_amt(store)?;

        let mut result = TerminationResult::new();
        let mut finished = Vec::<u64>::new();

        for index in self.early_terminations.iter() {
            let mut partition = match partitions
                .get(index)
                .with_context(|| format!("reading partition {}", index))?
            {
                Some(p) => p.clone(),
                None => {
                    // Paranoid: a flagged partition may have been compacted away.
                    finished.push(index);
                    continue;
                }
            };

            let (drained, more) = partition
                .pop_early_terminations(store, max_sectors - result.sectors_processed)
                .with_context(|| format!("draining terminations from partition {}", index))?;

            result.absorb(drained);
            if !more {
                finished.push(index);
            }

            partitions.set(index, partition).with_context(|| format!("writing partition {}", index))?;

            if !result.within_limits(max_partitions, max_sectors) {
                break;
            }
        }

        for index in finished {
            self.early_terminations.unset(index);
        }

        self.partitions = partitions.flush()?;
        Ok((result, !self.early_terminations.is_empty()))
    }

    fn pop_expired_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<(BitField, bool)> {
        let mut queue = EpochQueue::load(store, &self.expirations_epochs, quant)
            .context("opening partition-expiration queue")?;
        let (due, any) = queue.drain_through(until)?;
        if any {
            self.expirations_epochs = queue.entries.flush()?;
        }
        Ok((due, any))
    }

    /// Terminates the named live sectors immediately, flagging their
    /// partitions for fee processing. Returns the live power lost.
    pub fn terminate_sectors<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        epoch: ChainEpoch,
        partition_sectors: &mut PartitionSectorMap,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        let mut partitions = self.partitions_amt(store)?;
        let mut power_lost = PowerPair::zero();

        for (index, sector_numbers) in partition_sectors.iter() {
            let removed = with_partition(&mut partitions, index, |partition| {
                partition
                    .terminate_sectors(policy, store, sectors, epoch, sector_numbers, sector_size, quant)
                    .with_context(|| format!("terminating sectors in partition {}", index))
            })?;

            if !removed.is_empty() {
                self.early_terminations.set(index);
                self.live_sectors -= removed.len();
            }
            self.faulty_power -= &removed.faulty_power;
            power_lost += &removed.active_power;
        }

        self.partitions = partitions.flush()?;
        Ok(power_lost)
    }

    /// Removes the named partitions, renumbering the remainder downward, and
    /// returns the live and dead sectors they held plus the power removed.
    /// Only fully-healthy, fully-proven partitions may be removed, and not
    /// while any early termination is outstanding.
    pub fn remove_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        to_remove: &BitField,
        quant: QuantSpec,
    ) -> anyhow::Result<(BitField, BitField, PowerPair)> {
        if to_remove.is_empty() {
            return Ok((BitField::new(), BitField::new(), PowerPair::zero()));
        }
        if !self.early_terminations.is_empty() {
            return Err(anyhow!(actor_error!(
                illegal_argument,
                "cannot compact while early terminations are pending"
            )));
        }

        let existing = self.partitions_amt(store)?;
        let total = existing.count();
        if let Some(out_of_range) = to_remove.last().filter(|&last| last >= total) {
            return Err(anyhow!(actor_error!(
                illegal_argument,
                "partition {} out of range [0, {})",
                out_of_range,
                total
            )));
        }

        let mut kept = Array::<Partition, BS>::new_with_bit_width(store, PARTITIONS_AMT_BITWIDTH);
        let mut live = Vec::<BitField>::new();
        let mut dead = Vec::<BitField>::new();
        let mut removed_power = PowerPair::zero();

        existing.for_each(|index, partition| {
            if !to_remove.get(index) {
                kept.set(kept.count(), partition.clone())?;
                return Ok(());
            }

            if !partition.faults.is_empty() {
                return Err(anyhow!(actor_error!(
                    illegal_argument,
                    "partition {} has faults and cannot be removed",
                    index
                )));
            }
            if !partition.unproven.is_empty() {
                return Err(anyhow!(actor_error!(
                    illegal_argument,
                    "partition {} has unproven sectors and cannot be removed",
                    index
                )));
            }

            live.push(partition.live_sectors());
            dead.push(partition.terminated.clone());
            removed_power += &partition.live_power;
            Ok(())
        })?;

        self.partitions = kept.flush().context("writing compacted partitions")?;

        let live = BitField::union(&live);
        let dead = BitField::union(&dead);
        self.live_sectors -= live.len();
        self.total_sectors -= live.len() + dead.len();

        // Renumber the expiration queue to match the compacted partition indices.
        let mut queue = EpochQueue::load(store, &self.expirations_epochs, quant)
            .context("opening partition-expiration queue")?;
        queue.strip(to_remove).context("renumbering partition expirations")?;
        self.expirations_epochs = queue.entries.flush()?;

        Ok((live, dead, removed_power))
    }

    /// Applies a fault declaration across partitions; returns the network
    /// power delta (negative).
    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        partition_sectors: &mut PartitionSectorMap,
    ) -> anyhow::Result<PowerPair> {
        let mut partitions = self.partitions_amt(store)?;
        let mut power_delta = PowerPair::zero();
        let mut touched = Vec::<u64>::new();

        for (index, sector_numbers) in partition_sectors.iter() {
            let (new_faults, partition_power_delta, partition_faulty_power) =
                with_partition(&mut partitions, index, |partition| {
                    partition
                        .record_faults(
                            store,
                            sectors,
                            sector_numbers,
                            fault_expiration,
                            sector_size,
                            quant,
                        )
                        .with_context(|| format!("recording faults in partition {}", index))
                })?;

            self.faulty_power += &partition_faulty_power;
            power_delta += &partition_power_delta;
            if !new_faults.is_empty() {
                touched.push(index);
            }
        }

        self.partitions = partitions.flush()?;

        // Faulted sectors now expire at the fault horizon; make sure the
        // affected partitions are scheduled there.
        self.add_expiration_partitions(store, fault_expiration, &touched, quant)
            .context("scheduling partitions at fault horizon")?;

        Ok(power_delta)
    }

    /// Applies a recovery declaration across partitions. Power returns only
    /// once a proof confirms it.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        partition_sectors: &mut PartitionSectorMap,
    ) -> anyhow::Result<()> {
        let mut partitions = self.partitions_amt(store)?;

        for (index, sector_numbers) in partition_sectors.iter() {
            with_partition(&mut partitions, index, |partition| {
                partition
                    .declare_faults_recovered(sectors, sector_size, sector_numbers)
                    .with_context(|| format!("declaring recoveries in partition {}", index))
            })?;
        }

        self.partitions = partitions.flush()?;
        Ok(())
    }

    /// Closes the challenge window: partitions without a proof go faulty, the
    /// proof log and partition/sector tables are frozen for the dispute
    /// window, and the posted set resets.
    ///
    /// Returns the power delta and the power subject to penalty.
    pub fn process_deadline_end<BS: Blockstore>(
        &mut self,
        store: &BS,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        sectors: Cid,
    ) -> anyhow::Result<(PowerPair, PowerPair)> {
        let mut partitions = self.partitions_amt(store)?;

        let mut power_delta = PowerPair::zero();
        let mut penalized_power = PowerPair::zero();
        let mut rescheduled = Vec::<u64>::new();
        let mut changed = false;

        for index in 0..partitions.count() {
            if self.partitions_posted.get(index) {
                continue;
            }

            let mut partition = partitions
                .get(index)
                .with_context(|| format!("reading partition {}", index))?
                .cloned()
                .ok_or_else(|| anyhow!(actor_error!(illegal_state, "no partition {}", index)))?;

            // Already entirely faulty with nothing recovering: a repeat
            // offender costs nothing new, skip the write.
            if partition.recovering_power.is_zero() && partition.faulty_power == partition.live_power
            {
                continue;
            }

            let (partition_power_delta, partition_penalized, partition_new_faulty) =
                partition.record_missed_post(store, fault_expiration, quant).with_context(
                    || format!("recording missed proof for partition {}", index),
                )?;

            if !partition_new_faulty.is_zero() {
                rescheduled.push(index);
            }

            partitions.set(index, partition).with_context(|| format!("writing partition {}", index))?;
            changed = true;

            self.faulty_power += &partition_new_faulty;
            power_delta += &partition_power_delta;
            penalized_power += &partition_penalized;
        }

        if changed {
            self.partitions = partitions.flush()?;
        }

        self.add_expiration_partitions(store, fault_expiration, &rescheduled, quant)
            .context("scheduling missed partitions at fault horizon")?;

        // Freeze this window for disputes and reset for the next one.
        self.partitions_posted = BitField::new();
        self.partitions_snapshot = self.partitions;
        self.optimistic_post_submissions_snapshot = self.optimistic_post_submissions;
        self.optimistic_post_submissions =
            Array::<PoStRecord, BS>::new_with_bit_width(store, PROOFS_AMT_BITWIDTH)
                .flush()
                .context("resetting proof log")?;
        // The sector table only matters to a dispute if there is a proof to
        // dispute; otherwise keep the snapshot empty.
        self.sectors_snapshot =
            if self.optimistic_post_submissions_snapshot == self.optimistic_post_submissions {
                Array::<SectorOnChainInfo, BS>::new(store)
                    .flush()
                    .context("resetting sectors snapshot")?
            } else {
                sectors
            };

        Ok((power_delta, penalized_power))
    }

    /// Applies a proof submission to the deadline's partitions: skipped sectors
    /// become faults, pending recoveries are honored, and unproven power
    /// activates. Proof bytes are NOT checked here; the caller either verifies
    /// them immediately (when recoveries are present) or logs them for the
    /// dispute window.
    pub fn record_proven_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        post_partitions: &mut [PoStPartition],
    ) -> anyhow::Result<PoStResult> {
        let proven_partitions = BitField::try_from_bits(post_partitions.iter().map(|p| p.index))?;
        if proven_partitions.len() != post_partitions.len() as u64 {
            return Err(anyhow!(actor_error!(
                illegal_argument,
                "duplicate partitions in proof submission"
            )));
        }
        if self.partitions_posted.contains_any(&proven_partitions) {
            return Err(anyhow!(actor_error!(
                illegal_argument,
                "partition already proven this window"
            )));
        }

        let mut partitions = self.partitions_amt(store)?;

        let mut result = PoStResult {
            power_delta: PowerPair::zero(),
            new_faulty_power: PowerPair::zero(),
            retracted_recovery_power: PowerPair::zero(),
            recovered_power: PowerPair::zero(),
            sectors: BitField::new(),
            ignored_sectors: BitField::new(),
            partitions: proven_partitions,
        };
        let mut rescheduled = Vec::<u64>::new();
        let mut all_sectors = Vec::<BitField>::new();
        let mut all_ignored = Vec::<BitField>::new();

        for post in post_partitions {
            let index = post.index;
            let mut partition = partitions
                .get(index)
                .with_context(|| format!("reading partition {}", index))?
                .cloned()
                .ok_or_else(|| anyhow!(actor_error!(not_found, "no partition {}", index)))?;

            // Skipped sectors go faulty before the proof's sector set is taken.
            let (mut partition_power_delta, new_faulty, retracted, any_new_faults) = partition
                .record_skipped_faults(store, sectors, sector_size, quant, fault_expiration, &post.skipped)
                .with_context(|| format!("recording skipped faults in partition {}", index))?;
            if any_new_faults {
                rescheduled.push(index);
            }

            // Everything still marked recovering is considered proven again.
            let recovered = partition
                .recover_faults(store, sectors, sector_size, quant)
                .with_context(|| format!("recovering sectors in partition {}", index))?;

            // The first proof over the partition activates its parked power.
            partition_power_delta += &partition.activate_unproven();

            all_sectors.push(partition.sectors.clone());
            all_ignored.push(partition.faults.clone());
            all_ignored.push(partition.terminated.clone());

            partitions.set(index, partition).with_context(|| format!("writing partition {}", index))?;

            self.faulty_power -= &recovered;
            self.faulty_power += &new_faulty;
            self.partitions_posted.set(index);

            result.new_faulty_power += &new_faulty;
            result.retracted_recovery_power += &retracted;
            result.recovered_power += &recovered;
            result.power_delta += &partition_power_delta;
            result.power_delta += &recovered;
        }

        self.add_expiration_partitions(store, fault_expiration, &rescheduled, quant)
            .context("scheduling skipped partitions at fault horizon")?;

        self.partitions = partitions.flush()?;

        result.sectors = BitField::union(&all_sectors);
        result.ignored_sectors = BitField::union(&all_ignored);
        Ok(result)
    }

    /// Appends an optimistically accepted proof to the window's log.
    pub fn log_proof<BS: Blockstore>(
        &mut self,
        store: &BS,
        partitions: &BitField,
        proofs: &[PoStProof],
    ) -> anyhow::Result<()> {
        let mut log = self.pending_proofs_amt(store)?;
        log.set(
            log.count(),
            PoStRecord { partitions: partitions.clone(), proofs: proofs.to_vec() },
        )
        .context("appending to proof log")?;
        self.optimistic_post_submissions = log.flush()?;
        Ok(())
    }

    /// Removes and returns the indexed proof from the dispute snapshot. After
    /// this, the same proof can never be disputed again; a failed dispute must
    /// roll the removal back by aborting.
    pub fn take_snapshot_proof<BS: Blockstore>(
        &mut self,
        store: &BS,
        index: u64,
    ) -> anyhow::Result<(BitField, Vec<PoStProof>)> {
        let mut log = self.snapshot_proofs_amt(store)?;
        let record = log
            .delete(index)
            .with_context(|| format!("extracting proof {}", index))?
            .ok_or_else(|| {
                anyhow!(actor_error!(illegal_argument, "no proof {} in snapshot", index))
            })?;
        self.optimistic_post_submissions_snapshot = log.flush()?;
        Ok((record.partitions, record.proofs))
    }

    /// Gathers from the snapshot everything needed to re-verify a logged proof
    /// and to fault its sectors should verification fail.
    pub fn dispute_snapshot<BS: Blockstore>(
        &self,
        store: &BS,
        partitions: BitField,
    ) -> anyhow::Result<PoStDispute> {
        let snapshot = self.snapshot_partitions_amt(store)?;

        let mut all_sectors = Vec::<BitField>::new();
        let mut ignored = Vec::<BitField>::new();
        let mut targets = PartitionSectorMap::default();
        let mut power = PowerPair::zero();

        for index in partitions.iter() {
            let partition = read_partition(&snapshot, index)
                .with_context(|| format!("reading snapshot partition {}", index))?;

            all_sectors.push(partition.sectors.clone());
            ignored.push(partition.faults.clone());
            ignored.push(partition.terminated.clone());
            ignored.push(partition.unproven.clone());

            targets.insert(index, partition.active_sectors());
            power += &partition.active_power();
        }

        Ok(PoStDispute {
            all_sectors: BitField::union(&all_sectors),
            ignored_sectors: BitField::union(&ignored),
            targets,
            power,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.live_sectors == 0 && self.total_sectors == 0
    }

    /// Cheap sanity checks on the memoized counters.
    pub fn check_counters(&self) -> anyhow::Result<()> {
        if self.live_sectors > self.total_sectors {
            return Err(anyhow!("more live than total sectors"));
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!("negative faulty power"));
        }
        Ok(())
    }
}

fn read_partition<BS: Blockstore>(
    partitions: &Array<Partition, BS>,
    index: u64,
) -> anyhow::Result<Partition> {
    partitions
        .get(index)
        .with_context(|| format!("reading partition {}", index))?
        .cloned()
        .ok_or_else(|| anyhow!(actor_error!(not_found, "no partition {}", index)))
}

/// Loads a partition, applies the mutation, and writes it back.
fn with_partition<BS: Blockstore, T>(
    partitions: &mut Array<Partition, BS>,
    index: u64,
    f: impl FnOnce(&mut Partition) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut partition = read_partition(partitions, index)?;
    let out = f(&mut partition)?;
    partitions.set(index, partition).with_context(|| format!("writing partition {}", index))?;
    Ok(out)
}
