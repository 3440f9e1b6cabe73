// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;
use std::collections::HashMap;

use anyhow::{anyhow, Context};
use cid::multihash::Code;
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{serde_bytes, BytesDe, Cbor, CborStore};
use fvm_shared::address::Address;
use fvm_shared::clock::{ChainEpoch, QuantSpec, EPOCH_UNDEFINED};
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{RegisteredPoStProof, SectorNumber, SectorSize};
use fvm_shared::HAMT_BIT_WIDTH;
use num_traits::{Signed, Zero};
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::{
    actor_error, make_empty_map, make_map_with_root_and_bitwidth, u64_key, ActorError, Array,
    AsActorError, Map,
};

use super::deadlines::new_deadline_info;
use super::policy::*;
use super::types::*;
use super::{
    assign_deadlines, deadline_is_mutable, new_deadline_info_from_offset_and_epoch,
    quant_spec_for_deadline, Deadline, DeadlineInfo, Deadlines, EpochQueue, PowerPair, Sectors,
    TerminationResult, VestingFunds,
};

pub const SECTORS_AMT_BITWIDTH: u32 = 5;
const PRECOMMIT_CLEANUP_AMT_BITWIDTH: u32 = 6;

/// The miner actor's root state object.
///
/// The actor's balance backs three pools tracked here — pre-commit deposits,
/// initial pledge and locked (vesting) rewards — and must always cover their
/// sum; `check_balance_invariants` enforces that at every message boundary.
/// Fee debt sits outside the pools: it is an obligation, not a reservation.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug)]
pub struct State {
    /// Static configuration (addresses, proof type, peer info), by CID.
    pub info: Cid,

    /// Sum of deposits across all pending pre-commitments.
    pub pre_commit_deposits: TokenAmount,

    /// Sum of funds still vesting.
    pub locked_funds: TokenAmount,

    /// The vesting schedule backing `locked_funds` (VestingFunds).
    pub vesting_funds: Cid,

    /// Penalties charged but not yet paid.
    pub fee_debt: TokenAmount,

    /// Sum of initial pledge across all active sectors.
    pub initial_pledge: TokenAmount,

    /// Pending pre-commitments (HAMT[SectorNumber]SectorPreCommitOnChainInfo).
    pub pre_committed_sectors: Cid,

    /// Schedule for reclaiming deposits of pre-commitments that never proved
    /// (EpochQueue over sector numbers).
    pub pre_committed_sectors_cleanup: Cid,

    /// Every sector number ever handed out; numbers are never reused
    /// (stored BitField).
    pub allocated_sectors: Cid,

    /// Proven sectors (sparse AMT[SectorNumber]SectorOnChainInfo). Entries
    /// linger after termination until their partition is compacted.
    pub sectors: Cid,

    /// First epoch of the current proving period. Derived at construction from
    /// a per-miner offset; possibly in the future for brand-new miners, which
    /// are exempt from proving until their first full period starts.
    pub proving_period_start: ChainEpoch,

    /// Index of the deadline most recently opened (not yet closed by cron).
    pub current_deadline: u64,

    /// The deadline index (Deadlines), by CID.
    pub deadlines: Cid,

    /// Deadlines whose partitions hold unprocessed early terminations.
    pub early_terminations: BitField,

    /// Whether the per-deadline cron callback is currently enrolled.
    pub deadline_cron_active: bool,
}

impl Cbor for State {}

#[derive(PartialEq, Eq)]
pub enum CollisionPolicy {
    AllowCollisions,
    DenyCollisions,
}

impl State {
    pub fn new<BS: Blockstore>(
        policy: &Policy,
        store: &BS,
        info_cid: Cid,
        period_start: ChainEpoch,
        deadline_idx: u64,
    ) -> anyhow::Result<Self> {
        let no_precommits =
            make_empty_map::<BS, SectorPreCommitOnChainInfo>(store, HAMT_BIT_WIDTH)
                .flush()
                .context("building empty pre-commit table")?;
        let no_cleanups =
            Array::<BitField, BS>::new_with_bit_width(store, PRECOMMIT_CLEANUP_AMT_BITWIDTH)
                .flush()
                .context("building empty pre-commit cleanup queue")?;
        let no_sectors =
            Array::<SectorOnChainInfo, BS>::new_with_bit_width(store, SECTORS_AMT_BITWIDTH)
                .flush()
                .context("building empty sector table")?;
        let no_allocations = store
            .put_cbor(&BitField::new(), Code::Blake2b256)
            .context("storing empty allocation bitfield")?;
        let empty_deadline = store
            .put_cbor(&Deadline::new(store)?, Code::Blake2b256)
            .context("storing empty deadline")?;
        let deadlines = store
            .put_cbor(&Deadlines::new(policy, empty_deadline), Code::Blake2b256)
            .context("storing deadline index")?;
        let vesting = store
            .put_cbor(&VestingFunds::new(), Code::Blake2b256)
            .context("storing empty vesting table")?;

        Ok(Self {
            info: info_cid,
            pre_commit_deposits: TokenAmount::zero(),
            locked_funds: TokenAmount::zero(),
            vesting_funds: vesting,
            fee_debt: TokenAmount::zero(),
            initial_pledge: TokenAmount::zero(),
            pre_committed_sectors: no_precommits,
            pre_committed_sectors_cleanup: no_cleanups,
            allocated_sectors: no_allocations,
            sectors: no_sectors,
            proving_period_start: period_start,
            current_deadline: deadline_idx,
            deadlines,
            early_terminations: BitField::new(),
            deadline_cron_active: false,
        })
    }

    //
    // Info
    //

    pub fn get_info<BS: Blockstore>(&self, store: &BS) -> anyhow::Result<MinerInfo> {
        store
            .get_cbor(&self.info)
            .context("reading miner info")?
            .ok_or_else(|| anyhow!(actor_error!(not_found, "miner info not found")))
    }

    pub fn save_info<BS: Blockstore>(
        &mut self,
        store: &BS,
        info: &MinerInfo,
    ) -> anyhow::Result<()> {
        self.info = store.put_cbor(info, Code::Blake2b256).context("writing miner info")?;
        Ok(())
    }

    //
    // Deadline arithmetic
    //

    /// The live deadline position implied by the current epoch and this
    /// miner's period offset. Correct even when the cron has lapsed.
    pub fn deadline_info(&self, policy: &Policy, current_epoch: ChainEpoch) -> DeadlineInfo {
        new_deadline_info_from_offset_and_epoch(policy, self.proving_period_start, current_epoch)
    }

    /// The deadline position as recorded by the last cron advance. Stale if
    /// the cron is inactive; cron itself must use this so as not to skip
    /// deadlines.
    pub fn recorded_deadline_info(
        &self,
        policy: &Policy,
        current_epoch: ChainEpoch,
    ) -> DeadlineInfo {
        new_deadline_info(policy, self.proving_period_start, self.current_deadline, current_epoch)
    }

    pub fn current_proving_period_start(
        &self,
        policy: &Policy,
        current_epoch: ChainEpoch,
    ) -> ChainEpoch {
        self.deadline_info(policy, current_epoch).period_start
    }

    pub fn quant_spec_for_deadline(&self, policy: &Policy, deadline_idx: u64) -> QuantSpec {
        new_deadline_info(policy, self.proving_period_start, deadline_idx, 0).quant_spec()
    }

    //
    // Sector number allocation
    //

    /// Marks sector numbers as used forever. Under `DenyCollisions` any number
    /// already handed out is an error.
    pub fn allocate_sector_numbers<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
        policy: CollisionPolicy,
    ) -> Result<(), ActorError> {
        let taken: BitField = store
            .get_cbor(&self.allocated_sectors)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading allocation bitfield")?
            .context_code(ExitCode::USR_ILLEGAL_STATE, "allocation bitfield not found")?;

        if policy == CollisionPolicy::DenyCollisions {
            let collisions = &taken & sector_numbers;
            if !collisions.is_empty() {
                return Err(actor_error!(
                    illegal_argument,
                    "sector numbers {:?} already allocated",
                    collisions
                ));
            }
        }

        self.allocated_sectors = store
            .put_cbor(&(&taken | sector_numbers), Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_ARGUMENT, "writing allocation bitfield")?;
        Ok(())
    }

    //
    // Pre-commitments
    //

    fn precommit_table<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> anyhow::Result<Map<'bs, BS, SectorPreCommitOnChainInfo>> {
        make_map_with_root_and_bitwidth(&self.pre_committed_sectors, store, HAMT_BIT_WIDTH)
            .context("opening pre-commit table")
    }

    /// Records fresh pre-commitments; duplicates are an error.
    pub fn put_precommitted_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        precommits: Vec<SectorPreCommitOnChainInfo>,
    ) -> anyhow::Result<()> {
        let mut table = self.precommit_table(store)?;
        for precommit in precommits {
            let number = precommit.info.sector_number;
            let inserted = table
                .set_if_absent(u64_key(number), precommit)
                .with_context(|| format!("writing pre-commitment for sector {}", number))?;
            if !inserted {
                return Err(anyhow!("sector {} already pre-committed", number));
            }
        }
        self.pre_committed_sectors = table.flush()?;
        Ok(())
    }

    pub fn get_precommitted_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<Option<SectorPreCommitOnChainInfo>> {
        Ok(self.precommit_table(store)?.get(&u64_key(sector_number))?.cloned())
    }

    /// Fetches the named pre-commitments, silently skipping numbers with no
    /// pending record (already proven or cleaned up).
    pub fn find_precommitted_sectors<BS: Blockstore>(
        &self,
        store: &BS,
        sector_numbers: &[SectorNumber],
    ) -> anyhow::Result<Vec<SectorPreCommitOnChainInfo>> {
        let table = self.precommit_table(store)?;
        let mut found = Vec::with_capacity(sector_numbers.len());
        for &number in sector_numbers {
            if let Some(precommit) = table
                .get(&u64_key(number))
                .with_context(|| format!("reading pre-commitment for sector {}", number))?
            {
                found.push(precommit.clone());
            }
        }
        Ok(found)
    }

    /// Fetches the named pre-commitments, failing if any is absent.
    pub fn get_all_precommitted_sectors<BS: Blockstore>(
        &self,
        store: &BS,
        sector_numbers: &BitField,
    ) -> anyhow::Result<Vec<SectorPreCommitOnChainInfo>> {
        let table = self.precommit_table(store)?;
        let mut found = Vec::new();
        for number in sector_numbers.iter() {
            let precommit = table
                .get(&u64_key(number))
                .with_context(|| format!("reading pre-commitment for sector {}", number))?
                .ok_or_else(|| actor_error!(not_found, "sector {} not pre-committed", number))?;
            found.push(precommit.clone());
        }
        Ok(found)
    }

    pub fn delete_precommitted_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &[SectorNumber],
    ) -> anyhow::Result<()> {
        let mut table = self.precommit_table(store)?;
        for &number in sector_numbers {
            table
                .delete(&u64_key(number))?
                .ok_or_else(|| anyhow!("no pre-commitment for sector {}", number))?;
        }
        self.pre_committed_sectors = table.flush()?;
        Ok(())
    }

    /// Grid on which pre-commit cleanups are scheduled: once per challenge
    /// window, aligned with this miner's period.
    pub fn quant_spec_every_deadline(&self, policy: &Policy) -> QuantSpec {
        QuantSpec { unit: policy.wpost_challenge_window, offset: self.proving_period_start }
    }

    pub fn add_pre_commit_clean_ups<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        cleanup_events: Vec<(ChainEpoch, SectorNumber)>,
    ) -> anyhow::Result<()> {
        let mut by_epoch = HashMap::<ChainEpoch, Vec<u64>>::new();
        for (epoch, number) in cleanup_events {
            by_epoch.entry(epoch).or_default().push(number);
        }

        let mut queue = EpochQueue::load(
            store,
            &self.pre_committed_sectors_cleanup,
            self.quant_spec_every_deadline(policy),
        )
        .context("opening pre-commit cleanup queue")?;
        queue.enqueue_many(&by_epoch).context("scheduling pre-commit cleanups")?;
        self.pre_committed_sectors_cleanup = queue.entries.flush()?;
        Ok(())
    }

    /// Deletes pre-commitments whose cleanup epoch has arrived without a
    /// proof, returning the total deposit to forfeit.
    pub fn cleanup_expired_pre_commits<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        let mut queue = EpochQueue::load(
            store,
            &self.pre_committed_sectors_cleanup,
            self.quant_spec_every_deadline(policy),
        )
        .context("opening pre-commit cleanup queue")?;
        let (due, changed) = queue.drain_through(current_epoch)?;
        if changed {
            self.pre_committed_sectors_cleanup = queue.entries.flush()?;
        }

        let table = self.precommit_table(store)?;
        let mut forfeited = TokenAmount::zero();
        let mut to_delete = Vec::<SectorNumber>::new();
        for number in due.iter() {
            // A missing record just means the sector proved in time.
            if let Some(precommit) = table.get(&u64_key(number))? {
                forfeited += &precommit.pre_commit_deposit;
                to_delete.push(number);
            }
        }

        if !to_delete.is_empty() {
            self.delete_precommitted_sectors(store, &to_delete)?;
        }

        self.pre_commit_deposits -= &forfeited;
        if self.pre_commit_deposits.is_negative() {
            return Err(anyhow!("pre-commit deposit pool underflow during cleanup"));
        }
        Ok(forfeited)
    }

    //
    // Sector table
    //

    pub fn has_sector_number<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<bool> {
        Ok(Sectors::load(store, &self.sectors)?.get(sector_number)?.is_some())
    }

    pub fn put_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        new_sectors: Vec<SectorOnChainInfo>,
    ) -> anyhow::Result<()> {
        let mut sectors = Sectors::load(store, &self.sectors).context("opening sector table")?;
        sectors.store(new_sectors)?;
        self.sectors = sectors.amt.flush().context("writing sector table")?;
        Ok(())
    }

    pub fn get_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<Option<SectorOnChainInfo>> {
        Sectors::load(store, &self.sectors)?.get(sector_number)
    }

    pub fn delete_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
    ) -> anyhow::Result<()> {
        let mut sectors = Sectors::load(store, &self.sectors)?;
        for number in sector_numbers.iter() {
            sectors
                .amt
                .delete(number)
                .with_context(|| format!("deleting sector {}", number))?
                .ok_or_else(|| anyhow!("sector {} not present to delete", number))?;
        }
        self.sectors = sectors.amt.flush()?;
        Ok(())
    }

    pub fn for_each_sector<BS: Blockstore, F>(&self, store: &BS, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&SectorOnChainInfo) -> anyhow::Result<()>,
    {
        Sectors::load(store, &self.sectors)?.amt.for_each(|_, sector| f(sector))?;
        Ok(())
    }

    pub fn load_sector_infos<BS: Blockstore>(
        &self,
        store: &BS,
        sectors: &BitField,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        Ok(Sectors::load(store, &self.sectors)?.load_sector(sectors)?)
    }

    //
    // Deadlines
    //

    pub fn load_deadlines<BS: Blockstore>(&self, store: &BS) -> Result<Deadlines, ActorError> {
        store
            .get_cbor::<Deadlines>(&self.deadlines)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading deadline index")?
            .context_code(ExitCode::USR_ILLEGAL_STATE, "deadline index not found")
    }

    pub fn save_deadlines<BS: Blockstore>(
        &mut self,
        store: &BS,
        deadlines: Deadlines,
    ) -> anyhow::Result<()> {
        self.deadlines =
            store.put_cbor(&deadlines, Code::Blake2b256).context("writing deadline index")?;
        Ok(())
    }

    /// Spreads freshly proven sectors over the mutable deadlines, balancing
    /// partition load. The sectors enter unproven; their power activates with
    /// their first Window PoSt.
    pub fn assign_sectors_to_deadlines<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
        mut sectors: Vec<SectorOnChainInfo>,
        partition_size: u64,
        sector_size: SectorSize,
    ) -> anyhow::Result<()> {
        let mut deadlines = self.load_deadlines(store)?;

        // Ordering by sector number keeps partition bitfields dense.
        sectors.sort_by_key(|sector| sector.sector_number);

        // Only deadlines that are not currently (or next) being challenged may
        // receive sectors; the rest stay out of the candidate list.
        let period_start = self.current_proving_period_start(policy, current_epoch);
        let mut candidates: Vec<Option<Deadline>> =
            (0..policy.wpost_period_deadlines).map(|_| None).collect();
        deadlines.for_each(policy, store, |index, deadline| {
            if deadline_is_mutable(policy, period_start, index, current_epoch) {
                candidates[index as usize] = Some(deadline);
            }
            Ok(())
        })?;

        let placements = assign_deadlines(
            policy.max_partitions_per_deadline,
            partition_size,
            &candidates,
            sectors,
        )?;

        for (index, placed) in placements.into_iter().enumerate() {
            if placed.is_empty() {
                continue;
            }

            let deadline = candidates[index].as_mut().expect("placement into closed deadline");
            deadline.add_sectors(
                store,
                partition_size,
                false, // power activates at first proof
                &placed,
                sector_size,
                self.quant_spec_for_deadline(policy, index as u64),
            )?;

            deadlines.update_deadline(policy, store, index as u64, deadline)?;
        }

        self.save_deadlines(store, deadlines)?;
        Ok(())
    }

    /// Drains early terminations across flagged deadlines, up to the limits.
    /// The boolean reports whether any work remains afterwards.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        max_partitions: u64,
        max_sectors: u64,
    ) -> anyhow::Result<(TerminationResult, bool)> {
        if self.early_terminations.is_empty() {
            return Ok((Default::default(), false));
        }

        let mut deadlines = self.load_deadlines(store)?;
        let mut result = TerminationResult::new();
        let mut drained_dry = Vec::<u64>::new();

        for index in self.early_terminations.iter() {
            let mut deadline = deadlines.load_deadline(policy, store, index)?;

            let (drained, more) = deadline
                .pop_early_terminations(
                    store,
                    max_partitions - result.partitions_processed,
                    max_sectors - result.sectors_processed,
                )
                .with_context(|| format!("draining terminations from deadline {}", index))?;

            result.absorb(drained);
            if !more {
                drained_dry.push(index);
            }

            deadlines.update_deadline(policy, store, index, &deadline)?;

            if !result.within_limits(max_partitions, max_sectors) {
                break;
            }
        }

        for index in drained_dry {
            self.early_terminations.unset(index);
        }
        self.save_deadlines(store, deadlines)?;

        Ok((result, !self.early_terminations.is_empty()))
    }

    /// Whether the sector is present and healthy at the given position.
    /// `require_proven` additionally rejects sectors awaiting their first
    /// proof.
    pub fn check_sector_active<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        deadline_idx: u64,
        partition_idx: u64,
        sector_number: SectorNumber,
        require_proven: bool,
    ) -> Result<bool, ActorError> {
        let partition = self
            .load_deadlines(store)?
            .load_deadline(policy, store, deadline_idx)
            .context_code(
                ExitCode::USR_ILLEGAL_STATE,
                format!("reading deadline {}", deadline_idx),
            )?
            .load_partition(store, partition_idx)
            .context_code(
                ExitCode::USR_ILLEGAL_STATE,
                format!("reading partition {}", partition_idx),
            )?;

        if !partition.sectors.get(sector_number) {
            return Err(actor_error!(
                not_found,
                "sector {} not in deadline {} partition {}",
                sector_number,
                deadline_idx,
                partition_idx
            ));
        }

        let healthy = !partition.faults.get(sector_number)
            && !partition.terminated.get(sector_number)
            && !(require_proven && partition.unproven.get(sector_number));
        Ok(healthy)
    }

    //
    // Funds
    //

    pub fn add_pre_commit_deposit(&mut self, amount: &TokenAmount) -> anyhow::Result<()> {
        self.pre_commit_deposits += amount;
        if self.pre_commit_deposits.is_negative() {
            return Err(anyhow!("pre-commit deposit pool underflow by {}", amount));
        }
        Ok(())
    }

    pub fn add_initial_pledge(&mut self, amount: &TokenAmount) -> anyhow::Result<()> {
        self.initial_pledge += amount;
        if self.initial_pledge.is_negative() {
            return Err(anyhow!("initial pledge pool underflow by {}", amount));
        }
        Ok(())
    }

    pub fn apply_penalty(&mut self, penalty: &TokenAmount) -> anyhow::Result<()> {
        if penalty.is_negative() {
            return Err(anyhow!("negative penalty {}", penalty));
        }
        self.fee_debt += penalty;
        Ok(())
    }

    fn vesting_table<BS: Blockstore>(&self, store: &BS) -> anyhow::Result<VestingFunds> {
        store
            .get_cbor(&self.vesting_funds)
            .context("reading vesting table")?
            .ok_or_else(|| anyhow!("vesting table not found"))
    }

    fn save_vesting_table<BS: Blockstore>(
        &mut self,
        store: &BS,
        table: &VestingFunds,
    ) -> anyhow::Result<()> {
        self.vesting_funds =
            store.put_cbor(table, Code::Blake2b256).context("writing vesting table")?;
        Ok(())
    }

    /// Releases anything already vested, then locks the given sum on the
    /// schedule. Returns the amount released.
    pub fn add_locked_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        spec: &VestSpec,
    ) -> anyhow::Result<TokenAmount> {
        if vesting_sum.is_negative() {
            return Err(anyhow!("cannot lock negative sum {}", vesting_sum));
        }

        let mut table = self.vesting_table(store)?;

        let released = table.unlock_vested_funds(current_epoch);
        self.locked_funds -= &released;
        if self.locked_funds.is_negative() {
            return Err(anyhow!("locked funds underflow while vesting"));
        }

        table.add_locked_funds(current_epoch, vesting_sum, self.proving_period_start, spec);
        self.locked_funds += vesting_sum;

        self.save_vesting_table(store, &table)?;
        Ok(released)
    }

    /// Pays down fee debt, drawing first on unvested funds and then on the
    /// unlocked balance. Whatever cannot be covered remains as debt.
    /// Both repaid portions must be burnt by the caller; only the vesting part
    /// reduces the miner's pledge total.
    pub fn repay_partial_debt_in_priority_order<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        curr_balance: &TokenAmount,
    ) -> anyhow::Result<(TokenAmount, TokenAmount)> {
        let unlocked = self.get_unlocked_balance(curr_balance)?;

        let target = self.fee_debt.clone();
        let from_vesting = self.unlock_unvested_funds(store, current_epoch, &target)?;
        if from_vesting > self.fee_debt {
            return Err(anyhow!("unlocked more vesting funds than the debt required"));
        }
        self.fee_debt -= &from_vesting;

        let from_balance = cmp::min(&unlocked, &self.fee_debt).clone();
        self.fee_debt -= &from_balance;

        Ok((from_vesting, from_balance))
    }

    /// Clears the fee debt entirely or fails; returns the amount to burn.
    pub fn repay_debts(&mut self, curr_balance: &TokenAmount) -> anyhow::Result<TokenAmount> {
        let unlocked = self.get_unlocked_balance(curr_balance)?;
        if unlocked < self.fee_debt {
            return Err(anyhow!(actor_error!(
                insufficient_funds,
                "unlocked balance can not repay fee debt ({} < {})",
                unlocked,
                self.fee_debt
            )));
        }
        Ok(std::mem::take(&mut self.fee_debt))
    }

    /// Forfeits up to `target` from funds that have not yet vested, soonest
    /// entries first. Returns the amount actually taken.
    pub fn unlock_unvested_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        if target.is_zero() || self.locked_funds.is_zero() {
            return Ok(TokenAmount::zero());
        }

        let mut table = self.vesting_table(store)?;
        let taken = table.unlock_unvested_funds(current_epoch, target);
        self.locked_funds -= &taken;
        if self.locked_funds.is_negative() {
            return Err(anyhow!("locked funds underflow while forfeiting"));
        }
        self.save_vesting_table(store, &table)?;
        Ok(taken)
    }

    /// Releases everything vested by now; returns the amount released.
    pub fn unlock_vested_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        let mut table = self.vesting_table(store)?;
        let released = table.unlock_vested_funds(current_epoch);
        self.locked_funds -= &released;
        if self.locked_funds.is_negative() {
            return Err(anyhow!("locked funds underflow while vesting"));
        }
        self.save_vesting_table(store, &table)?;
        Ok(released)
    }

    /// Amount vested by `current_epoch` but not yet released.
    pub fn check_vested_funds<BS: Blockstore>(
        &self,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        Ok(self
            .vesting_table(store)?
            .funds
            .iter()
            .take_while(|fund| fund.epoch < current_epoch)
            .map(|fund| fund.amount.clone())
            .sum())
    }

    /// Balance not reserved by any pool. Errors if the pools exceed the actor
    /// balance, which would mean the balance invariant is already broken.
    pub fn get_unlocked_balance(&self, actor_balance: &TokenAmount) -> anyhow::Result<TokenAmount> {
        let unlocked =
            actor_balance - &self.locked_funds - &self.pre_commit_deposits - &self.initial_pledge;
        if unlocked.is_negative() {
            return Err(anyhow!("reserved pools exceed actor balance by {}", -unlocked));
        }
        Ok(unlocked)
    }

    /// Unlocked balance net of fee debt. May be negative while in debt.
    pub fn get_available_balance(
        &self,
        actor_balance: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        Ok(self.get_unlocked_balance(actor_balance)? - &self.fee_debt)
    }

    /// The standing rule: the balance covers every pool, and no pool or debt
    /// is negative. Checked after each successful message.
    pub fn check_balance_invariants(&self, balance: &TokenAmount) -> anyhow::Result<()> {
        if self.pre_commit_deposits.is_negative() {
            return Err(anyhow!("negative pre-commit deposit pool"));
        }
        if self.locked_funds.is_negative() {
            return Err(anyhow!("negative locked funds"));
        }
        if self.initial_pledge.is_negative() {
            return Err(anyhow!("negative initial pledge pool"));
        }
        if self.fee_debt.is_negative() {
            return Err(anyhow!("negative fee debt"));
        }

        let reserved = &self.pre_commit_deposits + &self.locked_funds + &self.initial_pledge;
        if balance < &reserved {
            return Err(anyhow!("balance {} below reserved pools {}", balance, reserved));
        }
        Ok(())
    }

    //
    // Cron
    //

    /// Closes the recorded deadline: detects missed proofs, retires due
    /// sectors, and steps the recorded position forward (rotating the period
    /// on wrap-around).
    pub fn advance_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<AdvanceDeadlineResult> {
        let dl_info = self.recorded_deadline_info(policy, current_epoch);

        // A brand-new miner sits before its first period; nothing to close yet.
        if !dl_info.period_started() {
            return Ok(AdvanceDeadlineResult::empty());
        }

        self.current_deadline = (dl_info.index + 1) % policy.wpost_period_deadlines;
        if self.current_deadline == 0 {
            self.proving_period_start = dl_info.period_start + policy.wpost_proving_period;
        }

        let mut deadlines = self.load_deadlines(store)?;
        let mut deadline = deadlines.load_deadline(policy, store, dl_info.index)?;

        // Power faulty before this close pays the continued-fault fee; faults
        // detected *by* this close don't (the first miss is fee-free).
        let previously_faulty_power = deadline.faulty_power.clone();

        if deadline.is_empty() {
            return Ok(AdvanceDeadlineResult {
                previously_faulty_power,
                ..AdvanceDeadlineResult::empty()
            });
        }

        let quant = quant_spec_for_deadline(policy, &dl_info);
        let fault_horizon = dl_info.last() + policy.fault_max_age;

        let (mut power_delta, _penalized) = deadline
            .process_deadline_end(store, quant, fault_horizon, self.sectors)
            .with_context(|| format!("closing deadline {}", dl_info.index))?;
        let detected_faulty_power = _penalized;
        let total_faulty_power = deadline.faulty_power.clone();

        // Retire whatever is due by the close. On-time leavers release their
        // pledge; early leavers keep it reserved against the termination fee,
        // and their deadline is flagged for fee processing.
        let retired = deadline
            .pop_expired_sectors(store, dl_info.last(), quant)
            .context("retiring expired sectors")?;

        self.add_initial_pledge(&-retired.on_time_pledge.clone())?;
        let pledge_delta = -retired.on_time_pledge.clone();
        // Faulty power already left the totals when it faulted.
        power_delta -= &retired.active_power;

        if !retired.early_sectors.is_empty() {
            self.early_terminations.set(dl_info.index);
        }

        deadlines.update_deadline(policy, store, dl_info.index, &deadline)?;
        self.save_deadlines(store, deadlines)?;

        Ok(AdvanceDeadlineResult {
            pledge_delta,
            power_delta,
            previously_faulty_power,
            detected_faulty_power,
            total_faulty_power,
        })
    }

    /// Whether the per-deadline cron still has anything to do: live sectors,
    /// reserved funds, outstanding debt or pending terminations.
    pub fn continue_deadline_cron<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
    ) -> anyhow::Result<bool> {
        if !self.pre_commit_deposits.is_zero()
            || !self.initial_pledge.is_zero()
            || !self.locked_funds.is_zero()
            || !self.fee_debt.is_zero()
            || !self.early_terminations.is_empty()
        {
            return Ok(true);
        }

        let mut occupied = false;
        self.load_deadlines(store)?.for_each(policy, store, |_, deadline| {
            occupied = occupied || !deadline.is_empty();
            Ok(())
        })?;
        Ok(occupied)
    }
}

pub struct AdvanceDeadlineResult {
    pub pledge_delta: TokenAmount,
    pub power_delta: PowerPair,
    /// Power that was already faulty when the deadline closed; the base for
    /// the continued-fault fee.
    pub previously_faulty_power: PowerPair,
    /// Power turned faulty by the close (missed or skipped proofs), including
    /// failed recoveries.
    pub detected_faulty_power: PowerPair,
    /// The deadline's faulty power after detection, before retirements.
    pub total_faulty_power: PowerPair,
}

impl AdvanceDeadlineResult {
    fn empty() -> Self {
        AdvanceDeadlineResult {
            pledge_delta: TokenAmount::zero(),
            power_delta: PowerPair::zero(),
            previously_faulty_power: PowerPair::zero(),
            detected_faulty_power: PowerPair::zero(),
            total_faulty_power: PowerPair::zero(),
        }
    }
}

/// The miner's static configuration.
#[derive(Debug, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct MinerInfo {
    /// Receives withdrawn funds and returned collateral, and is the only party
    /// allowed to rotate the worker key or propose a new owner.
    pub owner: Address,

    /// Signs blocks and day-to-day operational messages (commitments, proofs).
    /// Must be backed by a BLS account key.
    pub worker: Address,

    /// Additional addresses allowed to operate the miner (ID addresses).
    pub control_addresses: Vec<Address>,

    /// A requested worker rotation waiting for its effective epoch.
    pub pending_worker_key: Option<WorkerKeyChange>,

    /// Libp2p peer identity for reaching this miner.
    #[serde(with = "serde_bytes")]
    pub peer_id: Vec<u8>,

    /// Multiaddrs at which this miner can be reached.
    pub multi_address: Vec<BytesDe>,

    /// The Window PoSt proof flavor this miner commits sectors under.
    pub window_post_proof_type: RegisteredPoStProof,

    /// Sector size implied by the proof type, kept denormalized.
    pub sector_size: SectorSize,

    /// Sectors per Window PoSt partition, implied by the proof type.
    pub window_post_partition_sectors: u64,

    /// Epoch through which the most recent reported consensus fault bars this
    /// miner from pre-commits, recoveries and elections.
    pub consensus_fault_elapsed: ChainEpoch,

    /// An owner handover awaiting confirmation from the named address.
    pub pending_owner_address: Option<Address>,
}

impl Cbor for MinerInfo {}

impl MinerInfo {
    pub fn new(
        owner: Address,
        worker: Address,
        control_addresses: Vec<Address>,
        peer_id: Vec<u8>,
        multi_address: Vec<BytesDe>,
        window_post_proof_type: RegisteredPoStProof,
    ) -> Result<Self, ActorError> {
        let sector_size = window_post_proof_type
            .sector_size()
            .map_err(|e| actor_error!(illegal_argument, "unknown sector size: {}", e))?;
        let window_post_partition_sectors = window_post_proof_type
            .window_post_partitions_sector()
            .map_err(|e| actor_error!(illegal_argument, "unknown partition size: {}", e))?;

        Ok(Self {
            owner,
            worker,
            control_addresses,
            pending_worker_key: None,
            peer_id,
            multi_address,
            window_post_proof_type,
            sector_size,
            window_post_partition_sectors,
            consensus_fault_elapsed: EPOCH_UNDEFINED,
            pending_owner_address: None,
        })
    }
}
