// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops;

use anyhow::{anyhow, Context};
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::bigint::bigint_ser;
use fvm_shared::clock::{ChainEpoch, QuantSpec, NO_QUANTIZATION};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorSize, StoragePower};
use num_traits::Zero;
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::Array;

use super::{
    power_for_sectors, select_sectors, EpochQueue, ExpirationQueue, ExpirationSet,
    SectorOnChainInfo, Sectors, TerminationResult,
};

/// A bounded batch of sectors challenged together within a deadline.
///
/// Sector membership here is layered: `terminated ⊆ sectors`, `faults` and
/// `unproven` partition the live remainder together with the active set, and
/// `recoveries ⊆ faults`. The power memos mirror those layers so that deadline
/// and global totals can be maintained without re-walking sector infos.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq, Default)]
pub struct Partition {
    /// Every sector number ever assigned here, dead or alive.
    pub sectors: BitField,
    /// Sectors committed but not yet covered by a Window PoSt. Cleared by the
    /// first proof, or converted to faults when the deadline closes unproven.
    pub unproven: BitField,
    /// Live sectors currently faulty. Disjoint from `terminated`.
    pub faults: BitField,
    /// Faulty sectors the miner has promised to prove again. Subset of `faults`.
    pub recoveries: BitField,
    /// Sectors no longer counted for anything, awaiting compaction.
    pub terminated: BitField,
    /// Expiration schedule for the partition's sectors (AMT[Epoch]ExpirationSet),
    /// quantized to the deadline's proving grid.
    pub expirations_epochs: Cid,
    /// Sectors terminated ahead of their commitment, keyed by the epoch of
    /// termination (AMT[Epoch]BitField). Fees for these have not been assessed
    /// yet; power has already been surrendered.
    pub early_terminated: Cid,
    /// Power of all live sectors, including faulty and unproven ones.
    pub live_power: PowerPair,
    /// Power of unproven sectors; not yet part of any network total.
    pub unproven_power: PowerPair,
    /// Power of faulty sectors. Bounded by `live_power`.
    pub faulty_power: PowerPair,
    /// Power expected back if every declared recovery proves. Bounded by `faulty_power`.
    pub recovering_power: PowerPair,
}

impl Partition {
    pub fn new<BS: Blockstore>(store: &BS) -> anyhow::Result<Self> {
        let no_expirations = Array::<ExpirationSet, BS>::new(store)
            .flush()
            .context("building empty expiration schedule")?;
        let no_early = Array::<BitField, BS>::new(store)
            .flush()
            .context("building empty early-termination queue")?;

        Ok(Self {
            sectors: BitField::new(),
            unproven: BitField::new(),
            faults: BitField::new(),
            recoveries: BitField::new(),
            terminated: BitField::new(),
            expirations_epochs: no_expirations,
            early_terminated: no_early,
            live_power: PowerPair::zero(),
            unproven_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
            recovering_power: PowerPair::zero(),
        })
    }

    /// Everything not yet terminated.
    pub fn live_sectors(&self) -> BitField {
        &self.sectors - &self.terminated
    }

    /// Live, healthy and proven: the sectors actually backing network power.
    pub fn active_sectors(&self) -> BitField {
        &(&self.live_sectors() - &self.faults) - &self.unproven
    }

    pub fn active_power(&self) -> PowerPair {
        &(&self.live_power - &self.faulty_power) - &self.unproven_power
    }

    /// Takes in brand-new sectors, scheduling each at its committed expiration.
    /// Until `proven`, their power is parked in the unproven memo rather than
    /// contributed to the network. Returns the power taken in.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        proven: bool,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        let mut schedule = self.expiration_queue(store, quant)?;
        let (incoming, power, _pledge) = schedule
            .add_active_sectors(sectors, sector_size)
            .context("scheduling incoming sectors")?;
        self.expirations_epochs = schedule.entries.flush()?;

        if self.sectors.contains_any(&incoming) {
            return Err(anyhow!("incoming sectors clash with existing assignments"));
        }

        self.sectors |= &incoming;
        self.live_power += &power;
        if !proven {
            self.unproven |= &incoming;
            self.unproven_power += &power;
        }

        self.check_invariants()?;
        Ok(power)
    }

    /// Applies a fault declaration. Terminated and already-faulty sectors in
    /// the declaration are ignored; declared recoveries named again are
    /// retracted back to plain faults.
    ///
    /// Returns the set of genuinely new faults, the resulting change to
    /// network power (negative, excluding never-activated unproven power), and
    /// the power newly accounted faulty.
    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        declared: &BitField,
        fault_expiration: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<(BitField, PowerPair, PowerPair)> {
        if !self.sectors.contains_all(declared) {
            return Err(anyhow!("fault declaration names sectors outside the partition"));
        }

        // A named recovery reverts to a plain fault; everything else that is
        // live and healthy becomes newly faulty.
        let retracted = &self.recoveries & declared;
        let new_faults = &(&(declared - &retracted) - &self.terminated) - &self.faults;

        let new_fault_infos =
            sectors.load_sector(&new_faults).map_err(|e| anyhow!("reading fault infos: {}", e))?;

        let (power_delta, new_faulty_power) = if new_fault_infos.is_empty() {
            (PowerPair::zero(), PowerPair::zero())
        } else {
            self.mark_faulty(
                store,
                &new_faults,
                &new_fault_infos,
                fault_expiration,
                sector_size,
                quant,
            )?
        };

        if !retracted.is_empty() {
            let retracted_infos = sectors
                .load_sector(&retracted)
                .map_err(|e| anyhow!("reading retracted recovery infos: {}", e))?;
            self.remove_recoveries(&retracted, &power_for_sectors(sector_size, &retracted_infos));
        }

        self.check_invariants()?;
        Ok((new_faults, power_delta, new_faulty_power))
    }

    /// Like `record_faults`, but for sectors skipped inside a PoSt submission.
    /// Also reports the power of retracted recoveries (it is penalized at the
    /// deadline close) and whether any genuinely new fault appeared.
    pub fn record_skipped_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        skipped: &BitField,
    ) -> anyhow::Result<(PowerPair, PowerPair, PowerPair, bool)> {
        if skipped.is_empty() {
            return Ok((PowerPair::zero(), PowerPair::zero(), PowerPair::zero(), false));
        }
        if !self.sectors.contains_all(skipped) {
            return Err(anyhow!("skipped sectors are not all in the partition"));
        }

        let retracted = &self.recoveries & skipped;
        let retracted_power = {
            let infos = sectors
                .load_sector(&retracted)
                .map_err(|e| anyhow!("reading retracted recovery infos: {}", e))?;
            power_for_sectors(sector_size, &infos)
        };

        let new_faults = &(skipped - &self.terminated) - &self.faults;
        let new_fault_infos =
            sectors.load_sector(&new_faults).map_err(|e| anyhow!("reading fault infos: {}", e))?;

        let (power_delta, new_faulty_power) = self.mark_faulty(
            store,
            &new_faults,
            &new_fault_infos,
            fault_expiration,
            sector_size,
            quant,
        )?;

        self.remove_recoveries(&retracted, &retracted_power);
        self.check_invariants()?;

        Ok((power_delta, new_faulty_power, retracted_power, !new_fault_infos.is_empty()))
    }

    /// Confirms every pending recovery, restoring power and returning the
    /// sectors to their committed expirations. Invoked when a proof covering
    /// the partition lands.
    pub fn recover_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        let recovering = sectors
            .load_sector(&self.recoveries)
            .map_err(|e| anyhow!("reading recovery infos: {}", e))?;

        let mut schedule = self.expiration_queue(store, quant)?;
        let restored = schedule
            .reschedule_recovered(recovering, sector_size)
            .context("restoring recovered sectors in schedule")?;
        self.expirations_epochs = schedule.entries.flush()?;

        self.faults -= &self.recoveries;
        self.recoveries = BitField::new();
        self.faulty_power -= &restored;
        self.recovering_power -= &restored;

        self.check_invariants()?;
        Ok(restored)
    }

    /// The first proof over the partition turns parked unproven power live.
    pub fn activate_unproven(&mut self) -> PowerPair {
        self.unproven = BitField::new();
        std::mem::take(&mut self.unproven_power)
    }

    /// Notes a recovery declaration. Only currently-faulty, not-yet-declared
    /// sectors count; power is not restored until a proof confirms them.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        declared: &BitField,
    ) -> anyhow::Result<()> {
        if !self.sectors.contains_all(declared) {
            return Err(anyhow!("recovery declaration names sectors outside the partition"));
        }

        let new_recoveries = &(declared & &self.faults) - &self.recoveries;
        let infos = sectors
            .load_sector(&new_recoveries)
            .map_err(|e| anyhow!("reading recovery infos: {}", e))?;

        self.recoveries |= &new_recoveries;
        self.recovering_power += &power_for_sectors(sector_size, &infos);

        self.check_invariants()
    }

    /// Withdraws sectors from the recovery set, e.g. when they are re-declared
    /// faulty or skipped before proving.
    pub fn remove_recoveries(&mut self, declared: &BitField, power: &PowerPair) {
        if declared.is_empty() {
            return;
        }
        self.recoveries -= declared;
        self.recovering_power -= power;
    }

    /// Swaps old active sectors for replacements, carrying the schedule, the
    /// membership set and the live power along. The old sectors must be active.
    /// Returns the (new minus old) power and pledge deltas.
    pub fn replace_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        old_sectors: &[SectorOnChainInfo],
        new_sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<(PowerPair, TokenAmount)> {
        let mut schedule = self.expiration_queue(store, quant)?;
        let (old_numbers, new_numbers, power_delta, pledge_delta) = schedule
            .replace_sectors(old_sectors, new_sectors, sector_size)
            .context("swapping sectors in schedule")?;
        self.expirations_epochs = schedule.entries.flush()?;

        if !self.active_sectors().contains_all(&old_numbers) {
            return Err(anyhow!("refusing to replace sectors that are not active"));
        }

        self.sectors -= &old_numbers;
        self.sectors |= &new_numbers;
        self.live_power += &power_delta;

        self.check_invariants()?;
        Ok((power_delta, pledge_delta))
    }

    /// Terminates live sectors right now. They are pulled out of the schedule,
    /// logged in the early-termination queue for later fee assessment, and all
    /// the membership sets and power memos are settled.
    /// Returns the removed aggregate; its `active_power` is the partition's
    /// loss of live network power (unproven power is excluded, it was never
    /// counted).
    pub fn terminate_sectors<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        epoch: ChainEpoch,
        sector_numbers: &BitField,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<ExpirationSet> {
        if !self.live_sectors().contains_all(sector_numbers) {
            return Err(anyhow!("only live sectors can be terminated"));
        }

        let infos = sectors.load_sector(sector_numbers)?;
        let mut schedule = self.expiration_queue(store, quant)?;
        let (mut removed, removed_recovering) = schedule
            .remove_sectors(policy, &infos, &self.faults, &self.recoveries, sector_size)
            .context("unscheduling terminated sectors")?;
        self.expirations_epochs = schedule.entries.flush()?;

        let gone = &removed.on_time_sectors | &removed.early_sectors;
        self.queue_early_termination(store, epoch, &gone)?;

        self.terminated |= &gone;
        self.faults -= &gone;
        self.recoveries -= &gone;
        self.live_power -= &(&removed.active_power + &removed.faulty_power);
        self.faulty_power -= &removed.faulty_power;
        self.recovering_power -= &removed_recovering;

        // Unproven members never contributed power; keep them out of the
        // reported active loss.
        let gone_unproven = &gone & &self.unproven;
        self.unproven -= &gone_unproven;
        if !gone_unproven.is_empty() {
            let unproven_infos = select_sectors(&infos, &gone_unproven)?;
            let unactivated = power_for_sectors(sector_size, &unproven_infos);
            self.unproven_power -= &unactivated;
            removed.active_power -= &unactivated;
        }

        self.check_invariants()?;
        Ok(removed)
    }

    /// Retires everything scheduled through `until`: on-time sectors expire,
    /// early ones are logged for termination fees. Must not run while proofs
    /// are pending (unproven sectors) and expects recoveries to have been
    /// settled at the deadline close beforehand.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<ExpirationSet> {
        if !self.unproven.is_empty() {
            return Err(anyhow!("expirations processed while proofs are outstanding"));
        }
        if !self.recoveries.is_empty() || !self.recovering_power.is_zero() {
            return Err(anyhow!("expirations processed with recoveries still pending"));
        }

        let mut schedule = self.expiration_queue(store, quant)?;
        let due = schedule
            .collect_due(until)
            .with_context(|| format!("collecting expirations through {}", until))?;
        self.expirations_epochs = schedule.entries.flush()?;

        let leaving = &due.on_time_sectors | &due.early_sectors;
        if self.terminated.contains_any(&leaving) {
            return Err(anyhow!("sectors expiring now were already terminated"));
        }

        self.terminated |= &leaving;
        self.faults -= &leaving;
        self.live_power -= &(&due.active_power + &due.faulty_power);
        self.faulty_power -= &due.faulty_power;

        // Early leavers owe a termination fee; on-time leavers don't.
        self.queue_early_termination(store, until, &due.early_sectors)?;

        self.check_invariants()?;
        Ok(due)
    }

    /// Handles a wholly missed PoSt: every live sector is now faulty and the
    /// schedule is collapsed onto the fault horizon.
    ///
    /// Returns the change to network power (negative, minus parked unproven
    /// power), the power subject to penalty (new faults plus failed
    /// recoveries), and the power newly turned faulty.
    pub fn record_missed_post<BS: Blockstore>(
        &mut self,
        store: &BS,
        fault_expiration: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<(PowerPair, PowerPair, PowerPair)> {
        let mut schedule = self.expiration_queue(store, quant)?;
        schedule
            .reschedule_all_as_faults(fault_expiration)
            .context("collapsing schedule onto fault horizon")?;
        self.expirations_epochs = schedule.entries.flush()?;

        let newly_faulty = &self.live_power - &self.faulty_power;
        let penalized = &self.recovering_power + &newly_faulty;
        let power_delta = &self.unproven_power - &newly_faulty;

        self.faults = self.live_sectors();
        self.recoveries = BitField::new();
        self.unproven = BitField::new();
        self.faulty_power = self.live_power.clone();
        self.recovering_power = PowerPair::zero();
        self.unproven_power = PowerPair::zero();

        self.check_invariants()?;
        Ok((power_delta, penalized, newly_faulty))
    }

    /// Hands out up to `max_sectors` sectors from the early-termination queue,
    /// grouped by termination epoch. Partially-consumed queue entries are
    /// written back. The boolean reports whether entries remain.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        store: &BS,
        max_sectors: u64,
    ) -> anyhow::Result<(TerminationResult, bool)> {
        let mut early = self.early_queue(store)?;

        let mut result = TerminationResult::new();
        result.partitions_processed = 1;

        let mut consumed = Vec::<u64>::new();
        let mut leftover: Option<(ChainEpoch, BitField)> = None;

        early.entries.for_each_while(|raw_epoch, queued| {
            let epoch: ChainEpoch = raw_epoch.try_into()?;
            let budget = max_sectors - result.sectors_processed;

            let taken = if queued.len() > budget {
                // Split the entry: take the lowest sector numbers, keep the rest.
                let taken = queued.slice(0, budget).context("splitting termination entry")?;
                leftover = Some((epoch, queued - &taken));
                result.sectors_processed += budget;
                taken
            } else {
                consumed.push(raw_epoch);
                result.sectors_processed += queued.len();
                queued.clone()
            };

            result.record(epoch, taken);
            Ok(result.sectors_processed < max_sectors)
        })?;

        early.entries.batch_delete(consumed, true).context("consuming termination entries")?;
        if let Some((epoch, rest)) = leftover {
            early.entries.set(epoch as u64, rest).context("writing back split entry")?;
        }
        self.early_terminated = early.entries.flush()?;

        let more = early.entries.count() > 0;
        Ok((result, more))
    }

    /// The partition's standing rules; checked after every mutation.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        if !self.sectors.contains_all(&self.terminated) {
            return Err(anyhow!("terminated sectors not a subset of all sectors"));
        }

        let live = self.live_sectors();
        if !live.contains_all(&self.faults) {
            return Err(anyhow!("faults include dead sectors"));
        }
        if !live.contains_all(&self.unproven) {
            return Err(anyhow!("unproven set includes dead sectors"));
        }
        if !self.faults.contains_all(&self.recoveries) {
            return Err(anyhow!("recoveries not a subset of faults"));
        }
        if self.faults.contains_any(&self.unproven) {
            return Err(anyhow!("faults and unproven set overlap"));
        }

        let active = self.active_sectors();
        if active.contains_any(&self.terminated) {
            return Err(anyhow!("active sectors overlap terminated"));
        }
        if active.contains_any(&self.faults) {
            return Err(anyhow!("active sectors overlap faults"));
        }

        Ok(())
    }

    //
    // -- internals --
    //

    fn expiration_queue<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
        quant: QuantSpec,
    ) -> anyhow::Result<ExpirationQueue<'db, BS>> {
        ExpirationQueue::load(store, &self.expirations_epochs, quant)
            .context("opening expiration schedule")
    }

    fn early_queue<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<EpochQueue<'db, BS>> {
        EpochQueue::load(store, &self.early_terminated, NO_QUANTIZATION)
            .context("opening early-termination queue")
    }

    /// Moves healthy sectors into the fault column: reschedules them at the
    /// fault horizon, flips the membership sets and settles the power memos.
    fn mark_faulty<BS: Blockstore>(
        &mut self,
        store: &BS,
        new_faults: &BitField,
        infos: &[SectorOnChainInfo],
        fault_expiration: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<(PowerPair, PowerPair)> {
        let mut schedule = self.expiration_queue(store, quant)?;
        let new_faulty_power = schedule
            .reschedule_as_faults(fault_expiration, infos, sector_size)
            .context("pulling faults forward in schedule")?;
        self.expirations_epochs = schedule.entries.flush()?;

        self.faults |= new_faults;
        self.faulty_power += &new_faulty_power;

        // A sector faulted before its first proof never contributed power, so
        // the network-facing delta omits it.
        let faulted_unproven = new_faults & &self.unproven;
        self.unproven -= &faulted_unproven;
        let mut power_delta = -new_faulty_power.clone();
        if !faulted_unproven.is_empty() {
            let unproven_infos = select_sectors(infos, &faulted_unproven)?;
            let unactivated = power_for_sectors(sector_size, &unproven_infos);
            self.unproven_power -= &unactivated;
            power_delta += &unactivated;
        }

        Ok((power_delta, new_faulty_power))
    }

    /// Appends sectors to the early-termination queue at the given epoch.
    fn queue_early_termination<BS: Blockstore>(
        &mut self,
        store: &BS,
        epoch: ChainEpoch,
        sectors: &BitField,
    ) -> anyhow::Result<()> {
        let mut early = self.early_queue(store)?;
        early.enqueue(epoch, sectors).context("queueing early terminations")?;
        self.early_terminated = early.entries.flush()?;
        Ok(())
    }
}

/// Raw-bytes and quality-adjusted power, always moved in lockstep.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, PartialEq, Eq, Default)]
pub struct PowerPair {
    #[serde(with = "bigint_ser")]
    pub raw: StoragePower,
    #[serde(with = "bigint_ser")]
    pub qa: StoragePower,
}

impl PowerPair {
    pub fn new(raw: StoragePower, qa: StoragePower) -> Self {
        Self { raw, qa }
    }

    pub fn zero() -> Self {
        Default::default()
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero() && self.qa.is_zero()
    }
}

impl ops::Add for &PowerPair {
    type Output = PowerPair;

    fn add(self, other: Self) -> PowerPair {
        PowerPair::new(&self.raw + &other.raw, &self.qa + &other.qa)
    }
}

impl ops::Add for PowerPair {
    type Output = PowerPair;

    fn add(self, other: Self) -> PowerPair {
        &self + &other
    }
}

impl ops::AddAssign<&Self> for PowerPair {
    fn add_assign(&mut self, other: &Self) {
        self.raw += &other.raw;
        self.qa += &other.qa;
    }
}

impl ops::Sub for &PowerPair {
    type Output = PowerPair;

    fn sub(self, other: Self) -> PowerPair {
        PowerPair::new(&self.raw - &other.raw, &self.qa - &other.qa)
    }
}

impl ops::Sub for PowerPair {
    type Output = PowerPair;

    fn sub(self, other: Self) -> PowerPair {
        &self - &other
    }
}

impl ops::SubAssign<&Self> for PowerPair {
    fn sub_assign(&mut self, other: &Self) {
        self.raw -= &other.raw;
        self.qa -= &other.qa;
    }
}

impl ops::Neg for PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        PowerPair::new(-self.raw, -self.qa)
    }
}

impl ops::Neg for &PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        -self.clone()
    }
}
