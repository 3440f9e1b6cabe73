// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::convert::TryInto;

use anyhow::{anyhow, Context};
use cid::Cid;
use fvm_ipld_amt::{Error as AmtError, ValueMut};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorSize;
use num_traits::{Signed, Zero};
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::Array;

use super::{power_for_sector, PowerPair, SectorOnChainInfo};

/// Cap on how many sectors a single queue bucket may be asked to enumerate.
/// Must accommodate at least a full partition.
const SECTORS_PER_BUCKET_MAX: u64 = 10_000;

/// One bucket of the expiration queue: the sectors leaving the partition at a
/// given (quantized) epoch, split by the reason they leave.
///
/// "On-time" sectors reach their committed expiration; their pledge is held
/// here so it can be released when the bucket is processed. "Early" sectors are
/// being pushed out by a long-lived fault; they are always faulty and their
/// pledge stays out of the bucket, reserved for the termination fee instead.
/// A faulty sector may still sit in the on-time set if the fault horizon lands
/// beyond its committed expiration.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, Default)]
pub struct ExpirationSet {
    /// Sectors reaching their committed expiration.
    pub on_time_sectors: BitField,
    /// Sectors being expired ahead of commitment because of fault age.
    pub early_sectors: BitField,
    /// Pledge held for the on-time sectors.
    pub on_time_pledge: TokenAmount,
    /// Non-faulty power leaving at this bucket.
    pub active_power: PowerPair,
    /// Faulty power leaving at this bucket.
    pub faulty_power: PowerPair,
}

impl ExpirationSet {
    pub fn empty() -> Self {
        Default::default()
    }

    /// Merges sectors and their accounting into the bucket.
    pub fn add(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        self.on_time_sectors |= on_time_sectors;
        self.early_sectors |= early_sectors;
        self.on_time_pledge += on_time_pledge;
        self.active_power += active_power;
        self.faulty_power += faulty_power;

        self.ensure_consistent()
    }

    /// Subtracts sectors and their accounting from the bucket.
    /// The sectors must already be present in the respective sets.
    pub fn remove(
        &mut self,
        on_time_sectors: &BitField,
        early_sectors: &BitField,
        on_time_pledge: &TokenAmount,
        active_power: &PowerPair,
        faulty_power: &PowerPair,
    ) -> anyhow::Result<()> {
        if !self.on_time_sectors.contains_all(on_time_sectors) {
            return Err(anyhow!(
                "on-time sectors {:?} not all present in bucket {:?}",
                on_time_sectors,
                self.on_time_sectors
            ));
        }
        if !self.early_sectors.contains_all(early_sectors) {
            return Err(anyhow!(
                "early sectors {:?} not all present in bucket {:?}",
                early_sectors,
                self.early_sectors
            ));
        }

        self.on_time_sectors -= on_time_sectors;
        self.early_sectors -= early_sectors;
        self.on_time_pledge -= on_time_pledge;
        self.active_power -= active_power;
        self.faulty_power -= faulty_power;

        self.ensure_consistent()
    }

    /// Empty means no sectors; any power or pledge left behind would be a bug.
    pub fn is_empty(&self) -> bool {
        self.on_time_sectors.is_empty() && self.early_sectors.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.on_time_sectors.len() + self.early_sectors.len()
    }

    /// Pledge and both power totals may never go negative.
    pub fn ensure_consistent(&self) -> anyhow::Result<()> {
        if self.on_time_pledge.is_negative() {
            return Err(anyhow!("expiration bucket pledge underflow"));
        }
        if self.active_power.raw.is_negative() || self.active_power.qa.is_negative() {
            return Err(anyhow!("expiration bucket active power underflow"));
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!("expiration bucket faulty power underflow"));
        }
        Ok(())
    }
}

/// Running totals for a group of sectors handled together.
#[derive(Default)]
struct Totals {
    sectors: Vec<u64>,
    power: PowerPair,
    pledge: TokenAmount,
}

impl Totals {
    fn note(&mut self, sector_size: SectorSize, sector: &SectorOnChainInfo) {
        self.sectors.push(sector.sector_number);
        self.power += &power_for_sector(sector_size, sector);
        self.pledge += &sector.initial_pledge;
    }

    fn bitfield(&self) -> anyhow::Result<BitField> {
        Ok(BitField::try_from_bits(self.sectors.iter().copied())?)
    }
}

/// The per-partition expiration schedule: an AMT[ChainEpoch]ExpirationSet with
/// keys rounded up onto the deadline's quantization grid.
pub struct ExpirationQueue<'db, BS> {
    pub entries: Array<'db, ExpirationSet, BS>,
    pub quant: QuantSpec,
}

impl<'db, BS: Blockstore> ExpirationQueue<'db, BS> {
    /// Opens the queue at a root. All epochs passed to the methods below are
    /// raw; they are quantized on the way in.
    pub fn load(store: &'db BS, root: &Cid, quant: QuantSpec) -> Result<Self, AmtError> {
        Ok(Self { entries: Array::load(root, store)?, quant })
    }

    /// Schedules non-faulty sectors at their committed expirations.
    /// Returns the scheduled sector numbers with their total power and pledge.
    pub fn add_active_sectors<'a>(
        &mut self,
        sectors: impl IntoIterator<Item = &'a SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut all_sectors = BitField::new();
        let mut all_power = PowerPair::zero();
        let mut all_pledge = TokenAmount::zero();

        for (epoch, batch) in self.bucket_by_declared(sectors, sector_size) {
            let numbers = batch.bitfield()?;
            self.update_bucket(epoch, |bucket| {
                bucket.add(
                    &numbers,
                    &BitField::new(),
                    &batch.pledge,
                    &batch.power,
                    &PowerPair::zero(),
                )
            })
            .with_context(|| format!("scheduling sectors at epoch {}", epoch))?;

            all_sectors |= &numbers;
            all_power += &batch.power;
            all_pledge += &batch.pledge;
        }

        Ok((all_sectors, all_power, all_pledge))
    }

    /// Turns currently-active sectors faulty, pulling them forward to the fault
    /// horizon unless they already expire sooner.
    ///
    /// Sectors already due at or before the (quantized) horizon stay where they
    /// are with their power re-labelled faulty; their pledge remains on-time.
    /// The rest move to the horizon as early expirations, taking their pledge
    /// out of the queue. Returns the total power now accounted faulty.
    pub fn reschedule_as_faults(
        &mut self,
        new_expiration: ChainEpoch,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let horizon = self.quant.quantize_up(new_expiration);
        let mut now_faulty = PowerPair::zero();
        let mut pulled = Totals::default();

        for (epoch, batch) in self.locate_on_time(sectors, sector_size)? {
            if epoch <= horizon {
                // Stays in place; only the power classification changes.
                self.update_bucket(epoch, |bucket| {
                    bucket.active_power -= &batch.power;
                    bucket.faulty_power += &batch.power;
                    bucket.ensure_consistent()
                })?;
                now_faulty += &batch.power;
            } else {
                let numbers = batch.bitfield()?;
                self.update_bucket(epoch, |bucket| {
                    bucket.remove(
                        &numbers,
                        &BitField::new(),
                        &batch.pledge,
                        &batch.power,
                        &PowerPair::zero(),
                    )
                })
                .with_context(|| format!("unscheduling faulty sectors at epoch {}", epoch))?;

                now_faulty += &batch.power;
                pulled.sectors.extend(&batch.sectors);
                pulled.power += &batch.power;
            }
        }

        if !pulled.sectors.is_empty() {
            let numbers = pulled.bitfield()?;
            self.update_bucket(horizon, |bucket| {
                bucket.add(
                    &BitField::new(),
                    &numbers,
                    &TokenAmount::zero(),
                    &PowerPair::zero(),
                    &pulled.power,
                )
            })
            .context("scheduling early expirations at fault horizon")?;
        }

        Ok(now_faulty)
    }

    /// Marks every scheduled sector faulty, collapsing buckets beyond the fault
    /// horizon into a single early-expiration bucket at the horizon.
    pub fn reschedule_all_as_faults(&mut self, fault_expiration: ChainEpoch) -> anyhow::Result<()> {
        let horizon = self.quant.quantize_up(fault_expiration);

        let mut relabelled = Vec::<(ChainEpoch, ExpirationSet)>::new();
        let mut collapsed_epochs = Vec::<u64>::new();
        let mut collapsed_sectors = BitField::new();
        let mut collapsed_power = PowerPair::zero();

        self.entries.for_each(|raw_epoch, bucket| {
            let epoch: ChainEpoch = raw_epoch.try_into()?;

            if epoch <= horizon {
                // Keep the bucket, but everything in it is now faulty power.
                let mut bucket = bucket.clone();
                let newly_faulty = std::mem::take(&mut bucket.active_power);
                bucket.faulty_power += &newly_faulty;
                relabelled.push((epoch, bucket));
            } else {
                // Anything beyond the horizon must still be on-time: early
                // sectors cannot be scheduled later than their fault horizon.
                if !bucket.early_sectors.is_empty() {
                    return Err(anyhow!("early expirations found beyond the fault horizon"));
                }
                collapsed_epochs.push(raw_epoch);
                collapsed_sectors |= &bucket.on_time_sectors;
                collapsed_power += &bucket.active_power;
                collapsed_power += &bucket.faulty_power;
            }

            Ok(())
        })?;

        for (epoch, bucket) in relabelled {
            bucket.ensure_consistent()?;
            self.write_bucket(epoch, bucket)?;
        }

        if collapsed_epochs.is_empty() {
            return Ok(());
        }

        self.entries
            .batch_delete(collapsed_epochs, true)
            .context("collapsing buckets beyond fault horizon")?;

        self.update_bucket(horizon, |bucket| {
            bucket.add(
                &BitField::new(),
                &collapsed_sectors,
                &TokenAmount::zero(),
                &PowerPair::zero(),
                &collapsed_power,
            )
        })
        .context("scheduling collapsed sectors at fault horizon")
    }

    /// Restores recovered sectors: their power becomes active again and any
    /// early entry is moved back to the committed expiration, with pledge
    /// re-entering the queue. Fails if a sector cannot be found.
    pub fn reschedule_recovered(
        &mut self,
        sectors: Vec<SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut outstanding: BTreeMap<u64, &SectorOnChainInfo> =
            sectors.iter().map(|s| (s.sector_number, s)).collect();

        let mut recovered = PowerPair::zero();
        let mut to_restore = Vec::<&SectorOnChainInfo>::new();

        // One pass over the queue. Faults cluster near the front (the fault
        // horizon is bounded), so this exits early in practice.
        self.walk_mut(|_, bucket| {
            let mut to_activate = PowerPair::zero();
            let mut early_leavers = Vec::<u64>::new();

            for number in bucket.on_time_sectors.iter() {
                if let Some(sector) = outstanding.remove(&number) {
                    // On-time entry: flip its power back to active where it sits.
                    let power = power_for_sector(sector_size, sector);
                    to_activate += &power;
                    recovered += &power;
                }
            }
            for number in bucket.early_sectors.iter() {
                if let Some(sector) = outstanding.remove(&number) {
                    // Early entry: pull it out entirely for re-scheduling.
                    let power = power_for_sector(sector_size, sector);
                    bucket.faulty_power -= &power;
                    recovered += &power;
                    early_leavers.push(number);
                    to_restore.push(sector);
                }
            }

            if !to_activate.is_zero() || !early_leavers.is_empty() {
                bucket.active_power += &to_activate;
                bucket.faulty_power -= &to_activate;
                bucket.early_sectors -= BitField::try_from_bits(early_leavers)?;
            }
            bucket.ensure_consistent()?;

            Ok(!outstanding.is_empty())
        })?;

        if !outstanding.is_empty() {
            return Err(anyhow!(
                "{} recovered sectors missing from expiration queue",
                outstanding.len()
            ));
        }

        self.add_active_sectors(to_restore, sector_size)?;
        Ok(recovered)
    }

    /// Swaps one set of active sectors for another, e.g. on extension or
    /// replica update. Neither set may be faulty.
    /// Returns the old and new sector numbers plus the power and pledge deltas
    /// (new minus old).
    pub fn replace_sectors(
        &mut self,
        old_sectors: &[SectorOnChainInfo],
        new_sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, BitField, PowerPair, TokenAmount)> {
        let (old_numbers, old_power, old_pledge) = self
            .remove_active_sectors(old_sectors, sector_size)
            .context("unscheduling replaced sectors")?;
        let (new_numbers, new_power, new_pledge) = self
            .add_active_sectors(new_sectors, sector_size)
            .context("scheduling replacement sectors")?;

        Ok((old_numbers, new_numbers, &new_power - &old_power, new_pledge - old_pledge))
    }

    /// Unschedules an arbitrary mix of sectors (healthy or faulty, on-time or
    /// early), for termination. Returns the removed aggregate and how much of
    /// the removed power had been declared recovering.
    pub fn remove_sectors(
        &mut self,
        policy: &Policy,
        sectors: &[SectorOnChainInfo],
        faults: &BitField,
        recovering: &BitField,
        sector_size: SectorSize,
    ) -> anyhow::Result<(ExpirationSet, PowerPair)> {
        // Healthy sectors are guaranteed to sit in on-time buckets, findable
        // through their committed expiration. Faulty ones may have been pulled
        // anywhere forward, so they need a queue walk.
        let mut healthy = Vec::<SectorOnChainInfo>::new();
        let mut faulty: BTreeMap<u64, &SectorOnChainInfo> = BTreeMap::new();
        for sector in sectors {
            if faults.get(sector.sector_number) {
                faulty.insert(sector.sector_number, sector);
            } else {
                healthy.push(sector.clone());
            }
        }

        let mut removed = ExpirationSet::empty();
        let mut recovering_power = PowerPair::zero();

        let (numbers, power, pledge) = self
            .remove_active_sectors(&healthy, sector_size)
            .context("unscheduling healthy sectors")?;
        removed.on_time_sectors = numbers;
        removed.active_power = power;
        removed.on_time_pledge = pledge;

        if faults.len() > policy.addressed_sectors_max {
            return Err(anyhow!("refusing to expand {} faults", faults.len()));
        }

        self.walk_mut(|_, bucket| {
            let mut found = Vec::<u64>::new();

            for (&number, sector) in faulty.iter() {
                let on_time = bucket.on_time_sectors.get(number);
                if !on_time && !bucket.early_sectors.get(number) {
                    continue;
                }

                if on_time {
                    bucket.on_time_sectors.unset(number);
                    bucket.on_time_pledge -= &sector.initial_pledge;
                    removed.on_time_sectors.set(number);
                    removed.on_time_pledge += &sector.initial_pledge;
                } else {
                    bucket.early_sectors.unset(number);
                    removed.early_sectors.set(number);
                }

                let power = power_for_sector(sector_size, sector);
                bucket.faulty_power -= &power;
                removed.faulty_power += &power;
                if recovering.get(number) {
                    recovering_power += &power;
                }
                found.push(number);
            }

            for number in found {
                faulty.remove(&number);
            }
            bucket.ensure_consistent()?;

            Ok(!faulty.is_empty())
        })?;

        if !faulty.is_empty() {
            return Err(anyhow!(
                "{} terminated sectors missing from expiration queue",
                faulty.len()
            ));
        }

        Ok((removed, recovering_power))
    }

    /// Removes every bucket due at or before the given epoch and returns their
    /// union as one aggregate set.
    pub fn collect_due(&mut self, until: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        let mut due = ExpirationSet::empty();
        let mut drained = Vec::<u64>::new();

        self.entries.for_each_while(|raw_epoch, bucket| {
            if raw_epoch as ChainEpoch > until {
                return Ok(false);
            }
            due.on_time_sectors |= &bucket.on_time_sectors;
            due.early_sectors |= &bucket.early_sectors;
            due.on_time_pledge += &bucket.on_time_pledge;
            due.active_power += &bucket.active_power;
            due.faulty_power += &bucket.faulty_power;
            drained.push(raw_epoch);
            Ok(true)
        })?;

        self.entries.batch_delete(drained, true)?;
        Ok(due)
    }

    //
    // -- internals --
    //

    /// Removes active sectors from their on-time buckets, returning numbers,
    /// power and pledge removed.
    fn remove_active_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<(BitField, PowerPair, TokenAmount)> {
        let mut all_sectors = BitField::new();
        let mut all_power = PowerPair::zero();
        let mut all_pledge = TokenAmount::zero();

        for (epoch, batch) in self.locate_on_time(sectors, sector_size)? {
            let numbers = batch.bitfield()?;
            self.update_bucket(epoch, |bucket| {
                bucket.remove(
                    &numbers,
                    &BitField::new(),
                    &batch.pledge,
                    &batch.power,
                    &PowerPair::zero(),
                )
            })
            .with_context(|| format!("unscheduling sectors at epoch {}", epoch))?;

            all_sectors |= &numbers;
            all_power += &batch.power;
            all_pledge += &batch.pledge;
        }

        Ok((all_sectors, all_power, all_pledge))
    }

    /// Groups sectors by the quantized epoch of their committed expiration.
    fn bucket_by_declared<'a>(
        &self,
        sectors: impl IntoIterator<Item = &'a SectorOnChainInfo>,
        sector_size: SectorSize,
    ) -> BTreeMap<ChainEpoch, Totals> {
        let mut buckets = BTreeMap::<ChainEpoch, Totals>::new();
        for sector in sectors {
            buckets
                .entry(self.quant.quantize_up(sector.expiration))
                .or_default()
                .note(sector_size, sector);
        }
        buckets
    }

    /// Finds the bucket each sector actually occupies as an on-time entry.
    ///
    /// Most sectors sit at their declared (quantized) expiration, which is
    /// probed directly. Sectors that have been pulled forward (an extension
    /// that was later retracted cannot happen, but replaced sectors can move)
    /// are found by scanning remaining buckets in order. Finding a wanted
    /// sector among the early entries is an error: callers handle early
    /// entries separately.
    fn locate_on_time(
        &self,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
    ) -> anyhow::Result<Vec<(ChainEpoch, Totals)>> {
        let mut wanted: BTreeMap<u64, &SectorOnChainInfo> =
            sectors.iter().map(|s| (s.sector_number, s)).collect();
        let mut located = BTreeMap::<ChainEpoch, Totals>::new();

        // Probe the declared buckets first.
        let declared: Vec<ChainEpoch> = self
            .bucket_by_declared(sectors, sector_size)
            .keys()
            .copied()
            .collect();
        for epoch in &declared {
            let bucket = self.read_bucket(*epoch)?;
            for number in bucket.on_time_sectors.bounded_iter(SECTORS_PER_BUCKET_MAX)
                .context("too many sectors in expiration bucket")?
            {
                if let Some(sector) = wanted.remove(&number) {
                    located.entry(*epoch).or_default().note(sector_size, sector);
                }
            }
        }

        // Scan forward for any stragglers.
        if !wanted.is_empty() {
            self.entries.for_each_while(|raw_epoch, bucket| {
                let epoch = raw_epoch as ChainEpoch;
                if declared.contains(&epoch) {
                    return Ok(!wanted.is_empty());
                }

                for number in bucket.early_sectors.iter() {
                    if wanted.contains_key(&number) {
                        return Err(anyhow!(
                            "sector {} found among early expirations while locating on-time entries",
                            number
                        ));
                    }
                }
                for number in bucket.on_time_sectors.iter() {
                    if let Some(sector) = wanted.remove(&number) {
                        located.entry(epoch).or_default().note(sector_size, sector);
                    }
                }

                Ok(!wanted.is_empty())
            })?;
        }

        if !wanted.is_empty() {
            return Err(anyhow!("{} sectors missing from expiration queue", wanted.len()));
        }

        Ok(located.into_iter().collect())
    }

    fn read_bucket(&self, epoch: ChainEpoch) -> anyhow::Result<ExpirationSet> {
        Ok(self
            .entries
            .get(epoch.try_into()?)
            .with_context(|| format!("reading expiration bucket {}", epoch))?
            .cloned()
            .unwrap_or_default())
    }

    fn write_bucket(&mut self, epoch: ChainEpoch, bucket: ExpirationSet) -> anyhow::Result<()> {
        let key: u64 = epoch.try_into()?;
        if bucket.is_empty() {
            self.entries
                .delete(key)
                .with_context(|| format!("deleting expiration bucket {}", epoch))?;
        } else {
            self.entries
                .set(key, bucket)
                .with_context(|| format!("writing expiration bucket {}", epoch))?;
        }
        Ok(())
    }

    /// Reads (or defaults) the bucket at a quantized epoch, applies the
    /// mutation, and writes the result back, dropping it if emptied.
    fn update_bucket(
        &mut self,
        epoch: ChainEpoch,
        f: impl FnOnce(&mut ExpirationSet) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        debug_assert_eq!(epoch, self.quant.quantize_up(epoch));
        let mut bucket = self.read_bucket(epoch)?;
        f(&mut bucket)?;
        self.write_bucket(epoch, bucket)
    }

    /// Walks the queue with a mutating visitor; entries the visitor empties are
    /// removed after the walk. The visitor returns whether to keep walking.
    fn walk_mut(
        &mut self,
        mut f: impl FnMut(ChainEpoch, &mut ValueMut<'_, ExpirationSet>) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let mut emptied = Vec::<u64>::new();

        self.entries.for_each_while_mut(|raw_epoch, bucket| {
            let keep_walking = f(raw_epoch.try_into()?, bucket)?;

            if bucket.is_empty() {
                // Leave the entry untouched and drop it below; a write here
                // would race the deletion.
                bucket.mark_unchanged();
                emptied.push(raw_epoch);
            }

            Ok(keep_walking)
        })?;

        self.entries.batch_delete(emptied, true)?;
        Ok(())
    }
}
