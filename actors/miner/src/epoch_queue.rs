// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;

use anyhow::Context;
use cid::Cid;
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use storage_actors_runtime::Array;

/// A schedule of bitfields keyed by epoch, backed by an AMT[ChainEpoch]BitField.
/// Keys are rounded up onto the quantization grid when written, so events landing
/// near each other share one bucket and the array stays shallow.
pub struct EpochQueue<'db, BS> {
    pub entries: Array<'db, BitField, BS>,
    pub quant: QuantSpec,
}

impl<'db, BS: Blockstore> EpochQueue<'db, BS> {
    pub fn load(store: &'db BS, root: &Cid, quant: QuantSpec) -> Result<Self, AmtError> {
        Ok(Self { entries: Array::load(root, store)?, quant })
    }

    /// Merges values into the bucket for an epoch.
    pub fn enqueue(&mut self, raw_epoch: ChainEpoch, values: &BitField) -> anyhow::Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let bucket = self.quant.quantize_up(raw_epoch) as u64;
        let merged = match self.entries.get(bucket).context("reading queue bucket")? {
            Some(present) => present | values,
            None => values.clone(),
        };
        self.entries
            .set(bucket, merged)
            .with_context(|| format!("writing queue bucket {}", bucket))?;
        Ok(())
    }

    pub fn enqueue_values(
        &mut self,
        raw_epoch: ChainEpoch,
        values: impl IntoIterator<Item = u64>,
    ) -> anyhow::Result<()> {
        self.enqueue(raw_epoch, &BitField::try_from_bits(values)?)
    }

    /// Merges a batch of values spread over several epochs. Buckets are written
    /// in ascending order so the resulting tree is identical no matter how the
    /// input map iterates.
    pub fn enqueue_many(
        &mut self,
        values_by_epoch: &HashMap<ChainEpoch, Vec<u64>>,
    ) -> anyhow::Result<()> {
        // Several raw epochs may collapse onto one bucket; merge before writing.
        let mut buckets = std::collections::BTreeMap::<ChainEpoch, Vec<u64>>::new();
        for (&raw_epoch, values) in values_by_epoch {
            buckets
                .entry(self.quant.quantize_up(raw_epoch))
                .or_default()
                .extend_from_slice(values);
        }

        for (epoch, values) in buckets {
            self.enqueue_values(epoch, values)?;
        }
        Ok(())
    }

    /// Removes every bucket scheduled at or before `until` and returns their
    /// union. The boolean reports whether anything was removed.
    pub fn drain_through(&mut self, until: ChainEpoch) -> anyhow::Result<(BitField, bool)> {
        let mut drained = BitField::new();
        let mut removed = Vec::<u64>::new();

        self.entries.for_each_while(|epoch, values| {
            if epoch as ChainEpoch > until {
                return Ok(false);
            }
            drained |= values;
            removed.push(epoch);
            Ok(true)
        })?;

        if removed.is_empty() {
            return Ok((BitField::new(), false));
        }

        self.entries.batch_delete(removed, true).context("dropping drained queue buckets")?;
        Ok((drained, true))
    }

    /// Cuts the given field out of every bucket, renumbering the survivors down
    /// (bitfield `cut` semantics) and deleting buckets that end up empty.
    pub fn strip(&mut self, to_strip: &BitField) -> anyhow::Result<()> {
        let mut emptied = Vec::<u64>::new();

        self.entries
            .for_each_while_mut(|epoch, values| {
                let remaining = values.cut(to_strip);
                if remaining.is_empty() {
                    emptied.push(epoch);
                } else {
                    **values = remaining;
                }
                Ok(true)
            })
            .context("stripping queue buckets")?;

        self.entries.batch_delete(emptied, true).context("dropping emptied queue buckets")?;
        Ok(())
    }
}
