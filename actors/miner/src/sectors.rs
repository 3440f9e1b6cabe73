// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::{anyhow, Context};
use cid::Cid;
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::SectorNumber;
use storage_actors_runtime::runtime::policy_constants::MAX_SECTOR_NUMBER;
use storage_actors_runtime::{actor_error, ActorError, Array};

use super::SectorOnChainInfo;

/// Accessor over the miner's sector table (a sparse AMT keyed by sector number).
pub struct Sectors<'db, BS> {
    pub amt: Array<'db, SectorOnChainInfo, BS>,
}

impl<'db, BS: Blockstore> Sectors<'db, BS> {
    pub fn load(store: &'db BS, root: &Cid) -> Result<Self, AmtError> {
        Ok(Self { amt: Array::load(root, store)? })
    }

    pub fn get(&self, number: SectorNumber) -> anyhow::Result<Option<SectorOnChainInfo>> {
        Ok(self
            .amt
            .get(number)
            .with_context(|| format!("reading sector {}", number))?
            .cloned())
    }

    pub fn must_get(&self, number: SectorNumber) -> anyhow::Result<SectorOnChainInfo> {
        self.get(number)?.ok_or_else(|| anyhow!("sector {} not found", number))
    }

    /// Reads the infos for every sector in the field, failing on any gap.
    pub fn load_sector(&self, numbers: &BitField) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        let mut infos = Vec::with_capacity(numbers.len() as usize);
        for number in numbers.iter() {
            let info = self
                .amt
                .get(number)
                .map_err(|e| {
                    ActorError::unchecked(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("reading sector {}: {}", number, e),
                    )
                })?
                .cloned()
                .ok_or_else(|| actor_error!(not_found, "sector {} not found", number))?;
            infos.push(info);
        }
        Ok(infos)
    }

    /// Writes a batch of sector infos, keyed by their sector numbers.
    pub fn store(&mut self, infos: Vec<SectorOnChainInfo>) -> anyhow::Result<()> {
        for info in infos {
            let number = info.sector_number;
            if number > MAX_SECTOR_NUMBER {
                return Err(anyhow!("sector number {} out of range", number));
            }
            self.amt.set(number, info).with_context(|| format!("writing sector {}", number))?;
        }
        Ok(())
    }

    /// Builds the sector list a proof is checked against. Faulty members are
    /// substituted with an arbitrary healthy member so the proof's shape stays
    /// fixed while the faulty data is not actually required.
    pub fn load_for_proof(
        &self,
        proven_sectors: &BitField,
        expected_faults: &BitField,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        let healthy = proven_sectors - expected_faults;
        let stand_in_number = healthy
            .first()
            .ok_or_else(|| anyhow!("no healthy sectors to prove against"))?;
        let stand_in = self.must_get(stand_in_number)?;

        let mut infos = Vec::with_capacity(proven_sectors.len() as usize);
        for number in proven_sectors.iter() {
            if expected_faults.get(number) {
                infos.push(stand_in.clone());
            } else {
                infos.push(self.must_get(number)?);
            }
        }
        Ok(infos)
    }
}

/// Picks out of `infos` the entries named by `field`, in the order they appear
/// in `infos`. Every named sector must be present.
pub fn select_sectors(
    infos: &[SectorOnChainInfo],
    field: &BitField,
) -> anyhow::Result<Vec<SectorOnChainInfo>> {
    let mut missing = field.len();
    let mut selected = Vec::with_capacity(missing as usize);
    for info in infos {
        if field.get(info.sector_number) {
            selected.push(info.clone());
            missing -= 1;
        }
    }

    if missing > 0 {
        return Err(anyhow!("{} selected sectors not present in infos", missing));
    }
    Ok(selected)
}
