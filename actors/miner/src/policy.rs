// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use cid::{Cid, Version};
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::{FIL_COMMITMENT_SEALED, POSEIDON_BLS12_381_A1_FC1};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{
    RegisteredPoStProof, RegisteredSealProof, SectorQuality, SectorSize, StoragePower,
};
use lazy_static::lazy_static;
use storage_actors_runtime::network::{EPOCHS_IN_DAY, EPOCHS_IN_HOUR, EPOCHS_IN_YEAR};
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::{DealWeight, EXPECTED_LEADERS_PER_EPOCH};

use super::types::SectorOnChainInfo;
use super::{PowerPair, BASE_REWARD_FOR_DISPUTED_WINDOW_POST};

/// Fixed-point fractional bits used for sector quality.
pub const SECTOR_QUALITY_PRECISION: i64 = 20;

lazy_static! {
    /// Quality weight of committed capacity with no deals.
    pub static ref QUALITY_BASE_MULTIPLIER: BigInt = BigInt::from(10);
    /// Quality weight of ordinary deal space.
    pub static ref DEAL_WEIGHT_MULTIPLIER: BigInt = BigInt::from(10);
    /// Quality weight of verified deal space.
    pub static ref VERIFIED_DEAL_WEIGHT_MULTIPLIER: BigInt = BigInt::from(100);
}

/// How many partitions one message may load when it will also load all their
/// sector infos.
pub fn load_partitions_sectors_max(policy: &Policy, partition_sector_count: u64) -> u64 {
    cmp::min(
        policy.addressed_sectors_max / partition_sector_count,
        policy.addressed_partitions_max,
    )
}

/// Whether a CID has the shape of a sealed-sector commitment (CommR).
pub fn is_sealed_sector(c: &Cid) -> bool {
    c.version() == Version::V1
        && c.codec() == FIL_COMMITMENT_SEALED
        && c.hash().code() == POSEIDON_BLS12_381_A1_FC1
        && c.hash().size() == 32
}

pub fn can_pre_commit_seal_proof(policy: &Policy, proof: RegisteredSealProof) -> bool {
    policy.valid_pre_commit_proof_type.contains(&proof)
}

/// Every registered seal proof may currently be extended.
pub fn can_extend_seal_proof_type(_proof: RegisteredSealProof) -> bool {
    true
}

/// How long a pre-commitment may wait for its proof, per seal algorithm.
pub fn max_prove_commit_duration(
    policy: &Policy,
    proof: RegisteredSealProof,
) -> Option<ChainEpoch> {
    use RegisteredSealProof::*;
    let sealing_allowance = match proof {
        StackedDRG2KiBV1 | StackedDRG8MiBV1 | StackedDRG512MiBV1 | StackedDRG32GiBV1
        | StackedDRG64GiBV1 => EPOCHS_IN_DAY,
        StackedDRG2KiBV1P1 | StackedDRG8MiBV1P1 | StackedDRG512MiBV1P1 | StackedDRG32GiBV1P1
        | StackedDRG64GiBV1P1 => 30 * EPOCHS_IN_DAY,
        _ => return None,
    };
    Some(sealing_allowance + policy.pre_commit_challenge_delay)
}

/// Longest committed lifetime a sector of the given seal algorithm may have.
pub fn seal_proof_sector_maximum_lifetime(proof: RegisteredSealProof) -> Option<ChainEpoch> {
    use RegisteredSealProof::*;
    match proof {
        StackedDRG2KiBV1 | StackedDRG8MiBV1 | StackedDRG512MiBV1 | StackedDRG32GiBV1
        | StackedDRG64GiBV1 => Some(540 * EPOCHS_IN_DAY),
        StackedDRG2KiBV1P1 | StackedDRG8MiBV1P1 | StackedDRG512MiBV1P1 | StackedDRG32GiBV1P1
        | StackedDRG64GiBV1P1 => Some(5 * EPOCHS_IN_YEAR),
        _ => None,
    }
}

/// Sector quality as a Q.20 fixed-point number: the spacetime-weighted mean of
/// the multipliers for plain capacity, deal space and verified deal space.
/// Deal weights are spacetime (bytes × epochs); whatever spacetime the deals
/// don't fill counts at the base multiplier.
pub fn quality_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> SectorQuality {
    let spacetime = BigInt::from(size as u64) * duration;
    let base_spacetime = &spacetime - deal_weight - verified_weight;

    let weighted = base_spacetime * &*QUALITY_BASE_MULTIPLIER
        + deal_weight * &*DEAL_WEIGHT_MULTIPLIER
        + verified_weight * &*VERIFIED_DEAL_WEIGHT_MULTIPLIER;

    (weighted << SECTOR_QUALITY_PRECISION)
        .div_floor(&spacetime)
        .div_floor(&QUALITY_BASE_MULTIPLIER)
}

/// The QA power ceiling for a sector size (all-verified quality).
pub fn qa_power_max(size: SectorSize) -> StoragePower {
    (BigInt::from(size as u64) * &*VERIFIED_DEAL_WEIGHT_MULTIPLIER)
        .div_floor(&QUALITY_BASE_MULTIPLIER)
}

/// QA power for a sector size with the given deal weights over a duration.
pub fn qa_power_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> StoragePower {
    let quality = quality_for_weight(size, duration, deal_weight, verified_weight);
    (BigInt::from(size as u64) * quality) >> SECTOR_QUALITY_PRECISION
}

pub fn qa_power_for_sector(size: SectorSize, sector: &SectorOnChainInfo) -> StoragePower {
    qa_power_for_weight(
        size,
        sector.expiration - sector.activation,
        &sector.deal_weight,
        &sector.verified_deal_weight,
    )
}

/// Sector size divided by this gives the deal count ceiling per sector
/// (floored at 256): 2^27, i.e. one deal per 128 MiB.
const DEAL_LIMIT_DENOMINATOR: u64 = 134217728;

pub fn sector_deals_max(size: SectorSize) -> u64 {
    cmp::max(256, size as u64 / DEAL_LIMIT_DENOMINATOR)
}

/// A linear vesting schedule.
pub struct VestSpec {
    /// Epochs before the clock starts.
    pub initial_delay: ChainEpoch,
    /// Span over which the full amount vests once the clock starts.
    pub vest_period: ChainEpoch,
    /// Spacing between incremental vests.
    pub step_duration: ChainEpoch,
    /// Grid the vest epochs are rounded onto, bounding table size.
    pub quantization: ChainEpoch,
}

pub const REWARD_VESTING_SPEC: VestSpec = VestSpec {
    initial_delay: 0,
    vest_period: 180 * EPOCHS_IN_DAY,
    step_duration: EPOCHS_IN_DAY,
    quantization: 12 * EPOCHS_IN_HOUR,
};

/// Consensus-fault reporters receive a quarter of one expected block reward.
pub const CONSENSUS_FAULT_REPORTER_SHARE_DENOM: u64 = 4;

pub fn reward_for_consensus_slash_report(epoch_reward: &TokenAmount) -> TokenAmount {
    epoch_reward.div_floor(EXPECTED_LEADERS_PER_EPOCH * CONSENSUS_FAULT_REPORTER_SHARE_DENOM)
}

/// The bounty for a successful Window PoSt dispute. Flat for now; the disputed
/// power is accepted so a future scale-up doesn't change the signature.
pub fn reward_for_disputed_window_post(
    _proof_type: RegisteredPoStProof,
    _disputed_power: PowerPair,
) -> TokenAmount {
    BASE_REWARD_FOR_DISPUTED_WINDOW_POST.clone()
}

#[cfg(test)]
mod tests {
    use num_traits::Zero;

    use super::*;

    #[test]
    fn quality_spans_base_to_verified() {
        let duration = 180 * EPOCHS_IN_DAY;
        for size in [SectorSize::_2KiB, SectorSize::_32GiB] {
            let spacetime = BigInt::from(size as u64) * duration;

            let empty = quality_for_weight(size, duration, &BigInt::zero(), &BigInt::zero());
            assert_eq!(BigInt::from(1), empty >> SECTOR_QUALITY_PRECISION);

            let all_verified = quality_for_weight(size, duration, &BigInt::zero(), &spacetime);
            assert_eq!(BigInt::from(10), all_verified >> SECTOR_QUALITY_PRECISION);
        }
    }

    #[test]
    fn qa_power_ceiling_is_ten_times_size() {
        assert_eq!(
            BigInt::from(SectorSize::_32GiB as u64) * 10,
            qa_power_max(SectorSize::_32GiB)
        );
    }
}
