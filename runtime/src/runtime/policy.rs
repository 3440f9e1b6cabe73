// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::{RegisteredPoStProof, RegisteredSealProof, StoragePower};

use crate::network::{EPOCHS_IN_DAY, EPOCHS_IN_HOUR};

pub use self::policy_constants::*;

/// A set of global network parameters, frozen at actor construction.
/// Tests may override individual fields through a mutable handle before
/// any state is created.
#[derive(Debug, Clone)]
pub struct Policy {
    //
    // --- miner policy ---
    //
    /// Maximum amount of sectors that can be aggregated.
    pub max_aggregated_sectors: u64,
    /// Minimum amount of sectors that can be aggregated.
    pub min_aggregated_sectors: u64,
    /// Maximum total aggregated proof size.
    pub max_aggregated_proof_size: usize,

    /// The maximum number of sector pre-commitments in a single batch.
    pub pre_commit_sector_batch_max_size: usize,
    /// The maximum number of sector replica updates in a single batch.
    pub prove_replica_updates_max_size: usize,

    /// The delay between pre commit expiration and clean up from state. This enforces that expired pre-commits
    /// stay in state for a period of time creating a grace period during which a late-running aggregated prove-commit
    /// can still prove its non-expired precommits without resubmitting a message.
    pub expired_pre_commit_clean_up_delay: i64,

    /// The period over which all a miner's active sectors will be challenged.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// The maximum distance back that a valid Window PoSt must commit to the current chain.
    pub wpost_max_chain_commit_age: ChainEpoch,
    /// Number of epochs after a deadline's challenge window closes during which
    /// an optimistically accepted PoSt may be disputed.
    pub wpost_dispute_window: ChainEpoch,

    /// The maximum number of sectors that a miner can have simultaneously active.
    /// This also bounds the number of faults that can be declared, etc.
    pub sectors_max: usize,

    /// Maximum number of partitions that will be assigned to a deadline.
    pub max_partitions_per_deadline: u64,

    /// Maximum number of control addresses a miner may register.
    pub max_control_addresses: usize,

    /// MaxPeerIDLength is the maximum length allowed for any on-chain peer ID.
    pub max_peer_id_length: usize,

    /// MaxMultiaddrData is the maximum amount of data that can be stored in multiaddrs.
    pub max_multiaddr_data: usize,

    /// The maximum number of partitions that may be required to be loaded in a single invocation.
    /// This limits the number of simultaneous fault, recovery, or sector-extension declarations.
    pub addressed_partitions_max: u64,

    /// The maximum number of sector infos that may be required to be loaded in a single invocation.
    pub addressed_sectors_max: u64,

    /// The maximum number of partitions that may be required to be loaded in a single invocation,
    /// when all the sector infos for the partitions will be loaded.
    pub declarations_max: u64,

    /// Epochs after which chain state is final with overwhelming probability
    /// (hence the likelihood of two fork of this size is negligible).
    pub chain_finality: ChainEpoch,

    /// Allowed post proof types for new miners.
    pub valid_post_proof_type: Vec<RegisteredPoStProof>,

    /// Allowed pre commit proof types for new miners.
    pub valid_pre_commit_proof_type: Vec<RegisteredSealProof>,

    /// Lookback from the deadline's challenge window opening from which to sample chain randomness for the challenge seed.
    /// This lookback exists so that deadline windows can be non-overlapping (which make the programming simpler)
    /// but without making the miner wait for chain stability before being able to start on PoSt computation.
    pub wpost_challenge_lookback: ChainEpoch,

    /// Minimum period between fault declaration and the next deadline opening.
    /// If the number of epochs between fault declaration and deadline's challenge window opening is lower than FaultDeclarationCutoff,
    /// the fault declaration is considered invalid for that deadline.
    pub fault_declaration_cutoff: ChainEpoch,

    /// The maximum age of a fault before the sector is terminated.
    pub fault_max_age: ChainEpoch,

    /// Staging period for a miner worker key change.
    pub worker_key_change_delay: ChainEpoch,

    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: i64,

    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: i64,

    /// Maximum number of epochs past the current epoch the sector can be set to expire.
    pub max_pre_commit_randomness_lookback: ChainEpoch,

    /// Number of epochs between publishing the precommit and when the challenge for interactive PoRep is drawn
    /// used to ensure it is not predictable by miner.
    pub pre_commit_challenge_delay: ChainEpoch,

    /// Minimum power of an individual miner to meet the threshold for leader election.
    pub minimum_consensus_power: StoragePower,

    /// Number of epochs a miner is barred from pre-committing sectors and
    /// declaring recoveries after a reported consensus fault.
    pub consensus_fault_ineligibility_duration: ChainEpoch,

    //
    // --- market policy ---
    //
    /// The number of blocks between payouts for deals.
    pub deal_updates_interval: i64,

    /// Numerator of the percentage of normalized circulating supply that must be
    /// covered by provider collateral.
    pub prov_collateral_percent_supply_num: i64,

    /// Denominator of the percentage of normalized circulating supply that must be
    /// covered by provider collateral.
    pub prov_collateral_percent_supply_denom: i64,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            max_aggregated_sectors: policy_constants::MAX_AGGREGATED_SECTORS,
            min_aggregated_sectors: policy_constants::MIN_AGGREGATED_SECTORS,
            max_aggregated_proof_size: policy_constants::MAX_AGGREGATED_PROOF_SIZE,
            pre_commit_sector_batch_max_size: policy_constants::PRE_COMMIT_SECTOR_BATCH_MAX_SIZE,
            prove_replica_updates_max_size: policy_constants::PROVE_REPLICA_UPDATES_MAX_SIZE,
            expired_pre_commit_clean_up_delay: policy_constants::EXPIRED_PRE_COMMIT_CLEAN_UP_DELAY,
            wpost_proving_period: policy_constants::WPOST_PROVING_PERIOD,
            wpost_challenge_window: policy_constants::WPOST_CHALLENGE_WINDOW,
            wpost_period_deadlines: policy_constants::WPOST_PERIOD_DEADLINES,
            wpost_max_chain_commit_age: policy_constants::WPOST_MAX_CHAIN_COMMIT_AGE,
            wpost_dispute_window: policy_constants::WPOST_DISPUTE_WINDOW,
            sectors_max: policy_constants::SECTORS_MAX,
            max_partitions_per_deadline: policy_constants::MAX_PARTITIONS_PER_DEADLINE,
            max_control_addresses: policy_constants::MAX_CONTROL_ADDRESSES,
            max_peer_id_length: policy_constants::MAX_PEER_ID_LENGTH,
            max_multiaddr_data: policy_constants::MAX_MULTIADDR_DATA,
            addressed_partitions_max: policy_constants::ADDRESSED_PARTITIONS_MAX,
            addressed_sectors_max: policy_constants::ADDRESSED_SECTORS_MAX,
            declarations_max: policy_constants::DECLARATIONS_MAX,
            chain_finality: policy_constants::CHAIN_FINALITY,
            valid_post_proof_type: vec![
                RegisteredPoStProof::StackedDRGWindow2KiBV1,
                RegisteredPoStProof::StackedDRGWindow8MiBV1,
                RegisteredPoStProof::StackedDRGWindow512MiBV1,
                RegisteredPoStProof::StackedDRGWindow32GiBV1,
                RegisteredPoStProof::StackedDRGWindow64GiBV1,
            ],
            valid_pre_commit_proof_type: vec![
                RegisteredSealProof::StackedDRG2KiBV1P1,
                RegisteredSealProof::StackedDRG8MiBV1P1,
                RegisteredSealProof::StackedDRG512MiBV1P1,
                RegisteredSealProof::StackedDRG32GiBV1P1,
                RegisteredSealProof::StackedDRG64GiBV1P1,
            ],
            wpost_challenge_lookback: policy_constants::WPOST_CHALLENGE_LOOKBACK,
            fault_declaration_cutoff: policy_constants::FAULT_DECLARATION_CUTOFF,
            fault_max_age: policy_constants::FAULT_MAX_AGE,
            worker_key_change_delay: policy_constants::WORKER_KEY_CHANGE_DELAY,
            min_sector_expiration: policy_constants::MIN_SECTOR_EXPIRATION,
            max_sector_expiration_extension: policy_constants::MAX_SECTOR_EXPIRATION_EXTENSION,
            max_pre_commit_randomness_lookback:
                policy_constants::MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK,
            pre_commit_challenge_delay: policy_constants::PRE_COMMIT_CHALLENGE_DELAY,
            minimum_consensus_power: StoragePower::from(policy_constants::MINIMUM_CONSENSUS_POWER),
            consensus_fault_ineligibility_duration:
                policy_constants::CONSENSUS_FAULT_INELIGIBILITY_DURATION,
            deal_updates_interval: policy_constants::DEAL_UPDATES_INTERVAL,
            prov_collateral_percent_supply_num:
                policy_constants::PROV_COLLATERAL_PERCENT_SUPPLY_NUM,
            prov_collateral_percent_supply_denom:
                policy_constants::PROV_COLLATERAL_PERCENT_SUPPLY_DENOM,
        }
    }
}

pub mod policy_constants {
    use fvm_shared::clock::EPOCH_DURATION_SECONDS;

    use super::*;

    pub const MAX_AGGREGATED_SECTORS: u64 = 819;
    pub const MIN_AGGREGATED_SECTORS: u64 = 4;
    pub const MAX_AGGREGATED_PROOF_SIZE: usize = 81960;

    pub const PRE_COMMIT_SECTOR_BATCH_MAX_SIZE: usize = 256;
    pub const PROVE_REPLICA_UPDATES_MAX_SIZE: usize = PRE_COMMIT_SECTOR_BATCH_MAX_SIZE;

    pub const EXPIRED_PRE_COMMIT_CLEAN_UP_DELAY: i64 = 8 * EPOCHS_IN_HOUR;

    pub const WPOST_PROVING_PERIOD: ChainEpoch = EPOCHS_IN_DAY;
    pub const WPOST_CHALLENGE_WINDOW: ChainEpoch = 30 * 60 / EPOCH_DURATION_SECONDS;
    pub const WPOST_PERIOD_DEADLINES: u64 = 48;
    pub const WPOST_MAX_CHAIN_COMMIT_AGE: ChainEpoch = WPOST_CHALLENGE_WINDOW;
    pub const WPOST_DISPUTE_WINDOW: ChainEpoch = 2 * CHAIN_FINALITY;

    pub const SECTORS_MAX: usize = 32 << 20;

    pub const MAX_PARTITIONS_PER_DEADLINE: u64 = 3000;

    pub const MAX_CONTROL_ADDRESSES: usize = 10;

    pub const MAX_PEER_ID_LENGTH: usize = 128;

    pub const MAX_MULTIADDR_DATA: usize = 1024;

    pub const ADDRESSED_PARTITIONS_MAX: u64 = MAX_PARTITIONS_PER_DEADLINE;

    pub const ADDRESSED_SECTORS_MAX: u64 = 25_000;

    pub const DECLARATIONS_MAX: u64 = ADDRESSED_PARTITIONS_MAX;

    pub const CHAIN_FINALITY: ChainEpoch = 900;

    pub const WPOST_CHALLENGE_LOOKBACK: ChainEpoch = 20;

    pub const FAULT_DECLARATION_CUTOFF: ChainEpoch = WPOST_CHALLENGE_LOOKBACK + 50;

    pub const FAULT_MAX_AGE: ChainEpoch = WPOST_PROVING_PERIOD * 14;

    pub const WORKER_KEY_CHANGE_DELAY: ChainEpoch = CHAIN_FINALITY;

    pub const MIN_SECTOR_EXPIRATION: i64 = 180 * EPOCHS_IN_DAY;

    pub const MAX_SECTOR_EXPIRATION_EXTENSION: i64 = 540 * EPOCHS_IN_DAY;

    pub const MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK: ChainEpoch = EPOCHS_IN_DAY + CHAIN_FINALITY;

    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;

    pub const MINIMUM_CONSENSUS_POWER: i64 = 10 << 40;

    pub const CONSENSUS_FAULT_INELIGIBILITY_DURATION: ChainEpoch = CHAIN_FINALITY;

    pub const DEAL_UPDATES_INTERVAL: i64 = EPOCHS_IN_DAY;

    pub const PROV_COLLATERAL_PERCENT_SUPPLY_NUM: i64 = 1;

    pub const PROV_COLLATERAL_PERCENT_SUPPLY_DENOM: i64 = 100;

    /// Largest sector number an actor will ever allocate, 2^63 - 1.
    pub const MAX_SECTOR_NUMBER: u64 = i64::MAX as u64;
}
