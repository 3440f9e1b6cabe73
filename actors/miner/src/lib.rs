// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::iter;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cid::Cid;
use fvm_ipld_bitfield::{BitField, Validate};
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{from_slice, BytesDe, CborStore, RawBytes};
use fvm_shared::address::{Address, Payload, Protocol};
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::{Randomness, RANDOMNESS_LENGTH};
use fvm_shared::reward::ThisEpochRewardReturn;
use fvm_shared::sector::{
    AggregateSealVerifyInfo, AggregateSealVerifyProofAndInfos, PoStProof, RegisteredAggregateProof,
    RegisteredSealProof, ReplicaUpdateInfo, SealVerifyInfo, SectorID, SectorInfo, SectorNumber,
    SectorSize, WindowPoStVerifyInfo,
};
use fvm_shared::smooth::FilterEstimate;
use fvm_shared::{MethodNum, METHOD_CONSTRUCTOR, METHOD_SEND};
use log::{error, info, warn};
use multihash::Code::Blake2b256;
use num_derive::FromPrimitive;
use num_traits::{FromPrimitive, Signed, Zero};

pub use deadline_assignment::*;
pub use deadline_info::*;
pub use deadline_state::*;
pub use deadlines::*;
pub use epoch_queue::*;
pub use expiration_queue::*;
pub use monies::*;
pub use partition_state::*;
pub use policy::*;
pub use sector_map::*;
pub use sectors::*;
pub use state::*;
pub use termination::*;
pub use types::*;
pub use vesting_state::*;

use storage_actors_runtime::cbor::{deserialize, serialize, serialize_vec};
use storage_actors_runtime::network::EPOCHS_IN_DAY;
use storage_actors_runtime::runtime::builtins::Type;
use storage_actors_runtime::runtime::policy_constants::MAX_SECTOR_NUMBER;
use storage_actors_runtime::runtime::{ActorCode, DomainSeparationTag, Policy, Runtime};
use storage_actors_runtime::{
    actor_error, cbor, ActorError, AsActorError, BURNT_FUNDS_ACTOR_ADDR, CALLER_TYPES_SIGNABLE,
    INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR, STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};

mod deadline_assignment;
mod deadline_info;
mod deadline_state;
mod deadlines;
mod epoch_queue;
mod expiration_queue;
#[doc(hidden)]
pub mod ext;
mod monies;
mod partition_state;
mod policy;
mod sector_map;
mod sectors;
mod state;
mod termination;
mod types;
mod vesting_state;

/// Storage Miner actor methods. The numbering is a stable wire contract.
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    ControlAddresses = 2,
    ChangeWorkerAddress = 3,
    ChangePeerID = 4,
    SubmitWindowedPoSt = 5,
    PreCommitSector = 6,
    ProveCommitSector = 7,
    ExtendSectorExpiration = 8,
    TerminateSectors = 9,
    DeclareFaults = 10,
    DeclareFaultsRecovered = 11,
    OnDeferredCronEvent = 12,
    CheckSectorProven = 13,
    ApplyRewards = 14,
    ReportConsensusFault = 15,
    WithdrawBalance = 16,
    ConfirmSectorProofsValid = 17,
    ChangeMultiaddrs = 18,
    CompactPartitions = 19,
    CompactSectorNumbers = 20,
    ConfirmUpdateWorkerKey = 21,
    RepayDebt = 22,
    ChangeOwnerAddress = 23,
    DisputeWindowedPoSt = 24,
    PreCommitSectorBatch = 25,
    ProveCommitAggregate = 26,
    ProveReplicaUpdates = 27,
}

/// A broken balance invariant means a bug in this actor, not bad input; the
/// distinguished code makes that legible from outside.
pub const ERR_BALANCE_INVARIANTS_BROKEN: ExitCode = ExitCode::new(1000);

/// Storage Miner actor.
pub struct Actor;

impl Actor {
    pub fn constructor<BS, RT>(
        rt: &mut RT,
        params: MinerConstructorParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_is(iter::once(&INIT_ACTOR_ADDR))?;

        check_control_addresses(rt.policy(), &params.control_addresses)?;
        check_peer_info(rt.policy(), &params.peer_id, &params.multi_addresses)?;
        check_window_post_type(rt.policy(), params.window_post_proof_type)?;

        let owner = resolve_principal_address(rt, params.owner)?;
        let worker = resolve_worker_address(rt, params.worker)?;
        let control_addresses = params
            .control_addresses
            .into_iter()
            .map(|address| resolve_principal_address(rt, address))
            .collect::<Result<Vec<_>, _>>()?;

        // Stagger this miner's proving period against the rest of the network
        // by hashing its address and birth epoch into an offset.
        let current_epoch = rt.curr_epoch();
        let offset = stagger_period_offset(rt.policy(), rt.message().receiver(), current_epoch, |b| {
            rt.hash_blake2b(b)
        })
        .context_code(ExitCode::USR_SERIALIZATION, "computing proving period offset")?;

        let period_start = nearest_period_start(rt.policy(), current_epoch, offset);
        if period_start > current_epoch {
            return Err(actor_error!(
                illegal_state,
                "proving period start {} is after the current epoch {}",
                period_start,
                current_epoch
            ));
        }
        let deadline_idx = deadline_index_at(rt.policy(), current_epoch, period_start);
        if deadline_idx >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(illegal_state, "invalid deadline index {}", deadline_idx));
        }

        let info = MinerInfo::new(
            owner,
            worker,
            control_addresses,
            params.peer_id,
            params.multi_addresses,
            params.window_post_proof_type,
        )?;
        let info_cid = rt
            .store()
            .put_cbor(&info, Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "storing miner info")?;

        let state = State::new(rt.policy(), rt.store(), info_cid, period_start, deadline_idx)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "constructing state")?;
        rt.create(&state)?;
        Ok(())
    }

    /// Reports the owner, worker and control addresses.
    fn control_addresses<BS, RT>(rt: &mut RT) -> Result<GetControlAddressesReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_accept_any()?;
        let state: State = rt.state()?;
        let info = read_miner_info(rt.store(), &state)?;
        Ok(GetControlAddressesReturn {
            owner: info.owner,
            worker: info.worker,
            control_addresses: info.control_addresses,
        })
    }

    /// Replaces the control addresses outright and stages a worker rotation if
    /// a different worker is given. Owner only.
    fn change_worker_address<BS, RT>(
        rt: &mut RT,
        params: ChangeWorkerAddressParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        check_control_addresses(rt.policy(), &params.new_control_addresses)?;

        let new_worker = resolve_worker_address(rt, params.new_worker)?;
        let control_addresses = params
            .new_control_addresses
            .into_iter()
            .map(|address| resolve_principal_address(rt, address))
            .collect::<Result<Vec<_>, _>>()?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(iter::once(&info.owner))?;

            info.control_addresses = control_addresses;

            // The worker rotates only after a security delay, and a pending
            // rotation is never overwritten.
            if new_worker != info.worker && info.pending_worker_key.is_none() {
                info.pending_worker_key = Some(WorkerKeyChange {
                    new_worker,
                    effective_at: rt.curr_epoch() + rt.policy().worker_key_change_delay,
                });
            }

            write_miner_info(rt.store(), state, &info)
        })
    }

    /// Finalizes a staged worker rotation whose delay has elapsed. Owner only.
    fn confirm_update_worker_key<BS, RT>(rt: &mut RT) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(iter::once(&info.owner))?;
            apply_pending_worker_change(rt, &mut info, state)
        })
    }

    /// Two-phase owner handover: the owner proposes, the proposed address
    /// confirms by calling with its own address. The owner can re-propose or
    /// cancel (by proposing itself) until confirmation.
    fn change_owner_address<BS, RT>(rt: &mut RT, new_address: Address) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        if !matches!(new_address.protocol(), Protocol::ID) {
            return Err(actor_error!(illegal_argument, "owner address must be an ID address"));
        }

        rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;

            if rt.message().caller() == info.owner || info.pending_owner_address.is_none() {
                // Proposal (or re-proposal) by the current owner.
                rt.validate_immediate_caller_is(iter::once(&info.owner))?;
                info.pending_owner_address = Some(new_address);
            } else {
                // Confirmation by the proposed address.
                let proposed = info.pending_owner_address.unwrap();
                rt.validate_immediate_caller_is(iter::once(&proposed))?;
                if new_address != proposed {
                    return Err(actor_error!(
                        illegal_argument,
                        "confirmation for {} does not match proposal {}",
                        new_address,
                        proposed
                    ));
                }
                info.owner = proposed;
            }

            // A proposal of the current owner is a cancellation.
            if info.pending_owner_address == Some(info.owner) {
                info.pending_owner_address = None;
            }

            write_miner_info(rt.store(), state, &info)
        })
    }

    fn change_peer_id<BS, RT>(rt: &mut RT, params: ChangePeerIDParams) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        check_peer_info(rt.policy(), &params.new_id, &[])?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            info.peer_id = params.new_id;
            write_miner_info(rt.store(), state, &info)
        })
    }

    fn change_multiaddresses<BS, RT>(
        rt: &mut RT,
        params: ChangeMultiaddrsParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        check_peer_info(rt.policy(), &[], &params.new_multi_addrs)?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            info.multi_address = params.new_multi_addrs;
            write_miner_info(rt.store(), state, &info)
        })
    }

    /// Accepts a Window PoSt for the open deadline.
    ///
    /// The submission is bound to the chain via the commit randomness, skipped
    /// sectors become faults, recoveries are honored, and unproven power
    /// activates. Absent recoveries the proof itself is merely logged for the
    /// dispute window; with recoveries it is verified on the spot.
    fn submit_windowed_post<BS, RT>(
        rt: &mut RT,
        mut params: SubmitWindowedPoStParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let current_epoch = rt.curr_epoch();

        if params.proofs.len() != 1 {
            return Err(actor_error!(
                illegal_argument,
                "expected exactly one proof, got {}",
                params.proofs.len()
            ));
        }
        if check_window_post_type(rt.policy(), params.proofs[0].post_proof).is_err() {
            return Err(actor_error!(
                illegal_argument,
                "proof type {:?} not allowed",
                params.proofs[0].post_proof
            ));
        }
        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {} of {}",
                params.deadline,
                rt.policy().wpost_period_deadlines
            ));
        }
        if params.chain_commit_rand.0.len() > RANDOMNESS_LENGTH {
            return Err(actor_error!(
                illegal_argument,
                "chain commit randomness of {} bytes exceeds maximum {}",
                params.chain_commit_rand.0.len(),
                RANDOMNESS_LENGTH
            ));
        }

        let post_result = rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            if params.proofs[0].post_proof != info.window_post_proof_type {
                return Err(actor_error!(
                    illegal_argument,
                    "expected proof of type {:?}, got {:?}",
                    info.window_post_proof_type,
                    params.proofs[0].post_proof
                ));
            }
            // An exact size could be required; an upper bound is the safer check.
            let max_proof_size = info
                .window_post_proof_type
                .proof_size()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "proof size for post type")?
                * params.partitions.len();
            if params.proofs[0].proof_bytes.len() > max_proof_size {
                return Err(actor_error!(
                    illegal_argument,
                    "proof of {} bytes exceeds maximum {}",
                    params.proofs[0].proof_bytes.len(),
                    max_proof_size
                ));
            }
            let partition_limit =
                load_partitions_sectors_max(rt.policy(), info.window_post_partition_sectors);
            if params.partitions.len() as u64 > partition_limit {
                return Err(actor_error!(
                    illegal_argument,
                    "too many partitions {}, limit {}",
                    params.partitions.len(),
                    partition_limit
                ));
            }

            // Position in the proving schedule comes from the epoch, not from
            // recorded cron state; a lapsed cron cannot open a window.
            let live_deadline = state.deadline_info(rt.policy(), current_epoch);
            if !live_deadline.is_open() {
                return Err(actor_error!(
                    illegal_state,
                    "proving period {} not yet open at {}",
                    live_deadline.period_start,
                    current_epoch
                ));
            }
            if params.deadline != live_deadline.index {
                return Err(actor_error!(
                    illegal_argument,
                    "invalid deadline {} at epoch {}, should be {}",
                    params.deadline,
                    current_epoch,
                    live_deadline.index
                ));
            }

            // The proof must commit to a recent chain: no earlier than the
            // challenge epoch, and strictly in the past.
            if params.chain_commit_epoch < live_deadline.challenge {
                return Err(actor_error!(
                    illegal_argument,
                    "chain commit epoch {} precedes challenge {}",
                    params.chain_commit_epoch,
                    live_deadline.challenge
                ));
            }
            if params.chain_commit_epoch >= current_epoch {
                return Err(actor_error!(
                    illegal_argument,
                    "chain commit epoch {} must be less than the current epoch ({})",
                    params.chain_commit_epoch,
                    current_epoch
                ));
            }
            let commit_rand = rt.get_randomness_from_tickets(
                DomainSeparationTag::PoStChainCommit,
                params.chain_commit_epoch,
                &[],
            )?;
            if Randomness(commit_rand.into()) != params.chain_commit_rand {
                return Err(actor_error!(illegal_argument, "post commit randomness mismatched"));
            }

            let sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;
            let mut deadlines = state.load_deadlines(rt.store())?;
            let mut deadline = deadlines
                .load_deadline(rt.policy(), rt.store(), params.deadline)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("reading deadline {}", params.deadline)
                })?;

            let fault_horizon = live_deadline.last() + rt.policy().fault_max_age;
            let post_result = deadline
                .record_proven_sectors(
                    rt.store(),
                    &sectors,
                    info.sector_size,
                    live_deadline.quant_spec(),
                    fault_horizon,
                    &mut params.partitions,
                )
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("recording submission for deadline {}", params.deadline)
                })?;

            // A submission that proves nothing but newly-skipped sectors is
            // irrational (the skip fee exceeds the silent-miss outcome) and
            // rejected outright.
            if (&post_result.sectors - &post_result.ignored_sectors).is_empty() {
                return Err(actor_error!(
                    illegal_argument,
                    "post must cover at least one active sector"
                ));
            }

            if post_result.recovered_power.is_zero() {
                // Optimistic path: log the proof for later dispute.
                deadline
                    .log_proof(rt.store(), &post_result.partitions, &params.proofs)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "logging proof")?;
            } else {
                // Power is being restored; insist on a valid proof right now.
                let proof_sectors = sectors
                    .load_for_proof(&post_result.sectors, &post_result.ignored_sectors)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "assembling proof sector set")?;
                if !check_window_post(rt, live_deadline.challenge, &proof_sectors, params.proofs)
                    .map_err(|e| e.wrap("window post verification failed"))?
                {
                    return Err(actor_error!(illegal_argument, "submitted window post did not verify"));
                }
            }

            deadlines
                .update_deadline(rt.policy(), rt.store(), params.deadline, &deadline)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("writing deadline {}", params.deadline)
                })?;
            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            Ok(post_result)
        })?;

        // Power changes (activation, recoveries, skips) apply immediately
        // rather than waiting for the deadline close.
        notify_power_update(rt, post_result.power_delta)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Verifies an aggregated seal proof over a batch of pre-commitments and
    /// activates the survivors. An aggregation fee is burnt on top.
    fn prove_commit_aggregate<BS, RT>(
        rt: &mut RT,
        mut params: ProveCommitAggregateParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let sector_numbers = params
            .sector_numbers
            .validate()
            .map_err(|e| actor_error!(illegal_state, "invalid aggregate sector bitfield: {}", e))?;
        let batch_size = sector_numbers.len();

        {
            let policy = rt.policy();
            if batch_size > policy.max_aggregated_sectors {
                return Err(actor_error!(
                    illegal_argument,
                    "addressed {} sectors, limit {}",
                    batch_size,
                    policy.max_aggregated_sectors
                ));
            }
            if batch_size < policy.min_aggregated_sectors {
                return Err(actor_error!(
                    illegal_argument,
                    "addressed {} sectors, need at least {}",
                    batch_size,
                    policy.min_aggregated_sectors
                ));
            }
            if params.aggregate_proof.len() > policy.max_aggregated_proof_size {
                return Err(actor_error!(
                    illegal_argument,
                    "aggregate proof of {} bytes exceeds maximum {}",
                    params.aggregate_proof.len(),
                    policy.max_aggregated_proof_size
                ));
            }
        }

        let state: State = rt.state()?;
        let info = read_miner_info(rt.store(), &state)?;
        rt.validate_immediate_caller_is(
            info.control_addresses.iter().chain(&[info.worker, info.owner]),
        )?;

        let precommits = state
            .get_all_precommitted_sectors(rt.store(), sector_numbers)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading pre-commitments")?;
        if precommits.is_empty() {
            return Err(actor_error!(illegal_state, "no pre-commitments for aggregate"));
        }

        // One seal proof type governs the whole aggregate; expired
        // pre-commitments are dropped (their deposits forfeit later), the rest
        // must have passed their interactive challenge epoch.
        let seal_proof = precommits[0].info.seal_proof;
        let mut to_confirm = Vec::with_capacity(precommits.len());
        for precommit in &precommits {
            if precommit.info.seal_proof != seal_proof {
                return Err(actor_error!(
                    illegal_state,
                    "aggregate mixes seal proof types {} and {}",
                    i64::from(seal_proof),
                    i64::from(precommit.info.seal_proof)
                ));
            }

            let due = precommit.pre_commit_epoch
                + max_prove_commit_duration(rt.policy(), precommit.info.seal_proof).ok_or_else(
                    || {
                        actor_error!(
                            illegal_state,
                            "no commitment allowance for proof type {}",
                            i64::from(precommit.info.seal_proof)
                        )
                    },
                )?;
            if rt.curr_epoch() > due {
                warn!(
                    "skipping sector {}: commitment overdue since {}",
                    precommit.info.sector_number, due
                );
            } else {
                to_confirm.push(precommit.clone());
            }
        }

        let miner_id = own_actor_id(rt)?;
        let entropy = serialize_vec(&rt.message().receiver(), "seal challenge entropy")?;

        // CommDs are derived by the market from each sector's deal pieces.
        let commds = request_market_commds(
            rt,
            precommits
                .iter()
                .map(|p| ext::market::SectorDataSpec {
                    deal_ids: p.info.deal_ids.clone(),
                    sector_type: p.info.seal_proof,
                })
                .collect(),
        )?;

        let mut seal_infos = Vec::with_capacity(precommits.len());
        for (precommit, commd) in precommits.iter().zip(commds) {
            let interactive_epoch =
                precommit.pre_commit_epoch + rt.policy().pre_commit_challenge_delay;
            if rt.curr_epoch() <= interactive_epoch {
                return Err(actor_error!(
                    forbidden,
                    "too early to prove sector {}",
                    precommit.info.sector_number
                ));
            }

            let seal_rand = rt.get_randomness_from_tickets(
                DomainSeparationTag::SealRandomness,
                precommit.info.seal_rand_epoch,
                &entropy,
            )?;
            let interactive_rand = rt.get_randomness_from_beacon(
                DomainSeparationTag::InteractiveSealChallengeSeed,
                interactive_epoch,
                &entropy,
            )?;

            seal_infos.push(AggregateSealVerifyInfo {
                sector_number: precommit.info.sector_number,
                randomness: Randomness(seal_rand.into()),
                interactive_randomness: Randomness(interactive_rand.into()),
                sealed_cid: precommit.info.sealed_cid,
                unsealed_cid: commd,
            });
        }

        rt.verify_aggregate_seals(&AggregateSealVerifyProofAndInfos {
            miner: miner_id,
            seal_proof,
            aggregate_proof: RegisteredAggregateProof::SnarkPackV1,
            proof: std::mem::take(&mut params.aggregate_proof),
            infos: seal_infos,
        })
        .context_code(ExitCode::USR_ILLEGAL_ARGUMENT, "aggregate seal verify failed")?;

        let reward = request_reward_stats(rt)?;
        let power = request_power_stats(rt)?;
        let confirmed_count = to_confirm.len();
        activate_proven_sectors(
            rt,
            to_confirm,
            &reward.this_epoch_baseline_power,
            &reward.this_epoch_reward_smoothed,
            &power.quality_adj_power_smoothed,
        )?;

        // Charge the aggregation fee; activation above changed state, so
        // re-read for the balance check.
        let state: State = rt.state()?;
        let fee = aggregate_prove_commit_network_fee(confirmed_count as i64, &rt.base_fee());
        let unlocked = state
            .get_unlocked_balance(&rt.current_balance())
            .context_code(ExitCode::USR_ILLEGAL_STATE, "computing unlocked balance")?;
        if unlocked < fee {
            return Err(actor_error!(
                insufficient_funds,
                "unlocked funds {} do not cover aggregation fee {}",
                unlocked,
                fee
            ));
        }
        burn(rt, fee)?;

        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Re-seals active no-deal sectors around new deal data. Individually
    /// invalid updates are skipped; proof failures after the skippable phase
    /// abort the batch.
    fn prove_replica_updates<BS, RT>(
        rt: &mut RT,
        params: ProveReplicaUpdatesParams,
    ) -> Result<BitField, ActorError>
    where
        // The sector table is consulted between transactions, so the store
        // handle must be clonable.
        BS: Blockstore + Clone,
        RT: Runtime<BS>,
    {
        if params.updates.len() > rt.policy().prove_replica_updates_max_size {
            return Err(actor_error!(
                illegal_argument,
                "too many updates ({} > {})",
                params.updates.len(),
                rt.policy().prove_replica_updates_max_size
            ));
        }

        let state: State = rt.state()?;
        let info = read_miner_info(rt.store(), &state)?;
        rt.validate_immediate_caller_is(
            info.control_addresses.iter().chain(&[info.owner, info.worker]),
        )?;

        let store = rt.store().clone();
        let mut sectors = Sectors::load(&store, &state.sectors)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

        struct ScreenedUpdate<'a> {
            update: &'a ReplicaUpdate,
            sector: SectorOnChainInfo,
        }

        // Screening phase: anything wrong with an individual update drops it
        // (with a log line), it does not fail the batch. Deals are activated
        // here, so a dropped update has no market side effects.
        let mut screened = Vec::<ScreenedUpdate>::new();
        let mut seen = BitField::new();
        for update in params.updates.iter() {
            let sector_number = update.sector_number;
            let drop = |why: &str| info!("skipping sector {}: {}", sector_number, why);

            if seen.get(sector_number) {
                drop("duplicate update");
                continue;
            }
            seen.set(sector_number);

            if update.deals.is_empty() {
                drop("update carries no deals");
                continue;
            }
            if update.deals.len() as u64 > sector_deals_max(info.sector_size) {
                drop("too many deals");
                continue;
            }
            if update.replica_proof.len() > 4096 {
                drop("replica proof too large");
                continue;
            }
            if update.deadline >= rt.policy().wpost_period_deadlines {
                drop("deadline out of range");
                continue;
            }
            if !is_sealed_sector(&update.new_sealed_cid) {
                drop("new sealed CID has wrong prefix");
                continue;
            }
            if !deadline_is_mutable(
                rt.policy(),
                state.current_proving_period_start(rt.policy(), rt.curr_epoch()),
                update.deadline,
                rt.curr_epoch(),
            ) {
                drop("deadline is being challenged");
                continue;
            }
            match state.check_sector_active(
                rt.policy(),
                rt.store(),
                update.deadline,
                update.partition,
                sector_number,
                true,
            ) {
                Ok(true) => {}
                Ok(false) => {
                    drop("sector is not active");
                    continue;
                }
                Err(_) => {
                    return Err(actor_error!(illegal_argument, "error checking sector health"));
                }
            }
            let sector = match sectors.must_get(sector_number) {
                Ok(s) => s,
                Err(_) => {
                    drop("sector info unavailable");
                    continue;
                }
            };
            if !sector.deal_ids.is_empty() {
                drop("sector already carries deals");
                continue;
            }

            let activated = rt.send(
                &STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ACTIVATE_DEALS_METHOD,
                RawBytes::serialize(ext::market::ActivateDealsParams {
                    deal_ids: update.deals.clone(),
                    sector_expiry: sector.expiration,
                })?,
                TokenAmount::zero(),
            );
            if let Err(e) = activated {
                drop(&format!("deal activation failed: {}", e.msg()));
                continue;
            }

            screened.push(ScreenedUpdate { update, sector });
        }

        if screened.is_empty() {
            return Err(actor_error!(illegal_argument, "no usable replica updates"));
        }

        // From here on, failures abort the whole batch.

        let deal_weights = request_market_deal_weights(
            rt,
            screened
                .iter()
                .map(|s| ext::market::SectorDeals {
                    deal_ids: s.update.deals.clone(),
                    sector_expiry: s.sector.expiration,
                })
                .collect(),
        )?;
        if deal_weights.sectors.len() != screened.len() {
            return Err(actor_error!(
                illegal_state,
                "market returned {} weights for {} sectors",
                deal_weights.sectors.len(),
                screened.len()
            ));
        }
        let commds = request_market_commds(
            rt,
            screened
                .iter()
                .map(|s| ext::market::SectorDataSpec {
                    deal_ids: s.update.deals.clone(),
                    sector_type: s.sector.seal_proof,
                })
                .collect(),
        )?;

        let reward = request_reward_stats(rt)?;
        let power = request_power_stats(rt)?;

        // Group by deadline so each deadline is loaded and saved once.
        let mut by_deadline = BTreeMap::<u64, Vec<usize>>::new();
        for (i, s) in screened.iter().enumerate() {
            by_deadline.entry(s.update.deadline).or_default().push(i);
        }

        let mut total_power_delta = PowerPair::zero();
        let mut total_pledge_delta = TokenAmount::zero();

        let succeeded = rt.transaction(|state: &mut State, rt| {
            let mut deadlines = state.load_deadlines(rt.store())?;
            let mut succeeded = Vec::<SectorNumber>::with_capacity(screened.len());
            let mut replacements = Vec::<SectorOnChainInfo>::with_capacity(screened.len());

            for (&deadline_idx, members) in &by_deadline {
                let mut deadline = deadlines
                    .load_deadline(rt.policy(), rt.store(), deadline_idx)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("reading deadline {}", deadline_idx)
                    })?;
                let mut partitions = deadline
                    .partitions_amt(rt.store())
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "opening partitions")?;
                let quant = state.quant_spec_for_deadline(rt.policy(), deadline_idx);

                for &i in members {
                    let ScreenedUpdate { update, sector } = &screened[i];

                    let update_proof_type = sector
                        .seal_proof
                        .registered_update_proof()
                        .context_code(ExitCode::USR_ILLEGAL_STATE, "update proof for seal type")?;
                    if update.update_proof_type != update_proof_type {
                        return Err(actor_error!(
                            illegal_argument,
                            "unsupported update proof type {}",
                            i64::from(update.update_proof_type)
                        ));
                    }

                    rt.verify_replica_update(&ReplicaUpdateInfo {
                        update_proof_type,
                        new_sealed_cid: update.new_sealed_cid,
                        old_sealed_cid: sector.sealed_cid,
                        new_unsealed_cid: commds[i],
                        proof: update.replica_proof.clone(),
                    })
                    .with_context_code(ExitCode::USR_ILLEGAL_ARGUMENT, || {
                        format!("replica proof failed for sector {}", sector.sector_number)
                    })?;

                    // The replacement keeps the commitment window but restarts
                    // its life: new data, new weights, re-priced pledge.
                    let mut replacement = sector.clone();
                    replacement.sealed_cid = update.new_sealed_cid;
                    replacement.sector_key_cid = replacement.sector_key_cid.or(Some(sector.sealed_cid));
                    replacement.deal_ids = update.deals.clone();
                    replacement.activation = rt.curr_epoch();
                    replacement.deal_weight = deal_weights.sectors[i].deal_weight.clone();
                    replacement.verified_deal_weight =
                        deal_weights.sectors[i].verified_deal_weight.clone();
                    replacement.replaced_day_reward = sector.expected_day_reward.clone();
                    replacement.replaced_sector_age =
                        ChainEpoch::max(0, rt.curr_epoch() - sector.activation);

                    let duration = replacement.expiration - replacement.activation;
                    let qa_power = qa_power_for_weight(
                        info.sector_size,
                        duration,
                        &replacement.deal_weight,
                        &replacement.verified_deal_weight,
                    );
                    replacement.expected_day_reward = expected_reward_for_power(
                        &reward.this_epoch_reward_smoothed,
                        &power.quality_adj_power_smoothed,
                        &qa_power,
                        EPOCHS_IN_DAY,
                    );
                    replacement.expected_storage_pledge = expected_reward_for_power(
                        &reward.this_epoch_reward_smoothed,
                        &power.quality_adj_power_smoothed,
                        &qa_power,
                        INITIAL_PLEDGE_PROJECTION_PERIOD,
                    );

                    // Pledge never decreases on update; any increase is drawn
                    // from unlocked balance.
                    let repriced_pledge = initial_pledge_for_power(
                        &qa_power,
                        &reward.this_epoch_baseline_power,
                        &reward.this_epoch_reward_smoothed,
                        &power.quality_adj_power_smoothed,
                        &rt.total_fil_circ_supply(),
                    );
                    if repriced_pledge > sector.initial_pledge {
                        let shortfall = &repriced_pledge - &sector.initial_pledge;
                        let unlocked = state
                            .get_unlocked_balance(&rt.current_balance())
                            .context_code(ExitCode::USR_ILLEGAL_STATE, "computing unlocked balance")?;
                        if unlocked < shortfall {
                            return Err(actor_error!(
                                insufficient_funds,
                                "pledge top-up {} exceeds unlocked funds {} for sector {}",
                                shortfall,
                                unlocked,
                                sector.sector_number
                            ));
                        }
                        state
                            .add_initial_pledge(&shortfall)
                            .context_code(ExitCode::USR_ILLEGAL_STATE, "adding pledge")?;
                        total_pledge_delta += &shortfall;
                        replacement.initial_pledge = repriced_pledge;
                    }

                    let mut partition = partitions
                        .get(update.partition)
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!("reading partition {}", update.partition)
                        })?
                        .cloned()
                        .ok_or_else(|| {
                            actor_error!(
                                not_found,
                                "no deadline {} partition {}",
                                deadline_idx,
                                update.partition
                            )
                        })?;

                    let (power_delta, pledge_delta) = partition
                        .replace_sectors(
                            rt.store(),
                            std::slice::from_ref(sector),
                            std::slice::from_ref(&replacement),
                            info.sector_size,
                            quant,
                        )
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!(
                                "replacing sector in deadline {} partition {}",
                                deadline_idx, update.partition
                            )
                        })?;
                    total_power_delta += &power_delta;
                    total_pledge_delta += &pledge_delta;

                    partitions.set(update.partition, partition).with_context_code(
                        ExitCode::USR_ILLEGAL_STATE,
                        || format!("writing partition {}", update.partition),
                    )?;

                    succeeded.push(replacement.sector_number);
                    replacements.push(replacement);
                }

                deadline.partitions = partitions
                    .flush()
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "writing partitions")?;
                deadlines
                    .update_deadline(rt.policy(), rt.store(), deadline_idx, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", deadline_idx)
                    })?;
            }

            if succeeded.len() != screened.len() {
                return Err(actor_error!(
                    illegal_state,
                    "processed {} updates, expected {}",
                    succeeded.len(),
                    screened.len()
                ));
            }

            sectors
                .store(replacements)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing replacement sectors")?;
            state.sectors = sectors
                .amt
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing sector table")?;
            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            BitField::try_from_bits(succeeded)
                .map_err(|_| actor_error!(illegal_argument, "invalid sector number"))
        })?;

        notify_pledge_change(rt, &total_pledge_delta)?;
        notify_power_update(rt, total_power_delta)?;

        Ok(succeeded)
    }

    /// Challenges a logged (optimistically accepted) proof from the dispute
    /// window. If re-verification fails, the proof's active sectors become
    /// faults, the miner is penalized, and the reporter is paid from the
    /// penalty.
    fn dispute_windowed_post<BS, RT>(
        rt: &mut RT,
        params: DisputeWindowedPoStParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        let reporter = rt.message().caller();

        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {} of {}",
                params.deadline,
                rt.policy().wpost_period_deadlines
            ));
        }
        let current_epoch = rt.curr_epoch();

        // Estimates drift slightly between submission and dispute; they are
        // estimates either way.
        let reward = request_reward_stats(rt)?;
        let power = request_power_stats(rt)?;

        let (pledge_delta, mut to_burn, power_delta, to_reward) =
            rt.transaction(|state: &mut State, rt| {
                let policy = rt.policy();
                let live_deadline = state.deadline_info(policy, current_epoch);

                if !deadline_available_for_optimistic_post_dispute(
                    policy,
                    live_deadline.period_start,
                    params.deadline,
                    current_epoch,
                ) {
                    return Err(actor_error!(
                        forbidden,
                        "window post disputes are only accepted inside the dispute window \
                        ({} epochs following the close of the challenge window)",
                        policy.wpost_dispute_window
                    ));
                }

                let info = read_miner_info(rt.store(), state)?;

                // The disputed instance is the most recently closed one for
                // that index.
                let mut instance_period_start = live_deadline.period_start;
                if live_deadline.index < params.deadline {
                    instance_period_start -= policy.wpost_proving_period;
                }
                let disputed_deadline =
                    new_deadline_info(policy, instance_period_start, params.deadline, current_epoch);

                let mut deadlines = state.load_deadlines(rt.store())?;
                let mut deadline = deadlines
                    .load_deadline(policy, rt.store(), params.deadline)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "reading deadline")?;

                // Pulling the proof out of the snapshot makes a second dispute
                // of it impossible; a failed dispute aborts and rolls this back.
                let (proven_partitions, proofs) = deadline
                    .take_snapshot_proof(rt.store(), params.post_index)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "extracting proof for dispute")?;

                let dispute = deadline
                    .dispute_snapshot(rt.store(), proven_partitions)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "assembling dispute snapshot")?;

                let snapshot_sectors = Sectors::load(rt.store(), &deadline.sectors_snapshot)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sectors snapshot")?;
                let proof_sectors = snapshot_sectors
                    .load_for_proof(&dispute.all_sectors, &dispute.ignored_sectors)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "assembling proof sector set")?;

                // The dispute succeeds exactly when the proof does NOT verify.
                if check_window_post(rt, disputed_deadline.challenge, &proof_sectors, proofs)? {
                    return Err(actor_error!(illegal_argument, "failed to dispute valid post"));
                }
                info!("successful dispute: logged window post was invalid");

                // Fault the proof's sectors. Compaction is barred during the
                // dispute window, so the partitions are where the snapshot
                // says; terminated sectors are skipped naturally.
                let mut targets = dispute.targets;
                let fault_horizon = disputed_deadline.last() + policy.fault_max_age;
                let power_delta = deadline
                    .record_faults(
                        rt.store(),
                        &snapshot_sectors,
                        info.sector_size,
                        quant_spec_for_deadline(policy, &disputed_deadline),
                        fault_horizon,
                        &mut targets,
                    )
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "faulting disputed sectors")?;

                deadlines
                    .update_deadline(policy, rt.store(), params.deadline, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", params.deadline)
                    })?;
                state
                    .save_deadlines(rt.store(), deadlines)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

                // Penalty: the invalid-proof projection on the disputed power,
                // plus the full reward target (so a reporter bounty cannot be
                // net-extracted from the miner's own fee).
                let base_penalty = pledge_penalty_for_invalid_windowpost(
                    &reward.this_epoch_reward_smoothed,
                    &power.quality_adj_power_smoothed,
                    &dispute.power.qa,
                );
                let reward_target =
                    reward_for_disputed_window_post(info.window_post_proof_type, dispute.power);
                state
                    .apply_penalty(&(&base_penalty + &reward_target))
                    .map_err(|e| actor_error!(illegal_state, "applying penalty: {}", e))?;

                let (from_vesting, from_balance) = state
                    .repay_partial_debt_in_priority_order(
                        rt.store(),
                        current_epoch,
                        &rt.current_balance(),
                    )
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying penalty")?;

                let paid = &from_vesting + &from_balance;
                let to_reward = std::cmp::min(&paid, &reward_target).clone();
                let to_burn = paid - &to_reward;
                Ok((-from_vesting, to_burn, power_delta, to_reward))
            })?;

        notify_power_update(rt, power_delta)?;
        if !to_reward.is_zero() {
            if let Err(e) = rt.send(&reporter, METHOD_SEND, RawBytes::default(), to_reward.clone())
            {
                error!("failed to send dispute reward: {}", e);
                to_burn += to_reward;
            }
        }
        burn(rt, to_burn)?;
        notify_pledge_change(rt, &pledge_delta)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Single-sector form of `PreCommitSectorBatch`.
    fn pre_commit_sector<BS, RT>(
        rt: &mut RT,
        params: PreCommitSectorParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        Self::pre_commit_sector_batch(rt, PreCommitSectorBatchParams { sectors: vec![params] })
    }

    /// Reserves sector numbers and stakes deposits for sectors the miner
    /// promises to prove. Deal weights are fetched from the market up front
    /// and recorded with the commitment.
    fn pre_commit_sector_batch<BS, RT>(
        rt: &mut RT,
        params: PreCommitSectorBatchParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let current_epoch = rt.curr_epoch();
        if params.sectors.is_empty() {
            return Err(actor_error!(illegal_argument, "batch contains no sectors"));
        }
        if params.sectors.len() > rt.policy().pre_commit_sector_batch_max_size {
            return Err(actor_error!(
                illegal_argument,
                "batch of {} too large, max {}",
                params.sectors.len(),
                rt.policy().pre_commit_sector_batch_max_size
            ));
        }

        // Per-sector validation happens before any state change or send.
        let mut sector_numbers = BitField::new();
        for precommit in &params.sectors {
            if sector_numbers.get(precommit.sector_number) {
                return Err(actor_error!(
                    illegal_argument,
                    "duplicate sector number {}",
                    precommit.sector_number
                ));
            }
            sector_numbers.set(precommit.sector_number);
            validate_pre_commit(rt.policy(), current_epoch, precommit)?;
        }

        let reward = request_reward_stats(rt)?;
        let power = request_power_stats(rt)?;
        let deal_weights = request_market_deal_weights(
            rt,
            params
                .sectors
                .iter()
                .map(|p| ext::market::SectorDeals {
                    deal_ids: p.deal_ids.clone(),
                    sector_expiry: p.expiration,
                })
                .collect(),
        )?;
        if deal_weights.sectors.len() != params.sectors.len() {
            return Err(actor_error!(
                illegal_state,
                "market returned {} weights for {} sectors",
                deal_weights.sectors.len(),
                params.sectors.len()
            ));
        }

        let mut fee_to_burn = TokenAmount::zero();
        let mut first_for_miner = false;
        rt.transaction(|state: &mut State, rt| {
            // A batch pays the aggregation fee, folded into fee debt so one
            // burn settles both.
            if params.sectors.len() > 1 {
                let batch_fee =
                    aggregate_pre_commit_network_fee(params.sectors.len() as i64, &rt.base_fee());
                state
                    .apply_penalty(&batch_fee)
                    .map_err(|e| actor_error!(illegal_state, "applying batch fee: {}", e))?;
            }

            // Available balance already nets out fee debt, so read it before
            // clearing the debt.
            let available = state
                .get_available_balance(&rt.current_balance())
                .map_err(|e| actor_error!(illegal_state, "computing available balance: {}", e))?;
            fee_to_burn = settle_debts_or_abort(rt, state)?;

            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;
            if consensus_fault_active(&info, current_epoch) {
                return Err(actor_error!(
                    forbidden,
                    "pre-commit not allowed during active consensus fault"
                ));
            }

            let mut records = Vec::with_capacity(params.sectors.len());
            let mut cleanups = Vec::with_capacity(params.sectors.len());
            let mut deposit_total = TokenAmount::zero();

            for (i, precommit) in params.sectors.iter().enumerate() {
                // The sector's seal type must imply this miner's post type.
                let implied_post_type = precommit
                    .seal_proof
                    .registered_window_post_proof()
                    .map_err(|_| {
                        actor_error!(
                            illegal_argument,
                            "no window post type for seal proof {}",
                            i64::from(precommit.seal_proof)
                        )
                    })?;
                if implied_post_type != info.window_post_proof_type {
                    return Err(actor_error!(
                        illegal_argument,
                        "seal proof implies post type {:?}, miner uses {:?}",
                        implied_post_type,
                        info.window_post_proof_type
                    ));
                }
                if precommit.deal_ids.len() as u64 > sector_deals_max(info.sector_size) {
                    return Err(actor_error!(
                        illegal_argument,
                        "too many deals for sector: {}",
                        precommit.deal_ids.len()
                    ));
                }

                // Deposit is priced from the sector's estimated QA power, as
                // if it activated right now.
                let weights = &deal_weights.sectors[i];
                let estimated_qa_power = qa_power_for_weight(
                    info.sector_size,
                    precommit.expiration - current_epoch,
                    &weights.deal_weight,
                    &weights.verified_deal_weight,
                );
                let deposit = pre_commit_deposit_for_power(
                    &reward.this_epoch_reward_smoothed,
                    &power.quality_adj_power_smoothed,
                    &estimated_qa_power,
                );
                deposit_total += &deposit;

                records.push(SectorPreCommitOnChainInfo {
                    info: precommit.clone(),
                    pre_commit_deposit: deposit,
                    pre_commit_epoch: current_epoch,
                    deal_weight: weights.deal_weight.clone(),
                    verified_deal_weight: weights.verified_deal_weight.clone(),
                });

                // The cleanup runs a grace period after the proof deadline,
                // so an aggregate proof arriving exactly on the deadline
                // still finds its pre-commitment.
                let allowance = max_prove_commit_duration(rt.policy(), precommit.seal_proof)
                    .ok_or_else(|| {
                        actor_error!(
                            illegal_argument,
                            "no commitment allowance for proof type {}",
                            i64::from(precommit.seal_proof)
                        )
                    })?;
                cleanups.push((
                    current_epoch + allowance + rt.policy().expired_pre_commit_clean_up_delay,
                    precommit.sector_number,
                ));
            }

            if available < deposit_total {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds {} for pre-commit deposit: {}",
                    available,
                    deposit_total
                ));
            }

            state
                .add_pre_commit_deposit(&deposit_total)
                .map_err(|e| actor_error!(illegal_state, "staking deposit: {}", e))?;
            state.allocate_sector_numbers(
                rt.store(),
                &sector_numbers,
                CollisionPolicy::DenyCollisions,
            )?;
            state
                .put_precommitted_sectors(rt.store(), records)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "recording pre-commitments")?;
            state
                .add_pre_commit_clean_ups(rt.policy(), rt.store(), cleanups)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "scheduling cleanups")?;

            first_for_miner = !state.deadline_cron_active;
            state.deadline_cron_active = true;
            Ok(())
        })?;

        burn(rt, fee_to_burn)?;
        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        // The first commitment ever wakes the deadline cron.
        if first_for_miner {
            let next_close = state.deadline_info(rt.policy(), current_epoch).last();
            enroll_cron_event(
                rt,
                next_close,
                CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
            )?;
        }
        Ok(())
    }

    /// Accepts a seal proof for one pre-committed sector and forwards it to
    /// the power actor for bulk verification; activation follows in
    /// `ConfirmSectorProofsValid` the same epoch.
    fn prove_commit_sector<BS, RT>(
        rt: &mut RT,
        params: ProveCommitSectorParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number greater than maximum"));
        }

        let state: State = rt.state()?;
        let precommit = state
            .get_precommitted_sector(rt.store(), params.sector_number)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("reading pre-commitment {}", params.sector_number)
            })?
            .ok_or_else(|| {
                actor_error!(not_found, "no pre-committed sector {}", params.sector_number)
            })?;

        let max_proof_size = precommit
            .info
            .seal_proof
            .proof_size()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "proof size for seal type")?;
        if params.proof.len() > max_proof_size {
            return Err(actor_error!(
                illegal_argument,
                "seal proof of {} bytes exceeds maximum {}",
                params.proof.len(),
                max_proof_size
            ));
        }

        let allowance =
            max_prove_commit_duration(rt.policy(), precommit.info.seal_proof).ok_or_else(|| {
                actor_error!(
                    illegal_state,
                    "no commitment allowance for proof type {:?}",
                    precommit.info.seal_proof
                )
            })?;
        let due = precommit.pre_commit_epoch + allowance;
        if rt.curr_epoch() > due {
            return Err(actor_error!(
                illegal_argument,
                "proof for sector {} arrived at {}, past its due epoch {}",
                params.sector_number,
                rt.curr_epoch(),
                due
            ));
        }

        let seal_info = build_seal_verify_info(rt, &precommit, params.proof.into())?;
        rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            RawBytes::serialize(&seal_info)?,
            TokenAmount::zero(),
        )?;
        Ok(())
    }

    /// Power actor callback after bulk seal verification: activates every
    /// surviving pre-commitment.
    fn confirm_sector_proofs_valid<BS, RT>(
        rt: &mut RT,
        params: ConfirmSectorProofsParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        // The power actor enforces this cap; log if it ever fails to.
        if params.sectors.len() > ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH {
            warn!(
                "power actor confirmed {} prove commits, limit is {}",
                params.sectors.len(),
                ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH
            );
        }

        let state: State = rt.state()?;
        // Pre-commitments that vanished (already proven, or cleaned up) are
        // skipped without failing the rest.
        let precommits = state
            .find_precommitted_sectors(rt.store(), &params.sectors)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading pre-commitments")?;

        activate_proven_sectors(
            rt,
            precommits,
            &params.reward_baseline_power,
            &params.reward_smoothed,
            &params.quality_adj_power_smoothed,
        )
    }

    fn check_sector_proven<BS, RT>(
        rt: &mut RT,
        params: CheckSectorProvenParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number beyond the allowed range"));
        }

        let state: State = rt.state()?;
        match state.get_sector(rt.store(), params.sector_number) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                Err(actor_error!(not_found, "sector {} not proven", params.sector_number))
            }
            Err(e) => Err(actor_error!(
                illegal_state,
                "reading sector {}: {}",
                params.sector_number,
                e
            )),
        }
    }
}

impl Actor {
    /// Pushes sector commitments to a later expiration. Deal weights scale by
    /// the un-served fraction of the old lifetime; power follows the weights.
    fn extend_sector_expiration<BS, RT>(
        rt: &mut RT,
        mut params: ExtendSectorExpirationParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        {
            let policy = rt.policy();
            if params.extensions.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many declarations {}, max {}",
                    params.extensions.len(),
                    policy.declarations_max
                ));
            }
        }

        // Bound the total sectors addressed across all declarations.
        let mut total_sectors: u64 = 0;
        for decl in &mut params.extensions {
            if decl.deadline >= rt.policy().wpost_period_deadlines {
                return Err(actor_error!(
                    illegal_argument,
                    "deadline {} out of range",
                    decl.deadline
                ));
            }
            let declared = decl.sectors.validate().map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "invalid sectors for deadline {} partition {}: {}",
                    decl.deadline,
                    decl.partition,
                    e
                )
            })?;
            total_sectors = total_sectors
                .checked_add(declared.len())
                .ok_or_else(|| actor_error!(illegal_argument, "sector count overflow"))?;
        }
        if total_sectors > rt.policy().addressed_sectors_max {
            return Err(actor_error!(
                illegal_argument,
                "too many sectors for declaration {}, max {}",
                total_sectors,
                rt.policy().addressed_sectors_max
            ));
        }

        let current_epoch = rt.curr_epoch();

        let (power_delta, pledge_delta) = rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let mut deadlines = state.load_deadlines(rt.store())?;
            let mut sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

            // Handle declarations deadline by deadline so each is loaded once.
            let mut by_deadline = BTreeMap::<u64, Vec<&ExpirationExtension>>::new();
            for decl in &params.extensions {
                by_deadline.entry(decl.deadline).or_default().push(decl);
            }

            let mut power_delta = PowerPair::zero();
            let mut pledge_delta = TokenAmount::zero();

            for (&deadline_idx, decls) in &by_deadline {
                let policy = rt.policy();
                let mut deadline = deadlines
                    .load_deadline(policy, rt.store(), deadline_idx)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("reading deadline {}", deadline_idx)
                    })?;
                let mut partitions = deadline
                    .partitions_amt(rt.store())
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "opening partitions")?;
                let quant = state.quant_spec_for_deadline(policy, deadline_idx);

                // The deadline's expiration queue needs to know about every
                // epoch the extended partitions now reach.
                let mut partitions_by_new_close = BTreeMap::<ChainEpoch, Vec<u64>>::new();

                for decl in decls {
                    let mut partition = partitions
                        .get(decl.partition)
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!("reading partition {}", decl.partition)
                        })?
                        .cloned()
                        .ok_or_else(|| {
                            actor_error!(
                                not_found,
                                "no deadline {} partition {}",
                                deadline_idx,
                                decl.partition
                            )
                        })?;

                    let old_sectors = sectors.load_sector(&decl.sectors)?;
                    let new_sectors = old_sectors
                        .iter()
                        .map(|sector| {
                            extend_sector_commitment(
                                rt.policy(),
                                current_epoch,
                                decl.new_expiration,
                                sector,
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?;

                    sectors.store(new_sectors.clone()).with_context_code(
                        ExitCode::USR_ILLEGAL_STATE,
                        || format!("writing extended sectors {:?}", decl.sectors),
                    )?;

                    let (partition_power_delta, partition_pledge_delta) = partition
                        .replace_sectors(
                            rt.store(),
                            &old_sectors,
                            &new_sectors,
                            info.sector_size,
                            quant,
                        )
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!("extending sectors in partition {}", decl.partition)
                        })?;

                    power_delta += &partition_power_delta;
                    // No repricing happens on extension, so this is expected
                    // to be zero; carry it anyway in case the partition ever
                    // reports one.
                    pledge_delta += partition_pledge_delta;

                    partitions.set(decl.partition, partition).with_context_code(
                        ExitCode::USR_ILLEGAL_STATE,
                        || format!("writing partition {}", decl.partition),
                    )?;

                    partitions_by_new_close
                        .entry(decl.new_expiration)
                        .or_default()
                        .push(decl.partition);
                }

                deadline.partitions = partitions
                    .flush()
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "writing partitions")?;

                for (epoch, partition_indexes) in partitions_by_new_close {
                    deadline
                        .add_expiration_partitions(rt.store(), epoch, &partition_indexes, quant)
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!("scheduling partitions at epoch {}", epoch)
                        })?;
                }

                deadlines
                    .update_deadline(policy, rt.store(), deadline_idx, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", deadline_idx)
                    })?;
            }

            state.sectors = sectors
                .amt
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing sector table")?;
            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            Ok((power_delta, pledge_delta))
        })?;

        notify_power_update(rt, power_delta)?;
        notify_pledge_change(rt, &pledge_delta)?;
        Ok(())
    }

    /// Terminates sectors now, ahead of their commitments, then drains as much
    /// of the resulting fee work as fits in one message. While any of that
    /// work is pending the miner cannot withdraw; calling this with no new
    /// declarations drains another batch.
    fn terminate_sectors<BS, RT>(
        rt: &mut RT,
        params: TerminateSectorsParams,
    ) -> Result<TerminateSectorsReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        // Note: unproven pre-commitments cannot be terminated here; they run
        // out on their own and forfeit the deposit.

        {
            let policy = rt.policy();
            if params.terminations.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many declarations when terminating sectors ({} > {})",
                    params.terminations.len(),
                    policy.declarations_max
                ));
            }
        }

        let mut declared = DeadlineSectorMap::new();
        for termination in params.terminations {
            declared
                .insert(
                    rt.policy(),
                    termination.deadline,
                    termination.partition,
                    termination.sectors,
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "bad termination declaration for deadline {} partition {}: {}",
                        termination.deadline,
                        termination.partition,
                        e
                    )
                })?;
        }
        declared
            .enforce_limits(rt.policy().addressed_partitions_max, rt.policy().addressed_sectors_max)
            .map_err(|e| actor_error!(illegal_argument, "cannot process requested parameters: {}", e))?;

        let (had_pending_terminations, power_delta) = rt.transaction(|state: &mut State, rt| {
            let had_pending_terminations = !state.early_terminations.is_empty();

            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let current_epoch = rt.curr_epoch();
            let period_start = state.current_proving_period_start(rt.policy(), current_epoch);
            let mut deadlines = state.load_deadlines(rt.store())?;
            let sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

            let mut power_delta = PowerPair::zero();
            for (deadline_idx, partition_sectors) in declared.iter() {
                // A deadline being challenged (or about to be) is frozen.
                if !deadline_is_mutable(rt.policy(), period_start, deadline_idx, current_epoch) {
                    return Err(actor_error!(
                        illegal_argument,
                        "termination not allowed in immutable deadline {}",
                        deadline_idx
                    ));
                }

                let mut deadline = deadlines
                    .load_deadline(rt.policy(), rt.store(), deadline_idx)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("reading deadline {}", deadline_idx)
                    })?;

                let removed_power = deadline
                    .terminate_sectors(
                        rt.policy(),
                        rt.store(),
                        &sectors,
                        current_epoch,
                        partition_sectors,
                        info.sector_size,
                        state.quant_spec_for_deadline(rt.policy(), deadline_idx),
                    )
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("terminating sectors in deadline {}", deadline_idx)
                    })?;

                state.early_terminations.set(deadline_idx);
                power_delta -= &removed_power;

                deadlines
                    .update_deadline(rt.policy(), rt.store(), deadline_idx, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", deadline_idx)
                    })?;
            }

            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            Ok((had_pending_terminations, power_delta))
        })?;

        // Drain what fits now; if more remains and no cron was already going
        // to handle it, enroll one for the next epoch.
        let reward = request_reward_stats(rt)?;
        let power = request_power_stats(rt)?;
        let more = drain_early_terminations(
            rt,
            &reward.this_epoch_reward_smoothed,
            &power.quality_adj_power_smoothed,
        )?;
        if more && !had_pending_terminations {
            schedule_termination_work(rt)?;
        }

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        notify_power_update(rt, power_delta)?;
        Ok(TerminateSectorsReturn { done: !more })
    }

    /// Declares sectors faulty ahead of a missed proof. Power drops now; the
    /// fee falls due at the deadline close.
    fn declare_faults<BS, RT>(rt: &mut RT, params: DeclareFaultsParams) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        {
            let policy = rt.policy();
            if params.faults.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "fault declarations {} exceed the per-message limit {}",
                    params.faults.len(),
                    policy.declarations_max
                ));
            }
        }

        let mut declared = DeadlineSectorMap::new();
        for fault in params.faults {
            declared
                .insert(rt.policy(), fault.deadline, fault.partition, fault.sectors)
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "bad fault declaration for deadline {} partition {}: {}",
                        fault.deadline,
                        fault.partition,
                        e
                    )
                })?;
        }
        declared
            .enforce_limits(rt.policy().addressed_partitions_max, rt.policy().addressed_sectors_max)
            .map_err(|e| actor_error!(illegal_argument, "cannot process requested parameters: {}", e))?;

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let current_epoch = rt.curr_epoch();
            let period_start = state.current_proving_period_start(rt.policy(), current_epoch);
            let mut deadlines = state.load_deadlines(rt.store())?;
            let sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

            let mut power_delta = PowerPair::zero();
            for (deadline_idx, partition_sectors) in declared.iter() {
                let target =
                    declaration_deadline(rt.policy(), period_start, deadline_idx, current_epoch)?;

                let mut deadline = deadlines
                    .load_deadline(rt.policy(), rt.store(), deadline_idx)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("reading deadline {}", deadline_idx)
                    })?;

                power_delta += &deadline
                    .record_faults(
                        rt.store(),
                        &sectors,
                        info.sector_size,
                        target.quant_spec(),
                        target.last() + rt.policy().fault_max_age,
                        partition_sectors,
                    )
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("declaring faults in deadline {}", deadline_idx)
                    })?;

                deadlines
                    .update_deadline(rt.policy(), rt.store(), deadline_idx, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", deadline_idx)
                    })?;
            }

            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            Ok(power_delta)
        })?;

        // Surrender the power immediately rather than waiting for the close.
        notify_power_update(rt, power_delta)?;
        Ok(())
    }

    /// Promises that declared faults will prove at their next window. Power
    /// returns only when that proof lands. Requires all debts settled, and is
    /// barred during an active consensus fault.
    fn declare_faults_recovered<BS, RT>(
        rt: &mut RT,
        params: DeclareFaultsRecoveredParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        {
            let policy = rt.policy();
            if params.recoveries.len() as u64 > policy.declarations_max {
                return Err(actor_error!(
                    illegal_argument,
                    "recovery declarations {} exceed the per-message limit {}",
                    params.recoveries.len(),
                    policy.declarations_max
                ));
            }
        }

        let mut declared = DeadlineSectorMap::new();
        for recovery in params.recoveries {
            declared
                .insert(rt.policy(), recovery.deadline, recovery.partition, recovery.sectors)
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "bad recovery declaration for deadline {} partition {}: {}",
                        recovery.deadline,
                        recovery.partition,
                        e
                    )
                })?;
        }
        declared
            .enforce_limits(rt.policy().addressed_partitions_max, rt.policy().addressed_sectors_max)
            .map_err(|e| actor_error!(illegal_argument, "cannot process requested parameters: {}", e))?;

        let fee_to_burn = rt.transaction(|state: &mut State, rt| {
            // Recovery requires a clean slate: all outstanding debt is paid
            // now or the declaration aborts.
            let fee_to_burn = settle_debts_or_abort(rt, state)?;

            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;
            if consensus_fault_active(&info, rt.curr_epoch()) {
                return Err(actor_error!(
                    forbidden,
                    "recoveries forbidden during an active consensus fault"
                ));
            }

            let current_epoch = rt.curr_epoch();
            let period_start = state.current_proving_period_start(rt.policy(), current_epoch);
            let mut deadlines = state.load_deadlines(rt.store())?;
            let sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

            for (deadline_idx, partition_sectors) in declared.iter() {
                declaration_deadline(rt.policy(), period_start, deadline_idx, current_epoch)?;

                let mut deadline = deadlines
                    .load_deadline(rt.policy(), rt.store(), deadline_idx)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("reading deadline {}", deadline_idx)
                    })?;

                deadline
                    .declare_faults_recovered(rt.store(), &sectors, info.sector_size, partition_sectors)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("declaring recoveries in deadline {}", deadline_idx)
                    })?;

                deadlines
                    .update_deadline(rt.policy(), rt.store(), deadline_idx, &deadline)
                    .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                        format!("writing deadline {}", deadline_idx)
                    })?;
            }

            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;

            Ok(fee_to_burn)
        })?;

        burn(rt, fee_to_burn)?;
        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Compacts a deadline: the named partitions are dissolved, their dead
    /// sectors deleted for good, and their live sectors re-packed into fresh
    /// partitions. Power must come out exactly equal.
    fn compact_partitions<BS, RT>(
        rt: &mut RT,
        mut params: CompactPartitionsParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(illegal_argument, "invalid deadline {}", params.deadline));
        }
        let target_deadline = params.deadline;

        let partitions = params
            .partitions
            .validate()
            .map_err(|e| actor_error!(illegal_argument, "invalid partition bitfield: {}", e))?;

        rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            let current_epoch = rt.curr_epoch();
            if !deadline_available_for_compaction(
                policy,
                state.current_proving_period_start(policy, current_epoch),
                target_deadline,
                current_epoch,
            ) {
                return Err(actor_error!(
                    forbidden,
                    "deadline {} cannot be compacted during or just before its challenge window, \
                    nor within {} epochs of its last challenge window closing",
                    target_deadline,
                    policy.wpost_dispute_window
                ));
            }

            let partition_limit =
                load_partitions_sectors_max(policy, info.window_post_partition_sectors);
            if partitions.len() > partition_limit {
                return Err(actor_error!(
                    illegal_argument,
                    "too many partitions {}, limit {}",
                    partitions.len(),
                    partition_limit
                ));
            }

            let quant = state.quant_spec_for_deadline(policy, target_deadline);
            let mut deadlines = state.load_deadlines(rt.store())?;
            let mut deadline = deadlines
                .load_deadline(policy, rt.store(), target_deadline)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("reading deadline {}", target_deadline)
                })?;

            let (live, dead, removed_power) = deadline
                .remove_partitions(rt.store(), partitions, quant)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("dissolving partitions in deadline {}", target_deadline)
                })?;

            state
                .delete_sectors(rt.store(), &dead)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "deleting dead sectors")?;

            let survivors = state
                .load_sector_infos(rt.store(), &live)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "reading live sectors")?;
            let added_power = deadline
                .add_sectors(
                    rt.store(),
                    info.window_post_partition_sectors,
                    true, // already-proven sectors keep their power
                    &survivors,
                    info.sector_size,
                    quant,
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "re-packing live sectors")?;

            if removed_power != added_power {
                return Err(actor_error!(
                    illegal_state,
                    "partition compaction changed power: {:?} became {:?}",
                    removed_power,
                    added_power
                ));
            }

            deadlines
                .update_deadline(policy, rt.store(), target_deadline, &deadline)
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("writing deadline {}", target_deadline)
                })?;
            state
                .save_deadlines(rt.store(), deadlines)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "writing deadline index")?;
            Ok(())
        })
    }

    /// Masks never-used ranges out of the allocated sector-number bitfield so
    /// it stays small. Masked numbers can never be allocated afterwards.
    fn compact_sector_numbers<BS, RT>(
        rt: &mut RT,
        mut params: CompactSectorNumbersParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let mask = params
            .mask_sector_numbers
            .validate()
            .map_err(|e| actor_error!(illegal_argument, "mask bitfield malformed: {}", e))?;

        match mask.last() {
            None => return Err(actor_error!(illegal_argument, "invalid mask bitfield")),
            Some(last) if last > MAX_SECTOR_NUMBER => {
                return Err(actor_error!(
                    illegal_argument,
                    "masked sector number {} above the maximum",
                    last
                ));
            }
            _ => {}
        }

        rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            state.allocate_sector_numbers(rt.store(), mask, CollisionPolicy::AllowCollisions)
        })
    }

    /// Reward actor callback: locks the block reward on the vesting schedule
    /// and settles any penalty alongside.
    fn apply_rewards<BS, RT>(rt: &mut RT, params: ApplyRewardParams) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        if params.reward.is_negative() {
            return Err(actor_error!(illegal_argument, "cannot lock up a negative amount of funds"));
        }
        if params.penalty.is_negative() {
            return Err(actor_error!(illegal_argument, "cannot penalize a negative amount of funds"));
        }

        let (pledge_delta, to_burn) = rt.transaction(|state: &mut State, rt| {
            rt.validate_immediate_caller_is(iter::once(&REWARD_ACTOR_ADDR))?;

            let (to_lock, vest_spec) = locked_reward_from_reward(params.reward);

            // The reward rides along with this message, so this should only
            // fail if the reward actor short-sent.
            let unlocked = state
                .get_unlocked_balance(&rt.current_balance())
                .map_err(|e| actor_error!(illegal_state, "computing unlocked balance: {}", e))?;
            if unlocked < to_lock {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds to lock, available: {}, requested: {}",
                    unlocked,
                    to_lock
                ));
            }

            let newly_vested = state
                .add_locked_funds(rt.store(), rt.curr_epoch(), &to_lock, vest_spec)
                .map_err(|e| actor_error!(illegal_state, "locking reward: {}", e))?;
            let mut pledge_delta = &to_lock - &newly_vested;

            // Most penalties clear instantly out of the reward itself; the
            // rest becomes fee debt.
            state
                .apply_penalty(&params.penalty)
                .map_err(|e| actor_error!(illegal_state, "applying penalty: {}", e))?;
            let (from_vesting, from_balance) = state
                .repay_partial_debt_in_priority_order(
                    rt.store(),
                    rt.curr_epoch(),
                    &rt.current_balance(),
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying penalty")?;
            pledge_delta -= &from_vesting;

            Ok((pledge_delta, from_vesting + from_balance))
        })?;

        notify_pledge_change(rt, &pledge_delta)?;
        burn(rt, to_burn)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Accepts evidence of a consensus fault, penalizes the miner, pays the
    /// reporter a share, and bars the miner from certain operations for the
    /// ineligibility window. Only the first report of a fault sticks; later
    /// reports fall inside the window and are rejected.
    fn report_consensus_fault<BS, RT>(
        rt: &mut RT,
        params: ReportConsensusFaultParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        let reporter = rt.message().caller();

        let fault = rt
            .verify_consensus_fault(&params.header1, &params.header2, &params.header_extra)
            .context_code(ExitCode::USR_ILLEGAL_ARGUMENT, "fault not verified")?
            .ok_or_else(|| actor_error!(illegal_argument, "no consensus fault found"))?;
        if fault.target != rt.message().receiver() {
            return Err(actor_error!(
                illegal_argument,
                "fault by {} reported to miner {}",
                fault.target,
                rt.message().receiver()
            ));
        }
        if rt.curr_epoch() <= fault.epoch {
            return Err(actor_error!(
                illegal_argument,
                "fault epoch {} is ahead of the current epoch {}",
                fault.epoch,
                rt.curr_epoch()
            ));
        }

        let reward_stats = request_reward_stats(rt)?;
        let epoch_reward =
            TokenAmount::from_atto(reward_stats.this_epoch_reward_smoothed.estimate());
        let penalty_target = consensus_fault_penalty(epoch_reward.clone());
        let reporter_share = reward_for_consensus_slash_report(&epoch_reward);

        let (pledge_delta, to_burn, to_reward) = rt.transaction(|state: &mut State, rt| {
            let mut info = read_miner_info(rt.store(), state)?;

            // A fault predating the current exclusion window was already paid for.
            if fault.epoch < info.consensus_fault_elapsed {
                return Err(actor_error!(
                    forbidden,
                    "fault epoch {} too old, exclusion window ended at {}",
                    fault.epoch,
                    info.consensus_fault_elapsed
                ));
            }

            state
                .apply_penalty(&penalty_target)
                .map_err(|e| actor_error!(illegal_state, "applying penalty: {}", e))?;
            let (from_vesting, from_balance) = state
                .repay_partial_debt_in_priority_order(
                    rt.store(),
                    rt.curr_epoch(),
                    &rt.current_balance(),
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying penalty")?;

            // The reporter is paid out of what was actually collected.
            let collected = &from_vesting + &from_balance;
            let to_reward = std::cmp::min(&collected, &reporter_share).clone();
            let to_burn = collected - &to_reward;

            info.consensus_fault_elapsed =
                rt.curr_epoch() + rt.policy().consensus_fault_ineligibility_duration;
            state
                .save_info(rt.store(), &info)
                .context_code(ExitCode::USR_SERIALIZATION, "writing miner info")?;

            Ok((-from_vesting, to_burn, to_reward))
        })?;

        if let Err(e) = rt.send(&reporter, METHOD_SEND, RawBytes::default(), to_reward) {
            error!("failed to send reporter reward: {}", e);
        }
        burn(rt, to_burn)?;
        notify_pledge_change(rt, &pledge_delta)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Pays out available balance to the owner, settling debts first. Barred
    /// while early-termination fees are still pending.
    fn withdraw_balance<BS, RT>(
        rt: &mut RT,
        params: WithdrawBalanceParams,
    ) -> Result<WithdrawBalanceReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        if params.amount_requested.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "withdrawal amount {} is negative",
                params.amount_requested
            ));
        }

        let (owner, amount, newly_vested, fee_to_burn, state) =
            rt.transaction(|state: &mut State, rt| {
                let info = read_miner_info(rt.store(), state)?;
                // The balance belongs to the owner, not the worker.
                rt.validate_immediate_caller_is(iter::once(&info.owner))?;

                if !state.early_terminations.is_empty() {
                    return Err(actor_error!(
                        forbidden,
                        "cannot withdraw funds with termination fees outstanding across {} deadlines",
                        state.early_terminations.len()
                    ));
                }

                // Realize matured vesting so it can be paid out.
                let newly_vested = state
                    .unlock_vested_funds(rt.store(), rt.curr_epoch())
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "vesting funds")?;

                // Available balance nets out fee debt, so take the reading
                // before clearing the debt.
                let available = state
                    .get_available_balance(&rt.current_balance())
                    .map_err(|e| actor_error!(illegal_state, "computing available balance: {}", e))?;
                let fee_to_burn = settle_debts_or_abort(rt, state)?;

                let amount = std::cmp::min(&available, &params.amount_requested).clone();
                if amount.is_negative() {
                    return Err(actor_error!(illegal_state, "negative amount to withdraw: {}", amount));
                }

                Ok((info.owner, amount, newly_vested, fee_to_burn, state.clone()))
            })?;

        if amount.is_positive() {
            rt.send(&owner, METHOD_SEND, RawBytes::default(), amount.clone())?;
        }
        burn(rt, fee_to_burn)?;
        notify_pledge_change(rt, &-newly_vested)?;

        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(WithdrawBalanceReturn { amount_withdrawn: amount })
    }

    /// Voluntarily pays down fee debt from vesting funds and balance.
    fn repay_debt<BS, RT>(rt: &mut RT) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let (from_vesting, from_balance, state) = rt.transaction(|state: &mut State, rt| {
            let info = read_miner_info(rt.store(), state)?;
            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let (from_vesting, from_balance) = state
                .repay_partial_debt_in_priority_order(
                    rt.store(),
                    rt.curr_epoch(),
                    &rt.current_balance(),
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying debt")?;

            Ok((from_vesting, from_balance, state.clone()))
        })?;

        notify_pledge_change(rt, &-from_vesting.clone())?;
        burn(rt, from_vesting + from_balance)?;

        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Power actor cron dispatch. Payload selects between the deadline close
    /// handler and early-termination draining.
    fn on_deferred_cron_event<BS, RT>(
        rt: &mut RT,
        params: DeferredCronEventParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        let payload: CronEventPayload = from_slice(&params.event_payload).map_err(|e| {
            actor_error!(illegal_state, "unrecognized cron payload: {}", e)
        })?;

        match payload.event_type {
            CRON_EVENT_PROVING_DEADLINE => handle_proving_deadline(
                rt,
                &params.reward_smoothed,
                &params.quality_adj_power_smoothed,
            )?,
            CRON_EVENT_PROCESS_EARLY_TERMINATIONS => {
                if drain_early_terminations(
                    rt,
                    &params.reward_smoothed,
                    &params.quality_adj_power_smoothed,
                )? {
                    schedule_termination_work(rt)?;
                }
            }
            other => error!("ignoring cron event of unknown type {}", other),
        }

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }
}

//
// -- Cron handlers --
//

/// Deadline-close handler. Vests funds, finalizes any due worker rotation,
/// forfeits overdue pre-commit deposits, closes the recorded deadline
/// (detecting missed proofs and retiring due sectors), charges the
/// continued-fault fee, and re-enrolls itself while there is anything left to
/// watch.
fn handle_proving_deadline<BS, RT>(
    rt: &mut RT,
    reward_smoothed: &FilterEstimate,
    quality_adj_power_smoothed: &FilterEstimate,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let current_epoch = rt.curr_epoch();

    let mut had_pending_terminations = false;
    let mut power_delta = PowerPair::zero();
    let mut pledge_delta = TokenAmount::zero();
    let mut to_burn = TokenAmount::zero();
    let mut keep_going = false;

    let state: State = rt.transaction(|state: &mut State, rt| {
        // Vest first, so penalties below draw on locked funds before any
        // freshly freed ones.
        let newly_vested = state
            .unlock_vested_funds(rt.store(), current_epoch)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "vesting funds")?;
        pledge_delta -= &newly_vested;

        let mut info = read_miner_info(rt.store(), state)?;
        apply_pending_worker_change(rt, &mut info, state)?;

        // Deposits of pre-commitments that never proved are forfeited through
        // the regular debt machinery.
        let forfeited = state
            .cleanup_expired_pre_commits(rt.policy(), rt.store(), current_epoch)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "cleaning up expired pre-commitments")?;
        state
            .apply_penalty(&forfeited)
            .map_err(|e| actor_error!(illegal_state, "applying forfeit: {}", e))?;

        // Remember whether termination work was already on somebody's plate,
        // to avoid double-scheduling it below.
        had_pending_terminations = !state.early_terminations.is_empty();

        let closed = state
            .advance_deadline(rt.policy(), rt.store(), current_epoch)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "advancing deadline")?;

        // Sectors that entered this close already faulty pay the continued
        // fault fee; faults detected by the close itself are fee-free this
        // once.
        let fault_fee = pledge_penalty_for_continued_fault(
            reward_smoothed,
            quality_adj_power_smoothed,
            &closed.previously_faulty_power.qa,
        );
        state
            .apply_penalty(&fault_fee)
            .map_err(|e| actor_error!(illegal_state, "applying fault fee: {}", e))?;

        power_delta += &closed.power_delta;
        pledge_delta += &closed.pledge_delta;

        let (from_vesting, from_balance) = state
            .repay_partial_debt_in_priority_order(rt.store(), current_epoch, &rt.current_balance())
            .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying penalties")?;
        to_burn = &from_vesting + &from_balance;
        pledge_delta -= &from_vesting;

        keep_going = state
            .continue_deadline_cron(rt.policy(), rt.store())
            .context_code(ExitCode::USR_ILLEGAL_STATE, "checking for remaining cron work")?;
        if !keep_going {
            state.deadline_cron_active = false;
        }

        Ok(state.clone())
    })?;

    notify_power_update(rt, power_delta)?;
    burn(rt, to_burn)?;
    notify_pledge_change(rt, &pledge_delta)?;

    if keep_going {
        let next_close = state.deadline_info(rt.policy(), current_epoch + 1).last();
        enroll_cron_event(
            rt,
            next_close,
            CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
        )?;
    } else {
        info!("miner {} has nothing left to watch, deadline cron lapsing", rt.message().receiver());
    }

    // If the close produced the first pending terminations, start working
    // through them; an already-scheduled handler would have processed its
    // quota this epoch anyway.
    if !had_pending_terminations && !state.early_terminations.is_empty() {
        if drain_early_terminations(rt, reward_smoothed, quality_adj_power_smoothed)? {
            schedule_termination_work(rt)?;
        }
    }

    Ok(())
}

/// Works through one message's worth of queued early terminations: assesses
/// the per-sector fee, releases pledges, settles deals, and burns what's owed.
/// Fees are priced at the current reward and power estimates rather than those
/// at the epoch of termination; the difference is accepted as noise.
/// Returns whether more work remains queued.
fn drain_early_terminations<BS, RT>(
    rt: &mut RT,
    reward_smoothed: &FilterEstimate,
    quality_adj_power_smoothed: &FilterEstimate,
) -> Result<bool, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let (drained, more, deals_by_epoch, to_burn, pledge_delta) =
        rt.transaction(|state: &mut State, rt| {
            let policy = rt.policy();

            let (drained, more) = state
                .pop_early_terminations(
                    policy,
                    rt.store(),
                    policy.addressed_partitions_max,
                    policy.addressed_sectors_max,
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "draining terminations")?;

            // Plausible no-op: an explicit TerminateSectors call may have
            // emptied the queue before this cron fired.
            if drained.is_empty() {
                info!("nothing in the early termination queue");
                return Ok((drained, more, Vec::new(), TokenAmount::zero(), TokenAmount::zero()));
            }

            let info = read_miner_info(rt.store(), state)?;
            let sectors = Sectors::load(rt.store(), &state.sectors)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "opening sector table")?;

            let mut fee = TokenAmount::zero();
            let mut released_pledge = TokenAmount::zero();
            let mut deals_by_epoch = Vec::<(ChainEpoch, Vec<DealID>)>::new();

            for (epoch, sector_numbers) in drained.iter() {
                let infos = sectors.load_sector(sector_numbers)?;

                fee += termination_penalty(
                    info.sector_size,
                    epoch,
                    reward_smoothed,
                    quality_adj_power_smoothed,
                    &infos,
                );

                let mut deal_ids = Vec::new();
                for sector in infos {
                    released_pledge += sector.initial_pledge;
                    deal_ids.extend(sector.deal_ids);
                }
                deals_by_epoch.push((epoch, deal_ids));
            }

            state
                .apply_penalty(&fee)
                .map_err(|e| actor_error!(illegal_state, "applying termination fee: {}", e))?;

            let mut pledge_delta = -released_pledge.clone();
            state
                .add_initial_pledge(&pledge_delta)
                .map_err(|e| actor_error!(illegal_state, "releasing pledge: {}", e))?;

            let (from_vesting, from_balance) = state
                .repay_partial_debt_in_priority_order(
                    rt.store(),
                    rt.curr_epoch(),
                    &rt.current_balance(),
                )
                .context_code(ExitCode::USR_ILLEGAL_STATE, "repaying termination fee")?;
            let to_burn = &from_vesting + &from_balance;
            pledge_delta -= &from_vesting;

            Ok((drained, more, deals_by_epoch, to_burn, pledge_delta))
        })?;

    if drained.is_empty() {
        return Ok(more);
    }

    log::debug!("miner {} paying {} for terminated sectors", rt.message().receiver(), to_burn);
    burn(rt, to_burn)?;
    notify_pledge_change(rt, &pledge_delta)?;
    for (epoch, deal_ids) in deals_by_epoch {
        terminate_market_deals(rt, epoch, deal_ids)?;
    }

    Ok(more)
}

//
// -- Sector activation --
//

/// Turns verified pre-commitments into live sectors: activates their deals
/// (dropping sectors whose deals fail), prices the initial pledge, assigns the
/// sectors to deadlines, and swaps deposits for pledge.
fn activate_proven_sectors<BS, RT>(
    rt: &mut RT,
    precommits: Vec<SectorPreCommitOnChainInfo>,
    baseline_power: &BigInt,
    reward_smoothed: &FilterEstimate,
    quality_adj_power_smoothed: &FilterEstimate,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let activation_epoch = rt.curr_epoch();
    let circulating_supply = rt.total_fil_circ_supply();

    // Deal activation happens per sector so one bad sector cannot poison the
    // batch; a sector whose deals won't activate is simply left behind for
    // pre-commit cleanup.
    let mut activated = Vec::with_capacity(precommits.len());
    for precommit in precommits {
        if !precommit.info.deal_ids.is_empty() {
            let sent = rt.send(
                &STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ACTIVATE_DEALS_METHOD,
                RawBytes::serialize(ext::market::ActivateDealsParams {
                    deal_ids: precommit.info.deal_ids.clone(),
                    sector_expiry: precommit.info.expiration,
                })?,
                TokenAmount::zero(),
            );
            if let Err(e) = sent {
                info!(
                    "dropping sector {}: deal activation failed: {}",
                    precommit.info.sector_number,
                    e.msg()
                );
                continue;
            }
        }
        activated.push(precommit);
    }

    if activated.is_empty() {
        return Err(actor_error!(illegal_argument, "all prove commits failed to validate"));
    }

    let total_pledge = rt.transaction(|state: &mut State, rt| {
        let info = read_miner_info(rt.store(), state)?;

        let mut new_sectors = Vec::with_capacity(activated.len());
        let mut deposit_to_return = TokenAmount::zero();
        let mut total_pledge = TokenAmount::zero();

        for precommit in activated {
            let duration = precommit.info.expiration - activation_epoch;
            // Re-checked because a long wait before confirmation can shrink
            // the lifetime below the floor; drop rather than poison the batch.
            if duration < rt.policy().min_sector_expiration {
                warn!(
                    "dropping sector {}: remaining lifetime {} below minimum",
                    precommit.info.sector_number, duration
                );
                continue;
            }

            let qa_power = qa_power_for_weight(
                info.sector_size,
                duration,
                &precommit.deal_weight,
                &precommit.verified_deal_weight,
            );
            let day_reward = expected_reward_for_power(
                reward_smoothed,
                quality_adj_power_smoothed,
                &qa_power,
                EPOCHS_IN_DAY,
            );
            // Recorded for termination-fee assessment; intentionally not
            // subject to the pledge cap.
            let storage_pledge = expected_reward_for_power(
                reward_smoothed,
                quality_adj_power_smoothed,
                &qa_power,
                INITIAL_PLEDGE_PROJECTION_PERIOD,
            );
            let initial_pledge = initial_pledge_for_power(
                &qa_power,
                baseline_power,
                reward_smoothed,
                quality_adj_power_smoothed,
                &circulating_supply,
            );

            deposit_to_return += &precommit.pre_commit_deposit;
            total_pledge += &initial_pledge;

            new_sectors.push(SectorOnChainInfo {
                sector_number: precommit.info.sector_number,
                seal_proof: precommit.info.seal_proof,
                sealed_cid: precommit.info.sealed_cid,
                deal_ids: precommit.info.deal_ids,
                activation: activation_epoch,
                expiration: precommit.info.expiration,
                deal_weight: precommit.deal_weight,
                verified_deal_weight: precommit.verified_deal_weight,
                initial_pledge,
                expected_day_reward: day_reward,
                expected_storage_pledge: storage_pledge,
                replaced_sector_age: 0,
                replaced_day_reward: TokenAmount::zero(),
                sector_key_cid: None,
            });
        }

        let new_sector_numbers: Vec<SectorNumber> =
            new_sectors.iter().map(|s| s.sector_number).collect();

        state
            .put_sectors(rt.store(), new_sectors.clone())
            .context_code(ExitCode::USR_ILLEGAL_STATE, "writing new sectors")?;
        state
            .delete_precommitted_sectors(rt.store(), &new_sector_numbers)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "clearing pre-commitments")?;
        state
            .assign_sectors_to_deadlines(
                rt.policy(),
                rt.store(),
                activation_epoch,
                new_sectors,
                info.window_post_partition_sectors,
                info.sector_size,
            )
            .context_code(ExitCode::USR_ILLEGAL_STATE, "assigning sectors to deadlines")?;

        // The deposit comes back to the unlocked pool, from which the pledge
        // is locked in the same breath.
        state
            .add_pre_commit_deposit(&-deposit_to_return)
            .map_err(|e| actor_error!(illegal_state, "returning deposits: {}", e))?;

        let unlocked = state
            .get_unlocked_balance(&rt.current_balance())
            .map_err(|e| actor_error!(illegal_state, "computing unlocked balance: {}", e))?;
        if unlocked < total_pledge {
            return Err(actor_error!(
                insufficient_funds,
                "insufficient funds to cover aggregate initial pledge {}, available balance {}",
                total_pledge,
                unlocked
            ));
        }
        state
            .add_initial_pledge(&total_pledge)
            .map_err(|e| actor_error!(illegal_state, "locking pledge: {}", e))?;

        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        Ok(total_pledge)
    })?;

    notify_pledge_change(rt, &total_pledge)?;
    Ok(())
}

//
// -- Validation helpers --
//

/// Stateless checks on a single pre-commitment.
fn validate_pre_commit(
    policy: &Policy,
    current_epoch: ChainEpoch,
    precommit: &PreCommitSectorParams,
) -> Result<(), ActorError> {
    if !can_pre_commit_seal_proof(policy, precommit.seal_proof) {
        return Err(actor_error!(
            illegal_argument,
            "unsupported seal proof type {}",
            i64::from(precommit.seal_proof)
        ));
    }
    if precommit.sector_number > MAX_SECTOR_NUMBER {
        return Err(actor_error!(
            illegal_argument,
            "sector number {} outside 0..(2^63-1)",
            precommit.sector_number
        ));
    }
    if !is_sealed_sector(&precommit.sealed_cid) {
        return Err(actor_error!(illegal_argument, "sealed CID had wrong prefix"));
    }

    // Seal randomness must be drawn from the recent past, never the present.
    if precommit.seal_rand_epoch >= current_epoch {
        return Err(actor_error!(
            illegal_argument,
            "seal challenge epoch {} must be before now ({})",
            precommit.seal_rand_epoch,
            current_epoch
        ));
    }
    let oldest_acceptable = current_epoch - policy.max_pre_commit_randomness_lookback;
    if precommit.seal_rand_epoch < oldest_acceptable {
        return Err(actor_error!(
            illegal_argument,
            "seal challenge epoch {} too old, needs to be after {}",
            precommit.seal_rand_epoch,
            oldest_acceptable
        ));
    }

    // The lifetime floor is measured from the latest possible activation, so
    // a sector proving at the last minute still satisfies it.
    let latest_activation = current_epoch
        + max_prove_commit_duration(policy, precommit.seal_proof).unwrap_or_default();
    validate_sector_expiration(
        policy,
        current_epoch,
        latest_activation,
        precommit.expiration,
        precommit.seal_proof,
    )?;

    // The capacity-upgrade path through pre-commit is retired.
    if precommit.replace_capacity {
        return Err(actor_error!(
            forbidden,
            "cc upgrade through precommit discontinued, use ProveReplicaUpdates"
        ));
    }

    Ok(())
}

/// Checks a sector lifetime against the floor, the extension ceiling and the
/// proof type's maximum.
fn validate_sector_expiration(
    policy: &Policy,
    current_epoch: ChainEpoch,
    activation: ChainEpoch,
    expiration: ChainEpoch,
    seal_proof: RegisteredSealProof,
) -> Result<(), ActorError> {
    if expiration <= activation {
        return Err(actor_error!(
            illegal_argument,
            "sector expiration {} precedes activation {}",
            expiration,
            activation
        ));
    }
    if expiration - activation < policy.min_sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "expiration {} invalid, sector lifetime ({}) must exceed {} from activation {}",
            expiration,
            expiration - activation,
            policy.min_sector_expiration,
            activation
        ));
    }
    if expiration > current_epoch + policy.max_sector_expiration_extension {
        return Err(actor_error!(
            illegal_argument,
            "expiration {} invalid, cannot be more than {} beyond the current epoch {}",
            expiration,
            policy.max_sector_expiration_extension,
            current_epoch
        ));
    }
    let proof_lifetime_max = seal_proof_sector_maximum_lifetime(seal_proof).ok_or_else(|| {
        actor_error!(illegal_argument, "unrecognized seal proof type {:?}", seal_proof)
    })?;
    if expiration - activation > proof_lifetime_max {
        return Err(actor_error!(
            illegal_argument,
            "expiration {} invalid, sector lifetime ({}) is capped at {} from activation {}",
            expiration,
            expiration - activation,
            proof_lifetime_max,
            activation
        ));
    }
    Ok(())
}

/// Produces the extended copy of a sector, with deal weights scaled down to
/// the portion of the old lifetime not yet served.
fn extend_sector_commitment(
    policy: &Policy,
    current_epoch: ChainEpoch,
    new_expiration: ChainEpoch,
    sector: &SectorOnChainInfo,
) -> Result<SectorOnChainInfo, ActorError> {
    if !can_extend_seal_proof_type(sector.seal_proof) {
        return Err(actor_error!(
            forbidden,
            "cannot extend expiration for sector {} with unsupported seal type {:?}",
            sector.sector_number,
            sector.seal_proof
        ));
    }
    // A sector can linger past its expiration until its deadline closes; such
    // a sector is beyond extending.
    if sector.expiration < current_epoch {
        return Err(actor_error!(
            forbidden,
            "sector {} already expired at {}, cannot extend",
            sector.sector_number,
            sector.expiration
        ));
    }
    if new_expiration < sector.expiration {
        return Err(actor_error!(
            illegal_argument,
            "sector {} expiration {} would shorten current {}",
            sector.sector_number,
            new_expiration,
            sector.expiration
        ));
    }
    validate_sector_expiration(
        policy,
        current_epoch,
        sector.activation,
        new_expiration,
        sector.seal_proof,
    )?;

    let old_lifetime = BigInt::from(sector.expiration - sector.activation);
    let unserved = sector.expiration - current_epoch;

    let mut extended = sector.clone();
    extended.expiration = new_expiration;
    extended.deal_weight = (&sector.deal_weight * unserved).div_floor(&old_lifetime);
    extended.verified_deal_weight =
        (&sector.verified_deal_weight * unserved).div_floor(&old_lifetime);
    Ok(extended)
}

/// Resolves the target of a fault/recovery declaration to the next instance
/// of the deadline that can still accept it, enforcing the cutoff.
fn declaration_deadline(
    policy: &Policy,
    period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> Result<DeadlineInfo, ActorError> {
    if deadline_idx >= policy.wpost_period_deadlines {
        return Err(actor_error!(
            illegal_argument,
            "invalid declaration deadline {}, must be < {}",
            deadline_idx,
            policy.wpost_period_deadlines
        ));
    }

    let target = new_deadline_info(policy, period_start, deadline_idx, current_epoch)
        .next_not_elapsed();
    if target.fault_cutoff_passed() {
        return Err(actor_error!(
            illegal_argument,
            "late fault or recovery declaration for deadline {}",
            deadline_idx
        ));
    }
    Ok(target)
}

fn check_control_addresses(policy: &Policy, control_addrs: &[Address]) -> Result<(), ActorError> {
    if control_addrs.len() > policy.max_control_addresses {
        return Err(actor_error!(
            illegal_argument,
            "{} control addresses supplied, limit is {}",
            control_addrs.len(),
            policy.max_control_addresses
        ));
    }
    Ok(())
}

fn check_window_post_type(
    policy: &Policy,
    proof_type: fvm_shared::sector::RegisteredPoStProof,
) -> Result<(), ActorError> {
    if !policy.valid_post_proof_type.contains(&proof_type) {
        return Err(actor_error!(
            illegal_argument,
            "proof type {:?} not accepted for new miners",
            proof_type
        ));
    }
    Ok(())
}

fn check_peer_info(
    policy: &Policy,
    peer_id: &[u8],
    multiaddrs: &[BytesDe],
) -> Result<(), ActorError> {
    if peer_id.len() > policy.max_peer_id_length {
        return Err(actor_error!(
            illegal_argument,
            "peer ID of {} bytes exceeds the {} byte limit",
            peer_id.len(),
            policy.max_peer_id_length
        ));
    }

    let mut total = 0;
    for addr in multiaddrs {
        if addr.0.is_empty() {
            return Err(actor_error!(illegal_argument, "empty multiaddr rejected"));
        }
        total += addr.0.len();
    }
    if total > policy.max_multiaddr_data {
        return Err(actor_error!(
            illegal_argument,
            "multiaddrs of {} bytes exceed the {} byte limit",
            total,
            policy.max_multiaddr_data
        ));
    }
    Ok(())
}

fn consensus_fault_active(info: &MinerInfo, current_epoch: ChainEpoch) -> bool {
    // Inclusive: the bar lifts only once the current epoch passes the mark.
    current_epoch <= info.consensus_fault_elapsed
}

//
// -- Proof plumbing --
//

/// Re-derives the public inputs for a Window PoSt and asks the host to check
/// the proof. Returns whether it verifies (errors only on plumbing failures).
fn check_window_post<BS, RT>(
    rt: &RT,
    challenge_epoch: ChainEpoch,
    sectors: &[SectorOnChainInfo],
    proofs: Vec<PoStProof>,
) -> Result<bool, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let prover = match rt.message().receiver().payload() {
        Payload::ID(id) => *id,
        _ => {
            return Err(actor_error!(
                illegal_state,
                "runtime provided non-ID receiver {}",
                rt.message().receiver()
            ));
        }
    };

    let entropy = serialize(&rt.message().receiver(), "window post challenge entropy")?;
    let randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::WindowedPoStChallengeSeed,
        challenge_epoch,
        &entropy,
    )?;

    let verify_info = WindowPoStVerifyInfo {
        randomness: Randomness(randomness.into()),
        proofs,
        challenged_sectors: sectors
            .iter()
            .map(|s| SectorInfo {
                proof: s.seal_proof,
                sector_number: s.sector_number,
                sealed_cid: s.sealed_cid,
            })
            .collect(),
        prover,
    };

    Ok(rt.verify_post(&verify_info).is_ok())
}

/// Assembles a seal-verification request for one pre-commitment, fetching the
/// data commitment from the market.
fn build_seal_verify_info<BS, RT>(
    rt: &mut RT,
    precommit: &SectorPreCommitOnChainInfo,
    proof: Vec<u8>,
) -> Result<SealVerifyInfo, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let interactive_epoch = precommit.pre_commit_epoch + rt.policy().pre_commit_challenge_delay;
    if rt.curr_epoch() <= interactive_epoch {
        return Err(actor_error!(forbidden, "sector proof submitted too early"));
    }

    let commds = request_market_commds(
        rt,
        vec![ext::market::SectorDataSpec {
            deal_ids: precommit.info.deal_ids.clone(),
            sector_type: precommit.info.seal_proof,
        }],
    )?;

    let miner_id = own_actor_id(rt)?;
    let entropy = serialize(&rt.message().receiver(), "seal challenge entropy")?;
    let seal_rand = rt.get_randomness_from_tickets(
        DomainSeparationTag::SealRandomness,
        precommit.info.seal_rand_epoch,
        &entropy,
    )?;
    let interactive_rand = rt.get_randomness_from_beacon(
        DomainSeparationTag::InteractiveSealChallengeSeed,
        interactive_epoch,
        &entropy,
    )?;

    Ok(SealVerifyInfo {
        registered_proof: precommit.info.seal_proof,
        sector_id: SectorID { miner: miner_id, number: precommit.info.sector_number },
        deal_ids: precommit.info.deal_ids.clone(),
        interactive_randomness: Randomness(interactive_rand.into()),
        proof,
        randomness: Randomness(seal_rand.into()),
        sealed_cid: precommit.info.sealed_cid,
        unsealed_cid: commds[0],
    })
}

fn own_actor_id<BS, RT>(rt: &RT) -> Result<u64, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    match rt.message().receiver().payload() {
        Payload::ID(id) => Ok(*id),
        _ => Err(actor_error!(
            illegal_state,
            "runtime provided non-ID receiver {}",
            rt.message().receiver()
        )),
    }
}

//
// -- Outbound calls --
//

fn request_reward_stats<BS, RT>(rt: &mut RT) -> Result<ThisEpochRewardReturn, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let raw = rt
        .send(
            &REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            Default::default(),
            TokenAmount::zero(),
        )
        .map_err(|e| e.wrap("failed to fetch epoch baseline power"))?;
    deserialize(&raw, "epoch reward response")
}

fn request_power_stats<BS, RT>(
    rt: &mut RT,
) -> Result<ext::power::CurrentTotalPowerReturn, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let raw = rt
        .send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            Default::default(),
            TokenAmount::zero(),
        )
        .map_err(|e| e.wrap("failed to fetch current network power"))?;
    deserialize(&raw, "total power response")
}

/// Asks the market to validate the deals of each prospective sector and
/// report their weights. Skips the call entirely for deal-less batches.
fn request_market_deal_weights<BS, RT>(
    rt: &mut RT,
    sectors: Vec<ext::market::SectorDeals>,
) -> Result<ext::market::VerifyDealsForActivationReturn, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    if sectors.iter().all(|s| s.deal_ids.is_empty()) {
        return Ok(ext::market::VerifyDealsForActivationReturn {
            sectors: vec![Default::default(); sectors.len()],
        });
    }

    let raw = rt.send(
        &STORAGE_MARKET_ACTOR_ADDR,
        ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
        RawBytes::serialize(ext::market::VerifyDealsForActivationParamsRef { sectors: &sectors })?,
        TokenAmount::zero(),
    )?;
    deserialize(&raw, "verify deals for activation return")
}

/// Asks the market for the unsealed CID (CommD) of each sector's deal data.
fn request_market_commds<BS, RT>(
    rt: &mut RT,
    inputs: Vec<ext::market::SectorDataSpec>,
) -> Result<Vec<Cid>, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let raw = rt.send(
        &STORAGE_MARKET_ACTOR_ADDR,
        ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
        serialize(
            &ext::market::ComputeDataCommitmentParamsRef { inputs: &inputs },
            "compute data commitment params",
        )?,
        TokenAmount::zero(),
    )?;
    let ret: ext::market::ComputeDataCommitmentReturn =
        deserialize(&raw, "compute data commitment return")?;
    if ret.commds.len() != inputs.len() {
        return Err(actor_error!(
            illegal_state,
            "market returned {} data commitments for {} requests",
            ret.commds.len(),
            inputs.len()
        ));
    }
    Ok(ret.commds)
}

fn terminate_market_deals<BS, RT>(
    rt: &mut RT,
    epoch: ChainEpoch,
    deal_ids: Vec<DealID>,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    // Chunked so a pathological deal count cannot exceed message limits.
    const DEALS_PER_MESSAGE: usize = 8192;

    for chunk in deal_ids.chunks(DEALS_PER_MESSAGE) {
        rt.send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::ON_MINER_SECTORS_TERMINATE_METHOD,
            RawBytes::serialize(ext::market::OnMinerSectorsTerminateParamsRef {
                epoch,
                deal_ids: chunk,
            })?,
            TokenAmount::zero(),
        )?;
    }
    Ok(())
}

fn enroll_cron_event<BS, RT>(
    rt: &mut RT,
    event_epoch: ChainEpoch,
    payload: CronEventPayload,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let payload = serialize(&payload, "cron payload")?;
    rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        serialize(
            &ext::power::EnrollCronEventParams { event_epoch, payload },
            "cron params",
        )?,
        TokenAmount::zero(),
    )?;
    Ok(())
}

fn schedule_termination_work<BS, RT>(rt: &mut RT) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    info!("deferring early terminations to cron");
    enroll_cron_event(
        rt,
        rt.curr_epoch() + 1,
        CronEventPayload { event_type: CRON_EVENT_PROCESS_EARLY_TERMINATIONS },
    )
}

fn notify_power_update<BS, RT>(rt: &mut RT, delta: PowerPair) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    if delta.is_zero() {
        return Ok(());
    }

    rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_CLAIMED_POWER_METHOD,
        RawBytes::serialize(ext::power::UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw.clone(),
            quality_adjusted_delta: delta.qa.clone(),
        })?,
        TokenAmount::zero(),
    )
    .map_err(|e| e.wrap(format!("failed to update power by {:?}", delta)))?;
    Ok(())
}

fn notify_pledge_change<BS, RT>(rt: &mut RT, delta: &TokenAmount) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    if delta.is_zero() {
        return Ok(());
    }
    rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
        RawBytes::serialize(delta)?,
        TokenAmount::zero(),
    )?;
    Ok(())
}

fn burn<BS, RT>(rt: &mut RT, amount: TokenAmount) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    if amount.is_positive() {
        log::debug!("miner {} burning {}", rt.message().receiver(), amount);
        rt.send(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, RawBytes::default(), amount)?;
    }
    Ok(())
}

//
// -- Address resolution --
//

/// Resolves to an ID address and requires a principal (signable) actor behind it.
fn resolve_principal_address<BS, RT>(rt: &RT, raw: Address) -> Result<Address, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "could not resolve address {}", raw))?;
    let code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "address {} has no code", resolved))?;

    let principal = rt
        .resolve_builtin_actor_type(&code)
        .map_or(false, |t| CALLER_TYPES_SIGNABLE.contains(&t));
    if !principal {
        return Err(actor_error!(
            illegal_argument,
            "owner must be a principal actor, got {}",
            code
        ));
    }
    Ok(resolved)
}

/// Resolves to an ID address and requires an account backed by a BLS key,
/// since the worker key doubles as a VRF key.
fn resolve_worker_address<BS, RT>(rt: &mut RT, raw: Address) -> Result<Address, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "could not resolve address {}", raw))?;
    let code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "address {} has no code", resolved))?;
    if rt.resolve_builtin_actor_type(&code) != Some(Type::Account) {
        return Err(actor_error!(
            illegal_argument,
            "worker must be an account actor, got {}",
            code
        ));
    }

    // A non-BLS handle needs the account's key fetched and checked.
    if raw.protocol() != Protocol::BLS {
        let raw_key = rt.send(
            &resolved,
            ext::account::PUBKEY_ADDRESS_METHOD,
            RawBytes::default(),
            TokenAmount::zero(),
        )?;
        let key: Address = deserialize(&raw_key, "address response")?;
        if key.protocol() != Protocol::BLS {
            return Err(actor_error!(
                illegal_argument,
                "worker key {} must be a BLS pubkey, got {}",
                resolved,
                key.protocol()
            ));
        }
    }
    Ok(resolved)
}

//
// -- Scheduling arithmetic --
//

/// Derives this miner's proving-period offset in [0, period) by hashing its
/// address and birth epoch.
fn stagger_period_offset(
    policy: &Policy,
    address: Address,
    current_epoch: ChainEpoch,
    blake2b: impl FnOnce(&[u8]) -> [u8; 32],
) -> anyhow::Result<ChainEpoch> {
    let mut seed = serialize_vec(&address, "address")?;
    seed.write_i64::<BigEndian>(current_epoch)?;

    let digest = blake2b(&seed);
    let raw = BigEndian::read_u64(&digest);
    // In range because the period itself fits an i64.
    Ok((raw % policy.wpost_proving_period as u64) as ChainEpoch)
}

/// The latest epoch at or before `current_epoch` congruent to `offset` modulo
/// the proving period.
fn nearest_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    let position = current_epoch % policy.wpost_proving_period;
    let into_period = if position >= offset {
        position - offset
    } else {
        policy.wpost_proving_period - (offset - position)
    };
    current_epoch - into_period
}

fn deadline_index_at(policy: &Policy, current_epoch: ChainEpoch, period_start: ChainEpoch) -> u64 {
    ((current_epoch - period_start) / policy.wpost_challenge_window) as u64
}

//
// -- Misc helpers --
//

pub fn power_for_sector(sector_size: SectorSize, sector: &SectorOnChainInfo) -> PowerPair {
    PowerPair {
        raw: BigInt::from(sector_size as u64),
        qa: qa_power_for_sector(sector_size, sector),
    }
}

pub fn power_for_sectors(sector_size: SectorSize, sectors: &[SectorOnChainInfo]) -> PowerPair {
    PowerPair {
        raw: BigInt::from(sector_size as u64) * sectors.len(),
        qa: sectors.iter().map(|s| qa_power_for_sector(sector_size, s)).sum(),
    }
}

fn termination_penalty(
    sector_size: SectorSize,
    current_epoch: ChainEpoch,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    sectors: &[SectorOnChainInfo],
) -> TokenAmount {
    sectors
        .iter()
        .map(|sector| {
            pledge_penalty_for_termination(
                &sector.expected_day_reward,
                current_epoch - sector.activation,
                &sector.expected_storage_pledge,
                network_qa_power_estimate,
                &qa_power_for_sector(sector_size, sector),
                reward_estimate,
                &sector.replaced_day_reward,
                sector.replaced_sector_age,
            )
        })
        .sum()
}

fn read_miner_info<BS: Blockstore>(store: &BS, state: &State) -> Result<MinerInfo, ActorError> {
    state.get_info(store).context_code(ExitCode::USR_ILLEGAL_STATE, "could not read miner info")
}

fn write_miner_info<BS: Blockstore>(
    store: &BS,
    state: &mut State,
    info: &MinerInfo,
) -> Result<(), ActorError> {
    state
        .save_info(store, info)
        .context_code(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
}

/// Swaps in a staged worker key once its effective epoch arrives.
fn apply_pending_worker_change<BS, RT>(
    rt: &RT,
    info: &mut MinerInfo,
    state: &mut State,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let change = match &info.pending_worker_key {
        Some(change) if rt.curr_epoch() >= change.effective_at => change,
        _ => return Ok(()),
    };

    info.worker = change.new_worker;
    info.pending_worker_key = None;
    write_miner_info(rt.store(), state, info)
}

/// Clears all fee debt or aborts; the returned amount must be burnt. Recent
/// vesting is deliberately not computed first — it is at most one period stale
/// and the cron will fold it in.
fn settle_debts_or_abort<BS, RT>(rt: &RT, state: &mut State) -> Result<TokenAmount, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    state
        .repay_debts(&rt.current_balance())
        .context_code(ExitCode::USR_ILLEGAL_STATE, "unlocked balance can not repay fee debt")
}

fn balance_invariants_broken(e: anyhow::Error) -> ActorError {
    ActorError::unchecked(
        ERR_BALANCE_INVARIANTS_BROKEN,
        format!("balance invariants broken: {}", e),
    )
}

impl ActorCode for Actor {
    fn invoke_method<BS, RT>(
        rt: &mut RT,
        method: MethodNum,
        params: &RawBytes,
    ) -> Result<RawBytes, ActorError>
    where
        BS: Blockstore + Clone,
        RT: Runtime<BS>,
    {
        match FromPrimitive::from_u64(method) {
            Some(Method::Constructor) => {
                Self::constructor(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ControlAddresses) => {
                let ret = Self::control_addresses(rt)?;
                Ok(RawBytes::serialize(&ret)?)
            }
            Some(Method::ChangeWorkerAddress) => {
                Self::change_worker_address(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ChangePeerID) => {
                Self::change_peer_id(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::SubmitWindowedPoSt) => {
                Self::submit_windowed_post(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::PreCommitSector) => {
                Self::pre_commit_sector(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ProveCommitSector) => {
                Self::prove_commit_sector(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ExtendSectorExpiration) => {
                Self::extend_sector_expiration(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::TerminateSectors) => {
                let ret = Self::terminate_sectors(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(ret)?)
            }
            Some(Method::DeclareFaults) => {
                Self::declare_faults(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::DeclareFaultsRecovered) => {
                Self::declare_faults_recovered(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::OnDeferredCronEvent) => {
                Self::on_deferred_cron_event(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::CheckSectorProven) => {
                Self::check_sector_proven(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ApplyRewards) => {
                Self::apply_rewards(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ReportConsensusFault) => {
                Self::report_consensus_fault(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::WithdrawBalance) => {
                let ret = Self::withdraw_balance(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(&ret)?)
            }
            Some(Method::ConfirmSectorProofsValid) => {
                Self::confirm_sector_proofs_valid(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ChangeMultiaddrs) => {
                Self::change_multiaddresses(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::CompactPartitions) => {
                Self::compact_partitions(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::CompactSectorNumbers) => {
                Self::compact_sector_numbers(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ConfirmUpdateWorkerKey) => {
                Self::confirm_update_worker_key(rt)?;
                Ok(RawBytes::default())
            }
            Some(Method::RepayDebt) => {
                Self::repay_debt(rt)?;
                Ok(RawBytes::default())
            }
            Some(Method::ChangeOwnerAddress) => {
                let inner: ChangeOwnerAddressParams = cbor::deserialize_params(params)?;
                Self::change_owner_address(rt, inner.new_owner)?;
                Ok(RawBytes::default())
            }
            Some(Method::DisputeWindowedPoSt) => {
                Self::dispute_windowed_post(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::PreCommitSectorBatch) => {
                Self::pre_commit_sector_batch(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ProveCommitAggregate) => {
                Self::prove_commit_aggregate(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ProveReplicaUpdates) => {
                let ret = Self::prove_replica_updates(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(ret)?)
            }
            None => Err(actor_error!(unhandled_message, "Invalid method")),
        }
    }
}
