// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{to_vec, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::{ChainEpoch, QuantSpec, EPOCH_UNDEFINED};
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PieceInfo;
use fvm_shared::reward::ThisEpochRewardReturn;
use fvm_shared::sector::StoragePower;
use fvm_shared::{MethodNum, METHOD_CONSTRUCTOR, METHOD_SEND};
use log::info;
use num_derive::FromPrimitive;
use num_traits::{FromPrimitive, Signed, Zero};

pub use self::deal::*;
pub use self::state::*;
pub use self::types::*;

use storage_actors_runtime::cbor::deserialize;
use storage_actors_runtime::runtime::builtins::Type;
use storage_actors_runtime::runtime::{ActorCode, Policy, Runtime};
use storage_actors_runtime::{
    actor_error, cbor, ActorContext, ActorError, Array, AsActorError, Set, SetMultimap,
    BURNT_FUNDS_ACTOR_ADDR, CALLER_TYPES_SIGNABLE, CRON_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_POWER_ACTOR_ADDR, SYSTEM_ACTOR_ADDR, VERIFIED_REGISTRY_ACTOR_ADDR,
};

mod balance_table;
mod deal;
#[doc(hidden)]
pub mod ext;
mod policy;
mod state;
mod types;

pub use self::balance_table::BalanceTable;
pub use self::policy::*;

/// Deal proposal array.
pub type DealArray<'bs, BS> = Array<'bs, DealProposal, BS>;

/// Deal state array.
pub type DealMetaArray<'bs, BS> = Array<'bs, DealState, BS>;

/// Market actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    AddBalance = 2,
    WithdrawBalance = 3,
    PublishStorageDeals = 4,
    VerifyDealsForActivation = 5,
    ActivateDeals = 6,
    OnMinerSectorsTerminate = 7,
    ComputeDataCommitment = 8,
    CronTick = 9,
}

/// Market Actor
pub struct Actor;

impl Actor {
    pub fn constructor<BS, RT>(rt: &mut RT) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_is(std::iter::once(&SYSTEM_ACTOR_ADDR))?;

        let st = State::new(rt.store())
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to construct state")?;
        rt.create(&st)?;
        Ok(())
    }

    /// Credits the message value to the named party's escrow.
    fn add_balance<BS, RT>(rt: &mut RT, provider_or_client: Address) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        let deposit = rt.message().value_received();
        if deposit <= TokenAmount::zero() {
            return Err(actor_error!(
                illegal_argument,
                "balance to add must be greater than zero was: {}",
                deposit
            ));
        }

        // Anyone with a signing key may top up anyone's escrow, either side.
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;

        let EscrowParty { nominal, .. } = resolve_escrow_address(rt, &provider_or_client)?;

        rt.transaction(|st: &mut State, rt| {
            st.add_escrow_balance(rt.store(), &nominal, &deposit)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to credit escrow")
        })
    }

    /// Pays out unlocked escrow, capped at what is actually free. Withdrawals
    /// for a miner entry go to its owner; only the owner or worker may ask.
    fn withdraw_balance<BS, RT>(
        rt: &mut RT,
        params: WithdrawBalanceParams,
    ) -> Result<WithdrawBalanceReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        if params.amount.is_negative() {
            return Err(actor_error!(illegal_argument, "negative amount: {}", params.amount));
        }

        let EscrowParty { nominal, recipient, approved } =
            resolve_escrow_address(rt, &params.provider_or_client)?;
        rt.validate_immediate_caller_is(&approved)?;

        let paid_out = rt.transaction(|st: &mut State, rt| {
            st.withdraw_escrow_balance(rt.store(), &nominal, &params.amount)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to debit escrow")
        })?;

        rt.send(&recipient, METHOD_SEND, RawBytes::default(), paid_out.clone())?;

        Ok(WithdrawBalanceReturn { amount_withdrawn: paid_out })
    }

    /// Admits a batch of client-signed deal proposals submitted by the
    /// provider's worker. Malformed or unfundable proposals are dropped
    /// individually; the batch only aborts when nothing survives.
    fn publish_storage_deals<BS, RT>(
        rt: &mut RT,
        params: PublishStorageDealsParams,
    ) -> Result<PublishStorageDealsReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        // The sender vouches for the whole batch, so only the client
        // signature inside each proposal needs verifying.
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        if params.deals.is_empty() {
            return Err(actor_error!(illegal_argument, "empty deals parameter"));
        }

        // Every deal in a batch names the same provider.
        let provider_raw = params.deals[0].proposal.provider;
        let provider = rt.resolve_address(&provider_raw).ok_or_else(|| {
            actor_error!(not_found, "failed to resolve provider address {}", provider_raw)
        })?;

        let code_id = rt
            .get_actor_code_cid(&provider)
            .ok_or_else(|| actor_error!(illegal_argument, "no code ID for address {}", provider))?;
        if rt.resolve_builtin_actor_type(&code_id) != Some(Type::Miner) {
            return Err(actor_error!(
                illegal_argument,
                "deal provider is not a storage miner actor"
            ));
        }

        let caller = rt.message().caller();
        let (_, worker, controllers) = miner_control_addresses(rt, &provider)?;
        if caller != worker && !controllers.contains(&caller) {
            return Err(actor_error!(
                forbidden,
                "caller {} is not worker or control address of provider {}",
                caller,
                provider
            ));
        }

        let baseline_power = current_baseline_power(rt)?;
        let (network_raw_power, _) = current_network_power(rt)?;

        // First pass: filter. Each proposal is checked independently and
        // dropped (with a log line, never an abort) on any failure.
        let mut cids_in_batch = BTreeSet::new();
        let mut accepted_cids = Vec::new();
        let mut accepted = Vec::with_capacity(params.deals.len());
        let mut client_lockups: BTreeMap<Address, TokenAmount> = BTreeMap::new();
        let mut provider_lockup = TokenAmount::zero();
        let mut accepted_indices = BitField::default();

        let state: State = rt.state::<State>()?;

        for (di, mut deal) in params.deals.into_iter().enumerate() {
            if let Err(e) = validate_proposal(rt, &deal, &network_raw_power, &baseline_power) {
                info!("invalid deal {}: {}", di, e.msg());
                continue;
            }

            if deal.proposal.provider != provider && deal.proposal.provider != provider_raw {
                info!(
                    "invalid deal {}: cannot publish deals from multiple providers in one batch",
                    di
                );
                continue;
            }
            let client = match rt.resolve_address(&deal.proposal.client) {
                Some(client) => client,
                None => {
                    info!(
                        "invalid deal {}: failed to resolve proposal.client address {} for deal",
                        di, deal.proposal.client
                    );
                    continue;
                }
            };

            // Both sides must have escrow covering this deal on top of every
            // deal already accepted from this batch.
            let lockup = client_lockups.entry(client).or_default();
            *lockup += deal.proposal.client_balance_requirement();
            let client_funded = state
                .balance_covered(rt.store(), client, lockup)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to check client escrow")?;
            if !client_funded {
                info!("invalid deal: {}: insufficient client funds to cover proposal cost", di);
                continue;
            }

            provider_lockup += &deal.proposal.provider_collateral;
            let provider_funded = state
                .balance_covered(rt.store(), provider, &provider_lockup)
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to check provider escrow")?;
            if !provider_funded {
                info!("invalid deal: {}: insufficient provider funds to cover proposal cost", di);
                provider_lockup -= &deal.proposal.provider_collateral;
                continue;
            }

            // Store canonical addresses on chain. This must follow signature
            // verification (the client signed the original) and precede the
            // CID, which identifies the stored form.
            deal.proposal.provider = provider;
            deal.proposal.client = client;

            let pcid = deal_cid(rt, &deal.proposal).map_err(|e| {
                actor_error!(illegal_argument; "failed to take cid of proposal {}: {}", di, e)
            })?;

            // Duplicates are checked both within this batch and against
            // proposals pending from earlier messages.
            let pending_elsewhere = Set::from_root(rt.store(), &state.pending_proposals)
                .context("failed to load pending proposals")?
                .has(&pcid.to_bytes())
                .context("failed to check for existing deal proposal")?;
            if pending_elsewhere || cids_in_batch.contains(&pcid) {
                info!("invalid deal {}: cannot publish duplicate deal proposal", di);
                continue;
            }

            // A verified deal consumes the client's datacap now; failure to
            // acquire it drops the deal rather than the batch.
            if deal.proposal.verified_deal {
                if let Err(e) = rt.send(
                    &VERIFIED_REGISTRY_ACTOR_ADDR,
                    ext::verifreg::USE_BYTES_METHOD,
                    RawBytes::serialize(ext::verifreg::UseBytesParams {
                        address: client,
                        deal_size: BigInt::from(deal.proposal.piece_size.0),
                    })?,
                    TokenAmount::zero(),
                ) {
                    info!("invalid deal {}: failed to acquire datacap exitcode: {}", di, e.msg());
                    continue;
                }
            }

            cids_in_batch.insert(pcid);
            accepted_cids.push(pcid);
            accepted.push(deal);
            accepted_indices.set(di as u64)
        }

        let accepted_count = accepted_indices.len();
        if accepted.len() != accepted_cids.len() {
            return Err(actor_error!(
                illegal_state,
                "{} valid deals but {} valid proposal cids",
                accepted.len(),
                accepted_cids.len()
            ));
        }
        if accepted_count != accepted.len() as u64 {
            return Err(actor_error!(
                illegal_state,
                "{} valid deals but valid_deal_count {}",
                accepted.len(),
                accepted_count
            ));
        }
        if accepted_count == 0 {
            return Err(actor_error!(illegal_argument, "All deal proposals invalid"));
        }

        // Second pass: commit the survivors atomically.
        let mut new_deal_ids = Vec::with_capacity(accepted.len());
        rt.transaction(|st: &mut State, rt| {
            let mut pending_deals = Set::from_root(rt.store(), &st.pending_proposals)
                .context("failed to load pending proposals")?;
            let mut proposals = DealArray::load(&st.proposals, rt.store())
                .context("failed to load deal proposals")?;
            let mut schedule = SetMultimap::from_root(rt.store(), &st.deal_ops_by_epoch)
                .context("failed to load deal schedule")?;

            // Failures here are programmer errors; every admissibility check
            // already ran above.
            for (i, deal) in accepted.iter().enumerate() {
                st.lock_client_and_provider_balances(rt.store(), &deal.proposal)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to lock balance")?;

                let id = st.generate_storage_deal_id();

                pending_deals
                    .put(accepted_cids[i].to_bytes().into())
                    .context("failed to set pending deal")?;
                proposals.set(id, deal.proposal.clone()).context("failed to set deal")?;

                // Spread first processing over the update interval by deal ID
                // so one epoch cannot be packed with settlements on purpose.
                let process_epoch =
                    first_settlement_epoch(rt.policy(), deal.proposal.start_epoch, id);
                schedule
                    .put(process_epoch, id)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to schedule deal")?;

                new_deal_ids.push(id);
            }

            st.pending_proposals =
                pending_deals.root().context("failed to flush pending deals")?;
            st.proposals = proposals.flush().context("failed to flush deal proposals")?;
            st.deal_ops_by_epoch = schedule.root().context("failed to flush deal schedule")?;

            Ok(())
        })?;

        Ok(PublishStorageDealsReturn { ids: new_deal_ids, valid_deals: accepted_indices })
    }

    /// Computes the combined space-time weight of the deals proposed for each
    /// of a batch of sectors, checking along the way that the deals could be
    /// activated for those sector properties.
    ///
    /// The check here is advisory. The binding validation runs at activation,
    /// once the real activation epoch is known.
    fn verify_deals_for_activation<BS, RT>(
        rt: &mut RT,
        params: VerifyDealsForActivationParams,
    ) -> Result<VerifyDealsForActivationReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(std::iter::once(&Type::Miner))?;
        let miner_addr = rt.message().caller();
        let curr_epoch = rt.curr_epoch();

        let st: State = rt.state()?;
        let proposals = DealArray::load(&st.proposals, rt.store())
            .context("failed to load deal proposals")?;

        let mut weights = Vec::with_capacity(params.sectors.len());
        for sector in params.sectors.iter() {
            // The activation epoch is unknown at this point; using the current
            // epoch still rejects deals already too late for any sector
            // activating now.
            let (deal_weight, verified_deal_weight, deal_space) = validate_and_weigh_deals(
                &proposals,
                &sector.deal_ids,
                &miner_addr,
                sector.sector_expiry,
                curr_epoch,
            )
            .context_code(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to validate deal proposals for activation",
            )?;

            weights.push(SectorWeights { deal_space, deal_weight, verified_deal_weight });
        }

        Ok(VerifyDealsForActivationReturn { sectors: weights })
    }

    /// Marks a set of deals as activated by the sector now being proven.
    /// Every deal must still be pending and not already claimed by another
    /// sector.
    fn activate_deals<BS, RT>(rt: &mut RT, params: ActivateDealsParams) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(std::iter::once(&Type::Miner))?;
        let miner_addr = rt.message().caller();
        let curr_epoch = rt.curr_epoch();

        rt.transaction(|st: &mut State, rt| {
            let proposals = DealArray::load(&st.proposals, rt.store())
                .context("failed to load deal proposals")?;

            validate_and_weigh_deals(
                &proposals,
                &params.deal_ids,
                &miner_addr,
                params.sector_expiry,
                curr_epoch,
            )
            .context_code(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to validate deal proposals for activation",
            )?;

            let mut deal_states = DealMetaArray::load(&st.states, rt.store())
                .context("failed to load deal states")?;
            let pending_deals = Set::from_root(rt.store(), &st.pending_proposals)
                .context("failed to load pending proposals")?;

            for deal_id in params.deal_ids.iter() {
                let already = deal_states
                    .get(*deal_id)
                    .with_context(|| format!("failed to get state for deal_id ({})", deal_id))?;
                if already.is_some() {
                    return Err(actor_error!(
                        illegal_argument,
                        "deal {} already included in another sector",
                        deal_id
                    ));
                }

                let proposal = proposals
                    .get(*deal_id)
                    .with_context(|| format!("failed to get deal_id ({})", deal_id))?
                    .ok_or_else(|| actor_error!(not_found, "no such deal_id: {}", deal_id))?;

                let pcid = deal_cid(rt, proposal)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to compute proposal CID")?;

                let pending = pending_deals
                    .has(&pcid.to_bytes())
                    .with_context(|| format!("failed to get pending proposal ({})", pcid))?;
                if !pending {
                    return Err(actor_error!(
                        illegal_state,
                        "tried to activate deal that was not in the pending set ({})",
                        pcid
                    ));
                }

                deal_states
                    .set(
                        *deal_id,
                        DealState {
                            sector_start_epoch: curr_epoch,
                            last_updated_epoch: EPOCH_UNDEFINED,
                            slash_epoch: EPOCH_UNDEFINED,
                        },
                    )
                    .with_context(|| format!("failed to set deal state {}", deal_id))?;
            }

            st.states = deal_states.flush().context("failed to flush deal states")?;
            Ok(())
        })
    }

    /// Marks the still-running deals of a terminated sector for slashing.
    /// The money moves later, when cron settles each marked deal.
    fn on_miner_sectors_terminate<BS, RT>(
        rt: &mut RT,
        params: OnMinerSectorsTerminateParams,
    ) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(std::iter::once(&Type::Miner))?;
        let miner_addr = rt.message().caller();

        rt.transaction(|st: &mut State, rt| {
            let proposals = DealArray::load(&st.proposals, rt.store())
                .context("failed to load deal proposals")?;
            let mut deal_states = DealMetaArray::load(&st.states, rt.store())
                .context("failed to load deal states")?;

            for id in params.deal_ids {
                let deal = proposals
                    .get(id)
                    .with_context(|| format!("failed to get deal proposal {}", id))?;

                // An expired deal may already be gone by the time its sector
                // terminates. Skip it and keep going.
                let deal = match deal {
                    Some(deal) => deal,
                    None => {
                        info!("couldn't find deal {}", id);
                        continue;
                    }
                };

                if deal.provider != miner_addr {
                    return Err(actor_error!(
                        illegal_state,
                        "caller {} is not the provider {} of deal {}",
                        miner_addr,
                        deal.provider,
                        id
                    ));
                }

                if deal.end_epoch <= params.epoch {
                    info!("deal {} expired, not slashing", id);
                    continue;
                }

                let mut state: DealState = *deal_states
                    .get(id)
                    .with_context(|| format!("failed to get deal state {}", id))?
                    // A proposal with no state was never activated, and an
                    // unactivated deal has no terminating sector.
                    .ok_or_else(|| actor_error!(illegal_argument, "no state for deal {}", id))?;

                if state.slash_epoch != EPOCH_UNDEFINED {
                    info!("deal {}, already slashed", id);
                    continue;
                }

                state.slash_epoch = params.epoch;
                deal_states
                    .set(id, state)
                    .with_context(|| format!("failed to set deal state ({})", id))?;
            }

            st.states = deal_states.flush().context("failed to flush deal states")?;
            Ok(())
        })
    }

    /// Computes the unsealed sector CID over the pieces of each input's deals.
    fn compute_data_commitment<BS, RT>(
        rt: &mut RT,
        params: ComputeDataCommitmentParams,
    ) -> Result<ComputeDataCommitmentReturn, ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_type(std::iter::once(&Type::Miner))?;

        let st: State = rt.state()?;
        let proposals = DealArray::load(&st.proposals, rt.store())
            .context("failed to load deal proposals")?;

        let mut commds = Vec::with_capacity(params.inputs.len());
        for comm_input in params.inputs.iter() {
            let mut pieces: Vec<PieceInfo> = Vec::with_capacity(comm_input.deal_ids.len());
            for deal_id in &comm_input.deal_ids {
                let deal = proposals
                    .get(*deal_id)
                    .with_context(|| format!("failed to get deal_id ({})", deal_id))?
                    .ok_or_else(|| {
                        actor_error!(not_found, "proposal doesn't exist ({})", deal_id)
                    })?;
                pieces.push(PieceInfo { cid: deal.piece_cid, size: deal.piece_size });
            }
            let commd = rt
                .compute_unsealed_sector_cid(comm_input.sector_type, &pieces)
                .context_code(
                    ExitCode::USR_ILLEGAL_ARGUMENT,
                    "failed to compute unsealed sector CID",
                )?;
            commds.push(commd);
        }

        Ok(ComputeDataCommitmentReturn { commds })
    }

    /// Settles every deal scheduled between the last tick and now: pays
    /// providers for service, punishes init timeouts and slashed deals, and
    /// reschedules deals that are still running.
    fn cron_tick<BS, RT>(rt: &mut RT) -> Result<(), ActorError>
    where
        BS: Blockstore,
        RT: Runtime<BS>,
    {
        rt.validate_immediate_caller_is(std::iter::once(&CRON_ACTOR_ADDR))?;

        let mut total_slashed = TokenAmount::zero();
        let curr_epoch = rt.curr_epoch();
        let mut timed_out_verified: Vec<DealProposal> = Vec::new();

        rt.transaction(|st: &mut State, rt| {
            let last_cron = st.last_cron;
            let mut reschedule: BTreeMap<ChainEpoch, Vec<DealID>> = BTreeMap::new();
            let mut epochs_done = Vec::<ChainEpoch>::new();

            let mut deal_states = DealMetaArray::load(&st.states, rt.store())
                .context("failed to load deal states")?;
            let mut proposals = DealArray::load(&st.proposals, rt.store())
                .context("failed to load deal proposals")?;
            let mut pending_deals = Set::from_root(rt.store(), &st.pending_proposals)
                .context("failed to load pending proposals")?;

            for i in (last_cron + 1)..=curr_epoch {
                // Sorted IDs, so this loop touches state deterministically.
                let due = st
                    .updates_for_epoch(rt.store(), i)
                    .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to get deals for epoch")?;

                for deal_id in due {
                    let deal = proposals
                        .get(deal_id)
                        .with_context(|| format!("failed to get deal_id ({})", deal_id))?
                        .ok_or_else(|| {
                            actor_error!(not_found, "proposal doesn't exist ({})", deal_id)
                        })?
                        .clone();

                    let dcid = deal_cid(rt, &deal).with_context_code(
                        ExitCode::USR_ILLEGAL_STATE,
                        || format!("failed to compute cid for proposal {}", deal_id),
                    )?;

                    let state = deal_states
                        .get(deal_id)
                        .context("failed to get deal state")?
                        .cloned();

                    // Published but never activated: the deal timed out at its
                    // start epoch.
                    let mut state = match state {
                        Some(state) => state,
                        None => {
                            if curr_epoch < deal.start_epoch {
                                return Err(actor_error!(
                                    illegal_state,
                                    "deal {} processed before start epoch {}",
                                    deal_id,
                                    deal.start_epoch
                                ));
                            }

                            let slashed = st
                                .process_deal_init_timed_out(rt.store(), &deal)
                                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                                    format!("failed to process deal init timeout {}", deal_id)
                                })?;
                            if !slashed.is_zero() {
                                total_slashed += slashed;
                            }
                            if deal.verified_deal {
                                timed_out_verified.push(deal.clone());
                            }

                            // There is a proposal and a pending entry to drop,
                            // but no state.
                            proposals
                                .delete(deal_id)
                                .with_context(|| {
                                    format!("failed to delete deal proposal {}", deal_id)
                                })?
                                .ok_or_else(|| {
                                    actor_error!(
                                        illegal_state,
                                        "failed to delete deal {} proposal {}: does not exist",
                                        deal_id,
                                        dcid
                                    )
                                })?;
                            pending_deals
                                .delete(&dcid.to_bytes())
                                .with_context(|| {
                                    format!("failed to delete pending proposal {}", deal_id)
                                })?
                                .ok_or_else(|| {
                                    actor_error!(
                                        illegal_state,
                                        "failed to delete pending proposal {}: does not exist",
                                        dcid
                                    )
                                })?;
                            continue;
                        }
                    };

                    // The first settlement after activation retires the
                    // pending entry; from here the deal can no longer be
                    // re-published.
                    if state.last_updated_epoch == EPOCH_UNDEFINED {
                        pending_deals
                            .delete(&dcid.to_bytes())
                            .with_context(|| {
                                format!("failed to delete pending proposal {}", dcid)
                            })?
                            .ok_or_else(|| {
                                actor_error!(
                                    illegal_state,
                                    "failed to delete pending proposal {}: does not exist",
                                    dcid
                                )
                            })?;
                    }

                    let (slash_amount, next_epoch, finished) = st
                        .update_pending_deal_state(rt.store(), rt.policy(), &state, &deal, curr_epoch)
                        .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                            format!("failed to update deal state {}", deal_id)
                        })?;
                    if slash_amount.is_negative() {
                        return Err(actor_error!(
                            illegal_state,
                            "computed negative slash amount {} for deal {}",
                            slash_amount,
                            deal_id
                        ));
                    }

                    if finished {
                        if next_epoch != EPOCH_UNDEFINED {
                            return Err(actor_error!(
                                illegal_state,
                                "removed deal {} should have no scheduled epoch (got {})",
                                deal_id,
                                next_epoch
                            ));
                        }

                        total_slashed += slash_amount;

                        // Proposal and state leave together.
                        deal_states
                            .delete(deal_id)
                            .context("failed to delete deal state")?
                            .ok_or_else(|| {
                                actor_error!(
                                    illegal_state,
                                    "failed to delete deal state: does not exist"
                                )
                            })?;
                        proposals
                            .delete(deal_id)
                            .context("failed to delete deal proposal")?
                            .ok_or_else(|| {
                                actor_error!(
                                    illegal_state,
                                    "failed to delete deal proposal: does not exist"
                                )
                            })?;
                    } else {
                        if next_epoch <= curr_epoch {
                            return Err(actor_error!(
                                illegal_state,
                                "continuing deal {} next epoch {} should be in future",
                                deal_id,
                                next_epoch
                            ));
                        }
                        if !slash_amount.is_zero() {
                            return Err(actor_error!(
                                illegal_state,
                                "continuing deal {} should not be slashed",
                                deal_id
                            ));
                        }

                        state.last_updated_epoch = curr_epoch;
                        deal_states.set(deal_id, state).context("failed to set deal state")?;

                        reschedule.entry(next_epoch).or_default().push(deal_id);
                    }
                }
                epochs_done.push(i);
            }

            let mut schedule = SetMultimap::from_root(rt.store(), &st.deal_ops_by_epoch)
                .context("failed to load deal schedule")?;

            for epoch in epochs_done {
                schedule.remove_all(epoch).with_context_code(
                    ExitCode::USR_ILLEGAL_STATE,
                    || format!("failed to delete deal ops for epoch {}", epoch),
                )?;
            }

            // A BTreeMap iterates in epoch order, keeping the reinsertions
            // deterministic too.
            for (epoch, deals) in reschedule {
                schedule.put_many(epoch, &deals).with_context_code(
                    ExitCode::USR_ILLEGAL_STATE,
                    || format!("failed to reinsert deal IDs for epoch {}", epoch),
                )?;
            }

            st.deal_ops_by_epoch = schedule.root().context("failed to flush deal schedule")?;
            st.states = deal_states.flush().context("failed to flush deal states")?;
            st.proposals = proposals.flush().context("failed to flush deal proposals")?;
            st.pending_proposals =
                pending_deals.root().context("failed to flush pending deals")?;

            st.last_cron = rt.curr_epoch();

            Ok(())
        })?;

        // Datacap consumed by verified deals that never activated is restored
        // to their clients. Failure only logs: the settlement above is already
        // committed.
        for d in timed_out_verified {
            let res = rt.send(
                &VERIFIED_REGISTRY_ACTOR_ADDR,
                ext::verifreg::RESTORE_BYTES_METHOD,
                RawBytes::serialize(ext::verifreg::RestoreBytesParams {
                    address: d.client,
                    deal_size: BigInt::from(d.piece_size.0),
                })?,
                TokenAmount::zero(),
            );

            if let Err(e) = res {
                log::error!(
                    "failed to send RestoreBytes call to the verifreg actor for timed \
                    out verified deal, client: {}, deal_size: {}, provider: {}, got code: {:?}. {}",
                    d.client,
                    d.piece_size.0,
                    d.provider,
                    e.exit_code(),
                    e.msg()
                );
            }
        }

        if !total_slashed.is_zero() {
            rt.send(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, RawBytes::default(), total_slashed)?;
        }
        Ok(())
    }
}

/// Checks that each listed deal could activate for a sector with the given
/// expiration, activating now, and sums their space-time weights split by
/// verified status. Also returns the total deal space in bytes.
fn validate_and_weigh_deals<BS>(
    proposals: &DealArray<BS>,
    deal_ids: &[DealID],
    provider: &Address,
    sector_expiry: ChainEpoch,
    sector_activation: ChainEpoch,
) -> anyhow::Result<(BigInt, BigInt, u64)>
where
    BS: Blockstore,
{
    let mut seen_deal_ids = BTreeSet::new();
    let mut total_space = 0;
    let mut total_weight = BigInt::zero();
    let mut total_verified_weight = BigInt::zero();
    for deal_id in deal_ids {
        if !seen_deal_ids.insert(deal_id) {
            return Err(anyhow::anyhow!(actor_error!(
                illegal_argument,
                "deal id {} present multiple times",
                deal_id
            )));
        }
        let proposal = proposals
            .get(*deal_id)?
            .ok_or_else(|| actor_error!(not_found, "no such deal {}", deal_id))?;

        check_deal_activatable(proposal, provider, sector_expiry, sector_activation)
            .map_err(|e| e.wrap(format!("cannot activate deal {}", deal_id)))?;

        total_space += proposal.piece_size.0;
        let weight = proposal.weight();
        if proposal.verified_deal {
            total_verified_weight += weight;
        } else {
            total_weight += weight;
        }
    }

    Ok((total_weight, total_verified_weight, total_space))
}

fn check_deal_activatable(
    proposal: &DealProposal,
    provider: &Address,
    sector_expiration: ChainEpoch,
    curr_epoch: ChainEpoch,
) -> Result<(), ActorError> {
    if &proposal.provider != provider {
        return Err(actor_error!(
            forbidden,
            "proposal has provider {}, must be {}",
            proposal.provider,
            provider
        ));
    };

    if curr_epoch > proposal.start_epoch {
        return Err(actor_error!(
            illegal_argument,
            "proposal start epoch {} has already elapsed at {}",
            proposal.start_epoch,
            curr_epoch
        ));
    };

    if proposal.end_epoch > sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "proposal expiration {} exceeds sector expiration {}",
            proposal.end_epoch,
            sector_expiration
        ));
    };

    Ok(())
}

/// Checks one proposal against the chain-wide admission rules: signature,
/// shape, timing, and the price and collateral bounds set by policy.
fn validate_proposal<BS, RT>(
    rt: &RT,
    deal: &ClientDealProposal,
    network_raw_power: &StoragePower,
    baseline_power: &StoragePower,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    verify_client_signature(rt, deal)?;

    let proposal = &deal.proposal;

    if proposal.label.len() > detail::DEAL_MAX_LABEL_SIZE {
        return Err(actor_error!(
            illegal_argument,
            "deal label can be at most {} bytes, is {}",
            detail::DEAL_MAX_LABEL_SIZE,
            proposal.label.len()
        ));
    }

    proposal
        .piece_size
        .validate()
        .map_err(|e| actor_error!(illegal_argument, "proposal piece size is invalid: {}", e))?;

    if !is_piece_cid(&proposal.piece_cid) {
        return Err(actor_error!(illegal_argument, "proposal piece CID has wrong prefix"));
    }

    if proposal.end_epoch <= proposal.start_epoch {
        return Err(actor_error!(illegal_argument, "proposal end before proposal start"));
    }

    if rt.curr_epoch() > proposal.start_epoch {
        return Err(actor_error!(illegal_argument, "deal start epoch has already elapsed"));
    };

    let (min_dur, max_dur) = deal_duration_bounds(proposal.piece_size);
    if proposal.duration() < min_dur || proposal.duration() > max_dur {
        return Err(actor_error!(illegal_argument, "deal duration out of bounds"));
    };

    let (min_price, max_price) =
        deal_price_per_epoch_bounds(proposal.piece_size, proposal.duration());
    if proposal.storage_price_per_epoch < min_price
        || &proposal.storage_price_per_epoch > max_price
    {
        return Err(actor_error!(illegal_argument, "storage price out of bounds"));
    };

    let (min_provider_collateral, max_provider_collateral) = deal_provider_collateral_bounds(
        rt.policy(),
        proposal.piece_size,
        network_raw_power,
        baseline_power,
        &rt.total_fil_circ_supply(),
    );
    if proposal.provider_collateral < min_provider_collateral
        || &proposal.provider_collateral > max_provider_collateral
    {
        return Err(actor_error!(illegal_argument, "provider collateral out of bounds"));
    };

    let (min_client_collateral, max_client_collateral) =
        deal_client_collateral_bounds(proposal.piece_size, proposal.duration());
    if proposal.client_collateral < min_client_collateral
        || &proposal.client_collateral > max_client_collateral
    {
        return Err(actor_error!(illegal_argument, "client collateral out of bounds"));
    };

    Ok(())
}

/// Verifies the client's signature over the unsigned proposal bytes.
fn verify_client_signature<BS, RT>(
    rt: &RT,
    proposal: &ClientDealProposal,
) -> Result<(), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let proposal_bytes = to_vec(&proposal.proposal)
        .map_err(|e| ActorError::serialization(format!("failed to serialize proposal: {}", e)))?;

    rt.verify_signature(&proposal.client_signature, &proposal.proposal.client, &proposal_bytes)
        .context_code(ExitCode::USR_ILLEGAL_ARGUMENT, "signature proposal invalid")
}

/// Computes the CID identifying a deal proposal, over its stored encoding.
pub(crate) fn deal_cid<BS, RT>(rt: &RT, proposal: &DealProposal) -> anyhow::Result<Cid>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    const DIGEST_SIZE: u32 = 32;
    let data = to_vec(proposal)?;
    let hash = rt.hash_blake2b(&data);
    debug_assert_eq!(DIGEST_SIZE as usize, hash.len(), "expected 32 byte digest");
    let mh = cid::multihash::Multihash::wrap(cid::multihash::Code::Blake2b256.into(), &hash)?;
    Ok(Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, mh))
}

/// The epoch at which cron first processes a deal: the deal-ID-determined slot
/// within the update interval, at or after the deal's start.
fn first_settlement_epoch(policy: &Policy, start_epoch: ChainEpoch, deal_id: DealID) -> ChainEpoch {
    let interval = policy.deal_updates_interval;
    let slot = deal_id as i64 % interval;
    let q = QuantSpec { unit: interval, offset: 0 };
    let prev = q.quantize_down(start_epoch) + slot;
    if prev >= start_epoch {
        prev
    } else {
        q.quantize_up(start_epoch) + slot
    }
}

/// Fetches this epoch's baseline power from the reward actor.
fn current_baseline_power<BS, RT>(rt: &mut RT) -> Result<StoragePower, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let rwret = rt.send(
        &REWARD_ACTOR_ADDR,
        ext::reward::THIS_EPOCH_REWARD_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
    )?;
    let ret: ThisEpochRewardReturn = deserialize(&rwret, "epoch reward response")?;
    Ok(ret.this_epoch_baseline_power)
}

/// Fetches the network's total (raw, quality-adjusted) power from the power
/// actor.
fn current_network_power<BS, RT>(
    rt: &mut RT,
) -> Result<(StoragePower, StoragePower), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let pwret = rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::CURRENT_TOTAL_POWER_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
    )?;
    let ret: ext::power::CurrentTotalPowerReturn = deserialize(&pwret, "total power response")?;
    Ok((ret.raw_byte_power, ret.quality_adj_power))
}

/// An escrow entry resolved from a user-supplied address.
struct EscrowParty {
    /// Canonical address the balance is held against.
    nominal: Address,
    /// Where withdrawals are paid. For a miner entry this is the owner.
    recipient: Address,
    /// Addresses allowed to authorize a withdrawal.
    approved: Vec<Address>,
}

fn resolve_escrow_address<BS, RT>(rt: &mut RT, addr: &Address) -> Result<EscrowParty, ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let nominal = rt
        .resolve_address(addr)
        .ok_or_else(|| actor_error!(illegal_argument, "failed to resolve address {}", addr))?;

    let code_id = rt
        .get_actor_code_cid(&nominal)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address {}", nominal))?;

    if rt.resolve_builtin_actor_type(&code_id) == Some(Type::Miner) {
        let (owner, worker, _) = miner_control_addresses(rt, &nominal)?;
        return Ok(EscrowParty { nominal, recipient: owner, approved: vec![owner, worker] });
    }

    Ok(EscrowParty { nominal, recipient: nominal, approved: vec![nominal] })
}

fn miner_control_addresses<BS, RT>(
    rt: &mut RT,
    miner_addr: &Address,
) -> Result<(Address, Address, Vec<Address>), ActorError>
where
    BS: Blockstore,
    RT: Runtime<BS>,
{
    let ret = rt.send(
        miner_addr,
        ext::miner::CONTROL_ADDRESSES_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
    )?;
    let addrs: ext::miner::GetControlAddressesReturnParams =
        deserialize(&ret, "miner control addresses response")?;

    Ok((addrs.owner, addrs.worker, addrs.control_addresses))
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
                Self::constructor(rt)?;
                Ok(RawBytes::default())
            }
            Some(Method::AddBalance) => {
                let params: AddBalanceParams = cbor::deserialize_params(params)?;
                Self::add_balance(rt, params.provider_or_client)?;
                Ok(RawBytes::default())
            }
            Some(Method::WithdrawBalance) => {
                let res = Self::withdraw_balance(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(res)?)
            }
            Some(Method::PublishStorageDeals) => {
                let res = Self::publish_storage_deals(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(res)?)
            }
            Some(Method::VerifyDealsForActivation) => {
                let res = Self::verify_deals_for_activation(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(res)?)
            }
            Some(Method::ActivateDeals) => {
                Self::activate_deals(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::OnMinerSectorsTerminate) => {
                Self::on_miner_sectors_terminate(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::default())
            }
            Some(Method::ComputeDataCommitment) => {
                let res = Self::compute_data_commitment(rt, cbor::deserialize_params(params)?)?;
                Ok(RawBytes::serialize(res)?)
            }
            Some(Method::CronTick) => {
                Self::cron_tick(rt)?;
                Ok(RawBytes::default())
            }
            None => Err(actor_error!(unhandled_message, "Invalid method")),
        }
    }
}
