// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT
#![allow(dead_code)]

use cid::multihash::MultihashDigest;
use cid::Cid;
use fvm_ipld_encoding::{to_vec, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::commcid;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::reward::ThisEpochRewardReturn;
use fvm_shared::sector::StoragePower;
use fvm_shared::smooth::FilterEstimate;
use num_traits::Zero;

use storage_actor_market::{
    ext, Actor, AddBalanceParams, ClientDealProposal, DealProposal, DealState, Label, Method,
    PublishStorageDealsParams, PublishStorageDealsReturn, State, WithdrawBalanceParams,
    WithdrawBalanceReturn,
};
use storage_actors_runtime::network::EPOCHS_IN_DAY;
use storage_actors_runtime::runtime::builtins::Type;
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::test_utils::{
    expect_empty, ExpectedVerifySig, MockRuntime, ACCOUNT_ACTOR_CODE_ID, CRON_ACTOR_CODE_ID,
    MINER_ACTOR_CODE_ID, SYSTEM_ACTOR_CODE_ID,
};
use storage_actors_runtime::{
    Array, CRON_ACTOR_ADDR, REWARD_ACTOR_ADDR, STORAGE_MARKET_ACTOR_ADDR,
    STORAGE_POWER_ACTOR_ADDR, SYSTEM_ACTOR_ADDR, VERIFIED_REGISTRY_ACTOR_ADDR,
};

pub const OWNER: Address = Address::new_id(101);
pub const WORKER: Address = Address::new_id(103);
pub const PROVIDER: Address = Address::new_id(102);
pub const CLIENT: Address = Address::new_id(104);

pub fn make_piece_cid(input: &[u8]) -> Cid {
    let hash = cid::multihash::Code::Sha2_256.digest(input);
    let mh =
        cid::multihash::Multihash::wrap(commcid::SHA2_256_TRUNC254_PADDED, hash.digest()).unwrap();
    Cid::new_v1(commcid::FIL_COMMITMENT_UNSEALED, mh)
}

pub fn setup() -> MockRuntime {
    let mut rt = MockRuntime {
        receiver: STORAGE_MARKET_ACTOR_ADDR,
        caller: SYSTEM_ACTOR_ADDR,
        caller_type: *SYSTEM_ACTOR_CODE_ID,
        ..Default::default()
    };
    rt.actor_code_cids.insert(OWNER, *ACCOUNT_ACTOR_CODE_ID);
    rt.actor_code_cids.insert(WORKER, *ACCOUNT_ACTOR_CODE_ID);
    rt.actor_code_cids.insert(PROVIDER, *MINER_ACTOR_CODE_ID);
    rt.actor_code_cids.insert(CLIENT, *ACCOUNT_ACTOR_CODE_ID);

    construct_and_verify(&mut rt);

    rt
}

pub fn construct_and_verify(rt: &mut MockRuntime) {
    rt.set_caller(*SYSTEM_ACTOR_CODE_ID, SYSTEM_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![SYSTEM_ACTOR_ADDR]);
    assert_eq!(
        RawBytes::default(),
        rt.call::<Actor>(Method::Constructor as u64, &RawBytes::default()).unwrap()
    );
    rt.verify();
}

pub fn get_state(rt: &MockRuntime) -> State {
    rt.get_state::<State>()
}

pub fn expect_provider_control_address(rt: &mut MockRuntime, provider: Address) {
    let ret = ext::miner::GetControlAddressesReturnParams {
        owner: OWNER,
        worker: WORKER,
        control_addresses: Vec::new(),
    };
    rt.expect_send(
        provider,
        ext::miner::CONTROL_ADDRESSES_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
        RawBytes::serialize(ret).unwrap(),
        ExitCode::OK,
    );
}

/// Adds escrow for a simple account party (a client).
pub fn add_participant_funds(rt: &mut MockRuntime, addr: Address, amount: TokenAmount) {
    rt.set_value(amount);
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, addr);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);

    let params = AddBalanceParams { provider_or_client: addr };
    assert!(rt
        .call::<Actor>(Method::AddBalance as u64, &RawBytes::serialize(params).unwrap())
        .is_ok());
    rt.verify();

    rt.add_balance(rt.value_received.clone());
}

/// Adds escrow for a provider; the control addresses are fetched from the miner.
pub fn add_provider_funds(rt: &mut MockRuntime, amount: TokenAmount) {
    rt.set_value(amount);
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, OWNER);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);
    expect_provider_control_address(rt, PROVIDER);

    let params = AddBalanceParams { provider_or_client: PROVIDER };
    assert!(rt
        .call::<Actor>(Method::AddBalance as u64, &RawBytes::serialize(params).unwrap())
        .is_ok());
    rt.verify();

    rt.add_balance(rt.value_received.clone());
}

pub fn withdraw_client_balance(
    rt: &mut MockRuntime,
    amount: TokenAmount,
    expected_send: TokenAmount,
) {
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, CLIENT);
    rt.expect_validate_caller_addr(vec![CLIENT]);
    rt.expect_send(
        CLIENT,
        fvm_shared::METHOD_SEND,
        RawBytes::default(),
        expected_send.clone(),
        RawBytes::default(),
        ExitCode::OK,
    );

    let params = WithdrawBalanceParams { provider_or_client: CLIENT, amount };
    let ret: WithdrawBalanceReturn = rt
        .call::<Actor>(Method::WithdrawBalance as u64, &RawBytes::serialize(params).unwrap())
        .unwrap()
        .deserialize()
        .unwrap();
    rt.verify();
    assert_eq!(expected_send, ret.amount_withdrawn);
}

pub fn generate_deal_proposal(
    client: Address,
    provider: Address,
    start_epoch: ChainEpoch,
    end_epoch: ChainEpoch,
    verified: bool,
) -> DealProposal {
    let piece_size = PaddedPieceSize(2048);
    let storage_price_per_epoch = TokenAmount::from_atto(10u8);
    let client_collateral = TokenAmount::from_atto(15u8);
    let provider_collateral = TokenAmount::from_atto(100u8);

    DealProposal {
        piece_cid: make_piece_cid("1".as_bytes()),
        piece_size,
        verified_deal: verified,
        client,
        provider,
        label: Label::String("label".to_string()),
        start_epoch,
        end_epoch,
        storage_price_per_epoch,
        provider_collateral,
        client_collateral,
    }
}

pub fn default_deal_lifetime() -> ChainEpoch {
    200 * EPOCHS_IN_DAY
}

pub fn sign_proposal(proposal: &DealProposal) -> ClientDealProposal {
    let signature = Signature::new_bls(b"does not matter".to_vec());
    ClientDealProposal { proposal: proposal.clone(), client_signature: signature }
}

pub fn expect_query_network_info(rt: &mut MockRuntime) {
    let reward = TokenAmount::from_whole(10);
    let power = StoragePower::from(1i64 << 50);
    let current_power = ext::power::CurrentTotalPowerReturn {
        raw_byte_power: power.clone(),
        quality_adj_power: power.clone(),
        pledge_collateral: TokenAmount::zero(),
        quality_adj_power_smoothed: FilterEstimate::new(power.clone(), BigInt::zero()),
    };
    let current_reward = ThisEpochRewardReturn {
        this_epoch_baseline_power: power,
        this_epoch_reward_smoothed: FilterEstimate::new(reward.atto().clone(), BigInt::zero()),
    };
    rt.expect_send(
        REWARD_ACTOR_ADDR,
        ext::reward::THIS_EPOCH_REWARD_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
        RawBytes::serialize(current_reward).unwrap(),
        ExitCode::OK,
    );
    rt.expect_send(
        STORAGE_POWER_ACTOR_ADDR,
        ext::power::CURRENT_TOTAL_POWER_METHOD,
        RawBytes::default(),
        TokenAmount::zero(),
        RawBytes::serialize(current_power).unwrap(),
        ExitCode::OK,
    );
}

/// Publishes deals, expecting success. All deals are proposed by the same provider.
pub fn publish_deals(rt: &mut MockRuntime, deals: &[DealProposal]) -> Vec<DealID> {
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, WORKER);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);

    expect_provider_control_address(rt, PROVIDER);
    expect_query_network_info(rt);

    let mut params = PublishStorageDealsParams { deals: vec![] };

    for deal in deals {
        // Client signature is verified against the proposal bytes.
        let client_proposal = sign_proposal(deal);
        params.deals.push(client_proposal.clone());
        let serialized_proposal = to_vec(deal).unwrap();
        rt.expect_verify_signature(ExpectedVerifySig {
            sig: client_proposal.client_signature,
            signer: deal.client,
            plaintext: serialized_proposal,
            result: Ok(()),
        });

        if deal.verified_deal {
            let param = ext::verifreg::UseBytesParams {
                address: deal.client,
                deal_size: BigInt::from(deal.piece_size.0),
            };
            rt.expect_send(
                VERIFIED_REGISTRY_ACTOR_ADDR,
                ext::verifreg::USE_BYTES_METHOD,
                RawBytes::serialize(param).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }
    }

    let ret: PublishStorageDealsReturn = rt
        .call::<Actor>(
            Method::PublishStorageDeals as u64,
            &RawBytes::serialize(params).unwrap(),
        )
        .unwrap()
        .deserialize()
        .unwrap();
    rt.verify();

    assert_eq!(deals.len(), ret.ids.len());

    // The deals are stored and pending.
    for (i, deal_id) in ret.ids.iter().enumerate() {
        assert_eq!(deals[i], get_deal_proposal(rt, *deal_id));
    }

    ret.ids
}

pub fn activate_deals(
    rt: &mut MockRuntime,
    sector_expiry: ChainEpoch,
    provider: Address,
    current_epoch: ChainEpoch,
    deal_ids: &[DealID],
) {
    rt.set_epoch(current_epoch);
    rt.set_caller(*MINER_ACTOR_CODE_ID, provider);
    rt.expect_validate_caller_type(vec![Type::Miner]);

    let params = storage_actor_market::ActivateDealsParams {
        deal_ids: deal_ids.to_vec(),
        sector_expiry,
    };
    let result = rt
        .call::<Actor>(Method::ActivateDeals as u64, &RawBytes::serialize(params).unwrap())
        .unwrap();
    expect_empty(result);
    rt.verify();

    for deal_id in deal_ids {
        let state = get_deal_state(rt, *deal_id);
        assert_eq!(current_epoch, state.sector_start_epoch);
    }
}

pub fn terminate_deals(
    rt: &mut MockRuntime,
    provider: Address,
    epoch: ChainEpoch,
    deal_ids: &[DealID],
) {
    rt.set_caller(*MINER_ACTOR_CODE_ID, provider);
    rt.expect_validate_caller_type(vec![Type::Miner]);

    let params =
        storage_actor_market::OnMinerSectorsTerminateParams { epoch, deal_ids: deal_ids.to_vec() };
    let result = rt
        .call::<Actor>(
            Method::OnMinerSectorsTerminate as u64,
            &RawBytes::serialize(params).unwrap(),
        )
        .unwrap();
    expect_empty(result);
    rt.verify();
}

pub fn cron_tick(rt: &mut MockRuntime) {
    rt.set_caller(*CRON_ACTOR_CODE_ID, CRON_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![CRON_ACTOR_ADDR]);

    let result = rt.call::<Actor>(Method::CronTick as u64, &RawBytes::default()).unwrap();
    expect_empty(result);
    rt.verify();
}

pub fn get_deal_proposal(rt: &MockRuntime, deal_id: DealID) -> DealProposal {
    let state = get_state(rt);
    let deals = Array::<DealProposal, _>::load(&state.proposals, &rt.store).unwrap();
    deals.get(deal_id).unwrap().cloned().unwrap()
}

pub fn find_deal_proposal(rt: &MockRuntime, deal_id: DealID) -> Option<DealProposal> {
    let state = get_state(rt);
    let deals = Array::<DealProposal, _>::load(&state.proposals, &rt.store).unwrap();
    deals.get(deal_id).unwrap().cloned()
}

pub fn get_deal_state(rt: &MockRuntime, deal_id: DealID) -> DealState {
    let state = get_state(rt);
    let states = Array::<DealState, _>::load(&state.states, &rt.store).unwrap();
    *states.get(deal_id).unwrap().unwrap()
}

pub fn find_deal_state(rt: &MockRuntime, deal_id: DealID) -> Option<DealState> {
    let state = get_state(rt);
    let states = Array::<DealState, _>::load(&state.states, &rt.store).unwrap();
    states.get(deal_id).unwrap().copied()
}

pub fn get_escrow_balance(rt: &MockRuntime, addr: &Address) -> TokenAmount {
    let state = get_state(rt);
    state.get_escrow_balance(&rt.store, addr).unwrap()
}

pub fn get_locked_balance(rt: &MockRuntime, addr: &Address) -> TokenAmount {
    let state = get_state(rt);
    state.get_locked_balance(&rt.store, addr).unwrap()
}

/// The first epoch at which cron will process a newly published deal.
pub fn process_epoch(policy: &Policy, start_epoch: ChainEpoch, deal_id: DealID) -> ChainEpoch {
    let offset = deal_id as i64 % policy.deal_updates_interval;
    let q = QuantSpec { unit: policy.deal_updates_interval, offset: 0 };
    let prev_day = q.quantize_down(start_epoch);
    if prev_day + offset >= start_epoch {
        return prev_day + offset;
    }
    let next_day = q.quantize_up(start_epoch);
    next_day + offset
}

