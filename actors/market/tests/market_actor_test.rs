// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::RawBytes;
use fvm_shared::clock::EPOCH_UNDEFINED;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

use storage_actor_market::{Actor, AddBalanceParams, Method, WithdrawBalanceParams};
use storage_actors_runtime::runtime::builtins::Type;
use storage_actors_runtime::test_utils::{
    expect_abort_contains_message, ACCOUNT_ACTOR_CODE_ID,
};

mod harness;
use harness::*;

#[test]
fn simple_construction() {
    let rt = setup();
    let state = get_state(&rt);

    assert_eq!(EPOCH_UNDEFINED, state.last_cron);
    assert_eq!(0, state.next_id);
    assert!(state.total_client_locked_collateral.is_zero());
    assert!(state.total_provider_locked_collateral.is_zero());
    assert!(state.total_client_storage_fee.is_zero());
    assert!(state.total_locked().is_zero());
}

#[test]
fn adds_to_provider_escrow_funds() {
    let mut rt = setup();

    for (amount, total) in [(10, 10), (20, 30), (40, 70)] {
        add_provider_funds(&mut rt, TokenAmount::from_atto(amount));
        assert_eq!(TokenAmount::from_atto(total), get_escrow_balance(&rt, &PROVIDER));
    }
}

#[test]
fn adds_to_non_provider_funds() {
    let mut rt = setup();

    for (amount, total) in [(10, 10), (20, 30), (40, 70)] {
        add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(amount));
        assert_eq!(TokenAmount::from_atto(total), get_escrow_balance(&rt, &CLIENT));
    }
}

#[test]
fn fails_unless_called_by_an_account_actor() {
    let mut rt = setup();

    rt.set_value(TokenAmount::from_atto(10));
    rt.set_caller(*storage_actors_runtime::test_utils::MINER_ACTOR_CODE_ID, PROVIDER);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);

    let params = AddBalanceParams { provider_or_client: PROVIDER };
    let result =
        rt.call::<Actor>(Method::AddBalance as u64, &RawBytes::serialize(params).unwrap());
    expect_abort_contains_message(ExitCode::USR_FORBIDDEN, "forbidden", result);
    rt.verify();
}

#[test]
fn rejects_non_positive_deposit() {
    let mut rt = setup();

    rt.set_value(TokenAmount::zero());
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, CLIENT);

    let params = AddBalanceParams { provider_or_client: CLIENT };
    let result =
        rt.call::<Actor>(Method::AddBalance as u64, &RawBytes::serialize(params).unwrap());
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "balance to add must be greater than zero",
        result,
    );
    rt.reset();
}

#[test]
fn withdraws_limited_to_available_escrow() {
    let mut rt = setup();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(100));

    // Withdrawing part of the balance yields the requested amount.
    withdraw_client_balance(&mut rt, TokenAmount::from_atto(30), TokenAmount::from_atto(30));
    assert_eq!(TokenAmount::from_atto(70), get_escrow_balance(&rt, &CLIENT));

    // Requesting more than remains yields the entire remaining balance.
    withdraw_client_balance(&mut rt, TokenAmount::from_atto(200), TokenAmount::from_atto(70));
    assert_eq!(TokenAmount::zero(), get_escrow_balance(&rt, &CLIENT));
}

#[test]
fn withdraw_rejects_negative_amount() {
    let mut rt = setup();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(100));

    let params = WithdrawBalanceParams {
        provider_or_client: CLIENT,
        amount: TokenAmount::from_atto(-1),
    };
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, CLIENT);
    let result =
        rt.call::<Actor>(Method::WithdrawBalance as u64, &RawBytes::serialize(params).unwrap());
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "negative amount", result);
    rt.reset();
}

#[test]
fn publish_a_deal_and_lock_balances() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);
    assert_eq!(vec![0], deal_ids);

    // Client balance requirement and provider collateral are locked.
    assert_eq!(deal.client_balance_requirement(), get_locked_balance(&rt, &CLIENT));
    assert_eq!(deal.provider_collateral, get_locked_balance(&rt, &PROVIDER));

    let state = get_state(&rt);
    assert_eq!(1, state.next_id);
    assert_eq!(deal.total_storage_fee(), state.total_client_storage_fee);
    assert_eq!(deal.client_collateral, state.total_client_locked_collateral);
    assert_eq!(deal.provider_collateral, state.total_provider_locked_collateral);

    // Not yet activated.
    assert!(find_deal_state(&rt, deal_ids[0]).is_none());
}

#[test]
fn publish_rejects_deal_with_start_in_the_past() {
    let mut rt = setup();
    rt.set_epoch(50);

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();
    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);

    // The lone deal is dropped as invalid, so the batch has no valid deals.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, WORKER);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);
    expect_provider_control_address(&mut rt, PROVIDER);
    expect_query_network_info(&mut rt);
    let signed = sign_proposal(&deal);
    rt.expect_verify_signature(storage_actors_runtime::test_utils::ExpectedVerifySig {
        sig: signed.client_signature.clone(),
        signer: deal.client,
        plaintext: fvm_ipld_encoding::to_vec(&deal).unwrap(),
        result: Ok(()),
    });

    let params = storage_actor_market::PublishStorageDealsParams { deals: vec![signed] };
    let result = rt.call::<Actor>(
        Method::PublishStorageDeals as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "All deal proposals invalid",
        result,
    );
    rt.reset();
}

#[test]
fn activation_records_sector_start() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal]);

    activate_deals(&mut rt, end_epoch + 100, PROVIDER, 5, &deal_ids);

    let state = get_deal_state(&rt, deal_ids[0]);
    assert_eq!(5, state.sector_start_epoch);
    assert_eq!(EPOCH_UNDEFINED, state.last_updated_epoch);
    assert_eq!(EPOCH_UNDEFINED, state.slash_epoch);
}

#[test]
fn activation_rejects_duplicate_use_of_a_deal() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal]);
    activate_deals(&mut rt, end_epoch + 100, PROVIDER, 5, &deal_ids);

    // A second sector activating the same deal fails.
    rt.set_caller(*storage_actors_runtime::test_utils::MINER_ACTOR_CODE_ID, PROVIDER);
    rt.expect_validate_caller_type(vec![Type::Miner]);
    let params = storage_actor_market::ActivateDealsParams {
        deal_ids: deal_ids.clone(),
        sector_expiry: end_epoch + 100,
    };
    let result =
        rt.call::<Actor>(Method::ActivateDeals as u64, &RawBytes::serialize(params).unwrap());
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "already included in another sector",
        result,
    );
    rt.reset();
}
