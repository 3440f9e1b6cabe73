// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::RawBytes;
use fvm_shared::clock::EPOCH_UNDEFINED;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::METHOD_SEND;
use num_traits::Zero;

use storage_actors_runtime::BURNT_FUNDS_ACTOR_ADDR;

mod harness;
use harness::*;

#[test]
fn terminated_deal_is_settled_and_slashed_at_next_cron() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);

    // Activate, then terminate the containing sector some epochs after the start.
    activate_deals(&mut rt, end_epoch + 100, PROVIDER, 5, &deal_ids);

    let slash_epoch = start_epoch + 40;
    rt.set_epoch(slash_epoch);
    terminate_deals(&mut rt, PROVIDER, slash_epoch, &deal_ids);
    assert_eq!(slash_epoch, get_deal_state(&rt, deal_ids[0]).slash_epoch);

    let client_escrow_before = get_escrow_balance(&rt, &CLIENT);
    let provider_escrow_before = get_escrow_balance(&rt, &PROVIDER);

    // Cron settles the payment up to the slash epoch, refunds the client, and
    // burns the provider collateral.
    let cron_epoch = process_epoch(&rt.policy, start_epoch, deal_ids[0]);
    assert!(cron_epoch > slash_epoch);
    rt.set_epoch(cron_epoch);

    let payment = &deal.storage_price_per_epoch * (slash_epoch - start_epoch) as u64;

    rt.expect_send(
        BURNT_FUNDS_ACTOR_ADDR,
        METHOD_SEND,
        RawBytes::default(),
        deal.provider_collateral.clone(),
        RawBytes::default(),
        ExitCode::OK,
    );
    cron_tick(&mut rt);

    // Deal is deleted.
    assert!(find_deal_proposal(&rt, deal_ids[0]).is_none());
    assert!(find_deal_state(&rt, deal_ids[0]).is_none());

    // The client paid only for the epochs served; everything else unlocked.
    assert_eq!(client_escrow_before - &payment, get_escrow_balance(&rt, &CLIENT));
    assert_eq!(
        provider_escrow_before + &payment - deal.provider_collateral,
        get_escrow_balance(&rt, &PROVIDER)
    );
    assert!(get_locked_balance(&rt, &CLIENT).is_zero());
    assert!(get_locked_balance(&rt, &PROVIDER).is_zero());
}

#[test]
fn terminating_an_expired_deal_is_a_no_op() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);
    activate_deals(&mut rt, end_epoch + 100, PROVIDER, 5, &deal_ids);

    // Termination on or after the end epoch does not mark the deal slashed.
    rt.set_epoch(end_epoch);
    terminate_deals(&mut rt, PROVIDER, end_epoch, &deal_ids);
    assert_eq!(EPOCH_UNDEFINED, get_deal_state(&rt, deal_ids[0]).slash_epoch);
}

#[test]
fn ongoing_deal_is_paid_and_rescheduled_at_cron() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);
    activate_deals(&mut rt, end_epoch + 100, PROVIDER, 5, &deal_ids);

    let client_escrow_before = get_escrow_balance(&rt, &CLIENT);
    let provider_escrow_before = get_escrow_balance(&rt, &PROVIDER);

    let cron_epoch = process_epoch(&rt.policy, start_epoch, deal_ids[0]);
    rt.set_epoch(cron_epoch);
    cron_tick(&mut rt);

    // Incremental payment was transferred from client to provider escrow.
    let payment = &deal.storage_price_per_epoch * (cron_epoch - start_epoch) as u64;
    assert_eq!(client_escrow_before - &payment, get_escrow_balance(&rt, &CLIENT));
    assert_eq!(provider_escrow_before + &payment, get_escrow_balance(&rt, &PROVIDER));

    // The deal remains, updated, and is scheduled again in the future.
    let state = get_deal_state(&rt, deal_ids[0]);
    assert_eq!(cron_epoch, state.last_updated_epoch);
    assert_eq!(EPOCH_UNDEFINED, state.slash_epoch);
    assert!(find_deal_proposal(&rt, deal_ids[0]).is_some());
}
