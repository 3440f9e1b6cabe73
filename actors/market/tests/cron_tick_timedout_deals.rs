// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::RawBytes;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::METHOD_SEND;
use num_traits::Zero;

use storage_actor_market::ext;
use storage_actors_runtime::{BURNT_FUNDS_ACTOR_ADDR, VERIFIED_REGISTRY_ACTOR_ADDR};

mod harness;
use harness::*;

#[test]
fn deal_not_activated_by_start_is_slashed_for_init_timeout() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);

    let client_escrow_before = get_escrow_balance(&rt, &CLIENT);
    let provider_escrow_before = get_escrow_balance(&rt, &PROVIDER);

    // The deal was never activated; cron at its scheduled epoch slashes the
    // provider collateral and releases everything else.
    let curr = process_epoch(&rt.policy, start_epoch, deal_ids[0]);
    rt.set_epoch(curr);

    rt.expect_send(
        BURNT_FUNDS_ACTOR_ADDR,
        METHOD_SEND,
        RawBytes::default(),
        deal.provider_collateral.clone(),
        RawBytes::default(),
        ExitCode::OK,
    );
    cron_tick(&mut rt);

    // Proposal and pending entry are gone; nothing remains locked.
    assert!(find_deal_proposal(&rt, deal_ids[0]).is_none());
    assert!(find_deal_state(&rt, deal_ids[0]).is_none());
    assert!(get_locked_balance(&rt, &CLIENT).is_zero());
    assert!(get_locked_balance(&rt, &PROVIDER).is_zero());

    // Client keeps its escrow; provider lost exactly the collateral.
    assert_eq!(client_escrow_before, get_escrow_balance(&rt, &CLIENT));
    assert_eq!(
        provider_escrow_before - deal.provider_collateral,
        get_escrow_balance(&rt, &PROVIDER)
    );

    let state = get_state(&rt);
    assert_eq!(rt.epoch, state.last_cron);
}

#[test]
fn timed_out_verified_deal_restores_data_cap() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, true);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);

    let curr = process_epoch(&rt.policy, start_epoch, deal_ids[0]);
    rt.set_epoch(curr);

    // The verified bytes are restored after the collateral slash.
    let restore = ext::verifreg::RestoreBytesParams {
        address: CLIENT,
        deal_size: BigInt::from(deal.piece_size.0),
    };
    rt.expect_send(
        VERIFIED_REGISTRY_ACTOR_ADDR,
        ext::verifreg::RESTORE_BYTES_METHOD,
        RawBytes::serialize(restore).unwrap(),
        TokenAmount::zero(),
        RawBytes::default(),
        ExitCode::OK,
    );
    rt.expect_send(
        BURNT_FUNDS_ACTOR_ADDR,
        METHOD_SEND,
        RawBytes::default(),
        deal.provider_collateral.clone(),
        RawBytes::default(),
        ExitCode::OK,
    );
    cron_tick(&mut rt);

    assert!(find_deal_proposal(&rt, deal_ids[0]).is_none());
}

#[test]
fn cron_is_idempotent_at_the_same_epoch() {
    let mut rt = setup();
    rt.set_epoch(5);

    let start_epoch = 10;
    let end_epoch = start_epoch + default_deal_lifetime();

    add_participant_funds(&mut rt, CLIENT, TokenAmount::from_atto(10_000_000u64));
    add_provider_funds(&mut rt, TokenAmount::from_atto(1_000_000u64));

    let deal = generate_deal_proposal(CLIENT, PROVIDER, start_epoch, end_epoch, false);
    let deal_ids = publish_deals(&mut rt, &[deal.clone()]);

    let curr = process_epoch(&rt.policy, start_epoch, deal_ids[0]);
    rt.set_epoch(curr);
    rt.expect_send(
        BURNT_FUNDS_ACTOR_ADDR,
        METHOD_SEND,
        RawBytes::default(),
        deal.provider_collateral,
        RawBytes::default(),
        ExitCode::OK,
    );
    cron_tick(&mut rt);

    // A second tick at the same epoch processes no epochs and changes nothing.
    cron_tick(&mut rt);

    let state = get_state(&rt);
    assert_eq!(rt.epoch, state.last_cron);
}
