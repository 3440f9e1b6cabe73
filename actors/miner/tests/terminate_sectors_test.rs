// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;

use storage_actor_miner::{
    pledge_penalty_for_termination, qa_power_for_sector, Actor, Method, TerminateSectorsParams,
    TerminationDeclaration, WithdrawBalanceParams,
};
use storage_actors_runtime::test_utils::{
    expect_abort_contains_message, MockRuntime, ACCOUNT_ACTOR_CODE_ID,
};

mod util;
use util::{big_balance, ActorHarness};

const PERIOD_OFFSET: ChainEpoch = 100;

fn setup() -> (ActorHarness, MockRuntime) {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let mut rt = h.new_runtime();
    rt.set_epoch(PERIOD_OFFSET + 1);
    rt.balance.replace(big_balance());

    h.construct_and_verify(&mut rt);
    (h, rt)
}

#[test]
fn terminates_a_proven_sector_and_burns_the_fee() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    // Prove the sector, then close its deadline so it becomes mutable again.
    let dl_info = h.advance_to_deadline(&mut rt, dl_idx);
    let power = h.sector_power(&[sector.clone()]);
    h.submit_window_post(
        &mut rt,
        &dl_info,
        p_idx,
        BitField::new(),
        vec![sector.clone()],
        power.clone(),
        false,
    );
    h.advance_deadline(&mut rt);

    let sector_age = rt.epoch - sector.activation;
    let sector_power = qa_power_for_sector(h.sector_size, &sector);
    let expected_fee = pledge_penalty_for_termination(
        &sector.expected_day_reward,
        sector_age,
        &sector.expected_storage_pledge,
        &h.epoch_qa_power_smooth,
        &sector_power,
        &h.epoch_reward_smooth,
        &sector.replaced_day_reward,
        sector.replaced_sector_age,
    );

    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    let ret = h.terminate_sectors(
        &mut rt,
        dl_idx,
        p_idx,
        sectors,
        expected_fee,
        -sector.initial_pledge.clone(),
        -power,
    );
    assert!(ret.done);

    let state = h.get_state(&rt);
    assert!(state.initial_pledge.is_zero());
    assert!(state.early_terminations.is_empty());

    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.terminated.get(sector.sector_number));
    assert!(!partition.faults.get(sector.sector_number));
    assert!(partition.live_sectors().is_empty());

    h.check_state_invariants(&rt);
}

#[test]
fn rejects_termination_in_immutable_deadline() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    // The deadline is currently open: terminations are forbidden.
    h.advance_to_deadline(&mut rt, dl_idx);

    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    let params = TerminateSectorsParams {
        terminations: vec![TerminationDeclaration { deadline: dl_idx, partition: p_idx, sectors }],
    };

    rt.expect_validate_caller_addr(h.caller_addrs());
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let result = rt.call::<Actor>(
        Method::TerminateSectors as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "immutable deadline",
        result,
    );
    rt.reset();

    h.check_state_invariants(&rt);
}

#[test]
fn rejects_too_many_declarations() {
    let (h, mut rt) = setup();

    let terminations = (0..=rt.policy.declarations_max)
        .map(|i| TerminationDeclaration {
            deadline: 0,
            partition: i,
            sectors: BitField::new(),
        })
        .collect();
    let params = TerminateSectorsParams { terminations };

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let result = rt.call::<Actor>(
        Method::TerminateSectors as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "too many declarations", result);
    rt.reset();
}

#[test]
fn withdrawal_is_forbidden_while_terminations_are_pending() {
    // Build a state with a pending early termination directly, then attempt a withdrawal.
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, _) = h.get_deadline_and_partition(&rt, sector.sector_number);

    // Manufacture a pending early-termination flag; the drain in TerminateSectors
    // normally clears this within the same call, so poke state directly.
    let mut state = h.get_state(&rt);
    state.early_terminations.set(dl_idx);
    rt.replace_state(&state);

    rt.expect_validate_caller_addr(vec![h.owner]);
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.owner);
    let params = WithdrawBalanceParams {
        amount_requested: fvm_shared::econ::TokenAmount::from_atto(1),
    };
    let result = rt.call::<Actor>(
        Method::WithdrawBalance as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_FORBIDDEN, "cannot withdraw funds", result);
    rt.reset();
}
