// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

use storage_actors_runtime::test_utils::{expect_abort_contains_message, MockRuntime};

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
fn pre_commit_checks_and_records_deposit() {
    let (h, mut rt) = setup();

    let precommit_epoch = rt.epoch;
    let deadline = h.deadline(&rt);
    let expiration =
        deadline.period_end() + 220 * rt.policy.wpost_proving_period;

    let params = h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![]);
    let precommit = h.pre_commit_sector(&mut rt, params.clone(), true);

    assert_eq!(params.sector_number, precommit.info.sector_number);
    assert_eq!(precommit_epoch, precommit.pre_commit_epoch);
    assert!(precommit.deal_weight.is_zero());
    assert!(precommit.verified_deal_weight.is_zero());
    assert!(precommit.pre_commit_deposit.is_positive());

    let state = h.get_state(&rt);
    assert_eq!(state.pre_commit_deposits, precommit.pre_commit_deposit);
    assert!(state.deadline_cron_active);

    // The sector number is now allocated.
    let dup = h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, dup, false);
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "already allocated", result);
    rt.reset();

    h.check_state_invariants(&rt);
}

#[test]
fn rejects_seal_randomness_from_the_current_epoch() {
    let (h, mut rt) = setup();

    let deadline = h.deadline(&rt);
    let expiration = deadline.period_end() + 220 * rt.policy.wpost_proving_period;

    // Seal challenge exactly at the current epoch is too new.
    let params = h.make_pre_commit_params(100, rt.epoch, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "must be before now",
        result,
    );
    rt.reset();

    // One epoch earlier is accepted.
    let params = h.make_pre_commit_params(100, rt.epoch - 1, expiration, vec![]);
    h.pre_commit_sector(&mut rt, params, true);
    h.check_state_invariants(&rt);
}

#[test]
fn rejects_expired_seal_randomness() {
    let (h, mut rt) = setup();

    rt.set_epoch(rt.epoch + rt.policy.max_pre_commit_randomness_lookback + 10);
    let deadline = h.deadline(&rt);
    let expiration = deadline.period_end() + 220 * rt.policy.wpost_proving_period;

    let challenge = rt.epoch - rt.policy.max_pre_commit_randomness_lookback - 1;
    let params = h.make_pre_commit_params(100, challenge, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "too old", result);
    rt.reset();
}

#[test]
fn rejects_expiration_below_minimum_duration() {
    let (h, mut rt) = setup();

    // An expiration at exactly the minimum (accounting for the max activation
    // lag) is acceptable; one epoch below it is not.
    let max_activation = rt.epoch + h.max_prove_commit_duration(&rt);
    let min_expiration = max_activation + rt.policy.min_sector_expiration;

    let params = h.make_pre_commit_params(100, rt.epoch - 1, min_expiration - 1, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "must exceed", result);
    rt.reset();

    let params = h.make_pre_commit_params(100, rt.epoch - 1, min_expiration, vec![]);
    h.pre_commit_sector(&mut rt, params, true);
    h.check_state_invariants(&rt);
}

#[test]
fn rejects_expiration_past_max_extension() {
    let (h, mut rt) = setup();

    let expiration = rt.epoch + rt.policy.max_sector_expiration_extension + 1;
    let params = h.make_pre_commit_params(100, rt.epoch - 1, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "cannot be more than", result);
    rt.reset();
}

#[test]
fn rejects_capacity_upgrade_flag() {
    let (h, mut rt) = setup();

    let deadline = h.deadline(&rt);
    let expiration = deadline.period_end() + 220 * rt.policy.wpost_proving_period;

    let mut params = h.make_pre_commit_params(100, rt.epoch - 1, expiration, vec![]);
    params.replace_capacity = true;
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(ExitCode::USR_FORBIDDEN, "cc upgrade", result);
    rt.reset();
}

#[test]
fn rejects_insufficient_funds_for_deposit() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let mut rt = h.new_runtime();
    rt.set_epoch(PERIOD_OFFSET + 1);
    // Almost nothing in the bank.
    rt.balance.replace(fvm_shared::econ::TokenAmount::from_atto(1));
    h.construct_and_verify(&mut rt);

    let deadline = h.deadline(&rt);
    let expiration = deadline.period_end() + 220 * rt.policy.wpost_proving_period;
    let params = h.make_pre_commit_params(100, rt.epoch - 1, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(
        ExitCode::USR_INSUFFICIENT_FUNDS,
        "insufficient funds",
        result,
    );
    rt.reset();
}

#[test]
fn prove_commit_activates_sector_and_locks_pledge() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    assert_eq!(0, sector.sector_number);
    assert!(sector.initial_pledge.is_positive());

    let state = h.get_state(&rt);
    // Deposit has been returned to the pool and pledge locked.
    assert!(state.pre_commit_deposits.is_zero());
    assert_eq!(state.initial_pledge, sector.initial_pledge);
    assert!(state.get_precommitted_sector(&rt.store, 0).unwrap().is_none());

    // The sector has been assigned to a deadline and partition.
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);
    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.sectors.get(sector.sector_number));
    // Not yet proven.
    assert!(partition.unproven.get(sector.sector_number));

    h.check_state_invariants(&rt);
}
