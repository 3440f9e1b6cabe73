// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::consensus::{ConsensusFault, ConsensusFaultType};
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::METHOD_SEND;

use storage_actor_miner::{
    consensus_fault_penalty, reward_for_consensus_slash_report, Actor, Method,
    ReportConsensusFaultParams,
};
use storage_actors_runtime::runtime::builtins::Type;
use storage_actors_runtime::test_utils::{
    expect_abort_contains_message, expect_empty, MockRuntime, ACCOUNT_ACTOR_CODE_ID,
};
use storage_actors_runtime::BURNT_FUNDS_ACTOR_ADDR;

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

fn report_params() -> ReportConsensusFaultParams {
    ReportConsensusFaultParams {
        header1: vec![1; 16],
        header2: vec![2; 16],
        header_extra: vec![3, 3, 3],
    }
}

fn report_fault(
    h: &ActorHarness,
    rt: &mut MockRuntime,
    reporter: Address,
    fault_epoch: ChainEpoch,
    expect_success: bool,
) -> Result<(), storage_actors_runtime::ActorError> {
    let params = report_params();

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, reporter);
    rt.expect_validate_caller_type(vec![Type::Account, Type::Multisig]);
    rt.expect_verify_consensus_fault(
        params.header1.clone(),
        params.header2.clone(),
        params.header_extra.clone(),
        Some(ConsensusFault {
            target: h.receiver,
            epoch: fault_epoch,
            fault_type: ConsensusFaultType::DoubleForkMining,
        }),
        ExitCode::OK,
    );
    h.expect_query_network_info_reward_only(rt);

    if expect_success {
        let this_epoch_reward = TokenAmount::from_atto(h.epoch_reward_smooth.estimate());
        let penalty = consensus_fault_penalty(this_epoch_reward.clone());
        let reward = reward_for_consensus_slash_report(&this_epoch_reward);

        rt.expect_send(
            reporter,
            METHOD_SEND,
            RawBytes::default(),
            reward.clone(),
            RawBytes::default(),
            ExitCode::OK,
        );
        rt.expect_send(
            BURNT_FUNDS_ACTOR_ADDR,
            METHOD_SEND,
            RawBytes::default(),
            penalty - reward,
            RawBytes::default(),
            ExitCode::OK,
        );
    }

    let result = rt.call::<Actor>(
        Method::ReportConsensusFault as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    result.map(|ret| {
        expect_empty(ret);
        rt.verify();
    })
}

#[test]
fn reported_fault_pays_reporter_and_burns_the_rest() {
    let (h, mut rt) = setup();

    let reporter = Address::new_id(501);
    rt.actor_code_cids.insert(reporter, *ACCOUNT_ACTOR_CODE_ID);

    let fault_epoch = rt.epoch - 1;
    report_fault(&h, &mut rt, reporter, fault_epoch, true).unwrap();

    let info = h.get_info(&rt);
    assert_eq!(
        rt.epoch + rt.policy.consensus_fault_ineligibility_duration,
        info.consensus_fault_elapsed
    );
    h.check_state_invariants(&rt);
}

#[test]
fn pre_commit_is_forbidden_while_fault_is_active() {
    let (h, mut rt) = setup();

    let reporter = Address::new_id(501);
    rt.actor_code_cids.insert(reporter, *ACCOUNT_ACTOR_CODE_ID);
    report_fault(&h, &mut rt, reporter, rt.epoch - 1, true).unwrap();

    let deadline = h.deadline(&rt);
    let expiration = deadline.period_end() + 220 * rt.policy.wpost_proving_period;
    let params = h.make_pre_commit_params(100, rt.epoch - 1, expiration, vec![]);
    let result = h.try_pre_commit_sector(&mut rt, params, true);
    expect_abort_contains_message(
        ExitCode::USR_FORBIDDEN,
        "active consensus fault",
        result,
    );
    rt.reset();
}

#[test]
fn duplicate_report_within_exclusion_window_is_rejected() {
    let (h, mut rt) = setup();

    let reporter = Address::new_id(501);
    rt.actor_code_cids.insert(reporter, *ACCOUNT_ACTOR_CODE_ID);
    report_fault(&h, &mut rt, reporter, rt.epoch - 1, true).unwrap();

    // A second report of a fault within the exclusion window fails.
    let result = report_fault(&h, &mut rt, reporter, rt.epoch - 1, false);
    expect_abort_contains_message(ExitCode::USR_FORBIDDEN, "too old", result);
    rt.reset();
}
