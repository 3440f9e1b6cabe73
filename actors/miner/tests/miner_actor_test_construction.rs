// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::RawBytes;
use fvm_shared::clock::EPOCH_UNDEFINED;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use storage_actor_miner::{Actor, GetControlAddressesReturn, Method};

mod util;
use util::ActorHarness;

#[test]
fn simple_construction() {
    let period_offset = 100;
    let h = ActorHarness::new(period_offset);
    let mut rt = h.new_runtime();
    rt.set_epoch(5);
    rt.balance.replace(TokenAmount::from_whole(1));

    h.construct_and_verify(&mut rt);

    let state = h.get_state(&rt);
    let info = h.get_info(&rt);

    assert_eq!(h.owner, info.owner);
    assert_eq!(h.worker, info.worker);
    assert_eq!(h.control_addrs, info.control_addresses);
    assert_eq!(h.window_post_proof_type, info.window_post_proof_type);
    assert_eq!(h.sector_size, info.sector_size);
    assert_eq!(h.partition_size, info.window_post_partition_sectors);
    assert!(info.pending_worker_key.is_none());
    assert!(info.pending_owner_address.is_none());
    assert_eq!(EPOCH_UNDEFINED, info.consensus_fault_elapsed);

    assert!(state.pre_commit_deposits.is_zero());
    assert!(state.locked_funds.is_zero());
    assert!(state.initial_pledge.is_zero());
    assert!(state.fee_debt.is_zero());
    assert!(!state.deadline_cron_active);

    // The proving period start is the epoch offset less one period, since the
    // current epoch (5) is before the offset.
    assert_eq!(period_offset - rt.policy.wpost_proving_period, state.proving_period_start);
    assert!(state.proving_period_start <= rt.epoch);
    assert!(state.early_terminations.is_empty());

    // All deadlines are empty.
    let deadlines = state.load_deadlines(&rt.store).unwrap();
    deadlines
        .for_each(&rt.policy, &rt.store, |_, deadline| {
            assert_eq!(0, deadline.live_sectors);
            assert_eq!(0, deadline.total_sectors);
            assert!(deadline.partitions_posted.is_empty());
            assert!(deadline.early_terminations.is_empty());
            assert!(deadline.faulty_power.is_zero());
            Ok(())
        })
        .unwrap();

    h.check_state_invariants(&rt);
}

#[test]
fn control_addresses_are_resolved_during_construction() {
    let h = ActorHarness::new(100);
    let mut rt = h.new_runtime();
    rt.set_epoch(5);

    h.construct_and_verify(&mut rt);

    rt.expect_validate_caller_any();
    let result: GetControlAddressesReturn = rt
        .call::<Actor>(Method::ControlAddresses as u64, &RawBytes::default())
        .unwrap()
        .deserialize()
        .unwrap();
    rt.verify();

    assert_eq!(h.owner, result.owner);
    assert_eq!(h.worker, result.worker);
    assert_eq!(h.control_addrs, result.control_addresses);
}

#[test]
fn fails_if_control_addresses_exceed_maximum() {
    let mut h = ActorHarness::new(100);
    let mut rt = h.new_runtime();
    rt.set_epoch(5);

    h.control_addrs = (0..=rt.policy.max_control_addresses as u64)
        .map(|i| fvm_shared::address::Address::new_id(500 + i))
        .collect();

    let params = storage_actor_miner::MinerConstructorParams {
        owner: h.owner,
        worker: h.worker,
        control_addresses: h.control_addrs.clone(),
        window_post_proof_type: h.window_post_proof_type,
        peer_id: vec![0],
        multi_addresses: vec![],
    };

    rt.set_caller(
        *storage_actors_runtime::test_utils::INIT_ACTOR_CODE_ID,
        storage_actors_runtime::INIT_ACTOR_ADDR,
    );
    rt.expect_validate_caller_addr(vec![storage_actors_runtime::INIT_ACTOR_ADDR]);
    let result = rt.call::<Actor>(
        Method::Constructor as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    storage_actors_runtime::test_utils::expect_abort(
        fvm_shared::error::ExitCode::USR_ILLEGAL_ARGUMENT,
        result,
    );
    rt.verify();
}

#[test]
fn fails_if_peer_id_too_large() {
    let h = ActorHarness::new(100);
    let mut rt = h.new_runtime();
    rt.set_epoch(5);

    let params = storage_actor_miner::MinerConstructorParams {
        owner: h.owner,
        worker: h.worker,
        control_addresses: vec![],
        window_post_proof_type: h.window_post_proof_type,
        peer_id: vec![0; rt.policy.max_peer_id_length + 1],
        multi_addresses: vec![],
    };

    rt.set_caller(
        *storage_actors_runtime::test_utils::INIT_ACTOR_CODE_ID,
        storage_actors_runtime::INIT_ACTOR_ADDR,
    );
    rt.expect_validate_caller_addr(vec![storage_actors_runtime::INIT_ACTOR_ADDR]);
    let result = rt.call::<Actor>(
        Method::Constructor as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    storage_actors_runtime::test_utils::expect_abort(
        fvm_shared::error::ExitCode::USR_ILLEGAL_ARGUMENT,
        result,
    );
    rt.verify();
}
