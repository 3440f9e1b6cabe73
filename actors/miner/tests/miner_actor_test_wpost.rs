// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;

use storage_actor_miner::{
    Actor, Method, PoStPartition, PowerPair, SubmitWindowedPoStParams,
};
use storage_actors_runtime::runtime::DomainSeparationTag;
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
fn successful_post_activates_unproven_power() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    let dl_info = h.advance_to_deadline(&mut rt, dl_idx);

    // The first post for the sector activates its power.
    let power = h.sector_power(&[sector.clone()]);
    h.submit_window_post(
        &mut rt,
        &dl_info,
        p_idx,
        BitField::new(),
        vec![sector.clone()],
        power,
        false,
    );

    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.unproven.is_empty());
    assert!(partition.faults.is_empty());

    let deadline = h.get_deadline(&rt, dl_idx);
    assert!(deadline.partitions_posted.get(p_idx));
    // The proof was recorded for optimistic verification, not verified.
    let proofs = deadline.pending_proofs_amt(&rt.store).unwrap();
    assert_eq!(1, proofs.count());

    h.check_state_invariants(&rt);
}

#[test]
fn post_accepted_at_first_and_last_window_epochs() {
    // First epoch of the window.
    {
        let (mut h, mut rt) = setup();
        let sector = h.commit_sector(&mut rt, 220, true);
        let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

        let dl_info = h.advance_to_deadline(&mut rt, dl_idx);
        rt.set_epoch(dl_info.open);
        let power = h.sector_power(&[sector.clone()]);
        h.submit_window_post(
            &mut rt,
            &dl_info,
            p_idx,
            BitField::new(),
            vec![sector],
            power,
            false,
        );
    }

    // Very last epoch of the window.
    {
        let (mut h, mut rt) = setup();
        let sector = h.commit_sector(&mut rt, 220, true);
        let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

        let dl_info = h.advance_to_deadline(&mut rt, dl_idx);
        rt.set_epoch(dl_info.last());
        let power = h.sector_power(&[sector.clone()]);
        h.submit_window_post(
            &mut rt,
            &dl_info,
            p_idx,
            BitField::new(),
            vec![sector],
            power,
            false,
        );
    }
}

#[test]
fn rejects_post_for_wrong_deadline() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    let dl_info = h.advance_to_deadline(&mut rt, dl_idx);

    let wrong_deadline = (dl_idx + 1) % rt.policy.wpost_period_deadlines;
    let commit_rand = [0x1u8; 32];
    rt.expect_validate_caller_addr(h.caller_addrs());
    rt.expect_get_randomness_from_tickets(
        DomainSeparationTag::PoStChainCommit,
        dl_info.challenge,
        vec![],
        commit_rand,
    );

    let params = SubmitWindowedPoStParams {
        deadline: wrong_deadline,
        partitions: vec![PoStPartition { index: p_idx, skipped: BitField::new() }],
        proofs: h.make_post_proofs(),
        chain_commit_epoch: dl_info.challenge,
        chain_commit_rand: Randomness(commit_rand.into()),
    };
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let result = rt.call::<Actor>(
        Method::SubmitWindowedPoSt as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "invalid deadline", result);
    rt.reset();
}

#[test]
fn rejects_chain_commit_epoch_in_the_future() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    let dl_info = h.advance_to_deadline(&mut rt, dl_idx);

    rt.expect_validate_caller_addr(h.caller_addrs());
    let params = SubmitWindowedPoStParams {
        deadline: dl_idx,
        partitions: vec![PoStPartition { index: p_idx, skipped: BitField::new() }],
        proofs: h.make_post_proofs(),
        chain_commit_epoch: rt.epoch,
        chain_commit_rand: Randomness(vec![0x1; 32]),
    };
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let result = rt.call::<Actor>(
        Method::SubmitWindowedPoSt as u64,
        &RawBytes::serialize(params).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "must be less than the current epoch",
        result,
    );
    rt.reset();
}

#[test]
fn skipped_sectors_become_faulty_without_proven_power() {
    let (mut h, mut rt) = setup();

    // Commit two sectors in the same batch so they share a partition.
    let sector_a = h.commit_sector(&mut rt, 220, true);
    let sector_b = h.commit_sector(&mut rt, 221, false);
    let (dl_idx_a, p_idx_a) = h.get_deadline_and_partition(&rt, sector_a.sector_number);
    let (dl_idx_b, _) = h.get_deadline_and_partition(&rt, sector_b.sector_number);

    // Both sectors are assigned to the same (first non-empty) deadline only if the
    // assignment put them together; handle the general case by just proving A's
    // partition and skipping B when they share one.
    if dl_idx_a != dl_idx_b {
        // Nothing further to check in this arrangement.
        return;
    }

    let dl_info = h.advance_to_deadline(&mut rt, dl_idx_a);

    let mut skipped = BitField::new();
    skipped.set(sector_b.sector_number);

    // Power delta: A's power activates; B was unproven so no power is removed for it.
    let power = h.sector_power(&[sector_a.clone()]);
    h.submit_window_post(
        &mut rt,
        &dl_info,
        p_idx_a,
        skipped,
        vec![sector_a.clone(), sector_b.clone()],
        power,
        false,
    );

    let partition = h.get_partition(&rt, dl_idx_a, p_idx_a);
    assert!(partition.faults.get(sector_b.sector_number));
    assert!(!partition.faults.get(sector_a.sector_number));

    h.check_state_invariants(&rt);
}
