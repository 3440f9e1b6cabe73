// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_bitfield::BitField;
use fvm_shared::clock::ChainEpoch;

use storage_actor_miner::power_for_sectors;

use storage_actors_runtime::test_utils::MockRuntime;

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
fn declared_fault_removes_power_immediately() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    // Prove the sector so it carries active power, then leave the challenge window.
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

    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    h.declare_faults(&mut rt, dl_idx, p_idx, sectors, power.clone());

    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.faults.get(sector.sector_number));
    assert_eq!(partition.faulty_power, power);
    let deadline = h.get_deadline(&rt, dl_idx);
    assert_eq!(deadline.faulty_power, power);

    h.check_state_invariants(&rt);
}

#[test]
fn fault_declaration_of_unproven_sector_removes_no_power() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    // Declare the never-proven sector faulty. Its power was never activated, so
    // no power update is sent.
    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    h.declare_faults(
        &mut rt,
        dl_idx,
        p_idx,
        sectors,
        storage_actor_miner::PowerPair::zero(),
    );

    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.faults.get(sector.sector_number));
    assert!(partition.unproven.is_empty());
    assert_eq!(partition.faulty_power, power_for_sectors(h.sector_size, &[sector]));

    h.check_state_invariants(&rt);
}

#[test]
fn redeclaration_of_fault_is_a_no_op() {
    let (mut h, mut rt) = setup();

    let sector = h.commit_sector(&mut rt, 220, true);
    let (dl_idx, p_idx) = h.get_deadline_and_partition(&rt, sector.sector_number);

    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    h.declare_faults(
        &mut rt,
        dl_idx,
        p_idx,
        sectors.clone(),
        storage_actor_miner::PowerPair::zero(),
    );

    // Declaring again changes nothing and sends no power update.
    h.declare_faults(&mut rt, dl_idx, p_idx, sectors, storage_actor_miner::PowerPair::zero());

    h.check_state_invariants(&rt);
}
