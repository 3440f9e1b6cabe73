// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::math::PRECISION;
use fvm_shared::sector::StoragePower;
use fvm_shared::smooth::{self, FilterEstimate};
use lazy_static::lazy_static;
use num_traits::{Signed, Zero};
use storage_actors_runtime::network::EPOCHS_IN_DAY;
use storage_actors_runtime::EXPECTED_LEADERS_PER_EPOCH;

use super::{VestSpec, REWARD_VESTING_SPEC};

// Everything here is denominated in projected block reward, "BR(t, d)": the
// reward a quantity of QA power is expected to earn over d epochs starting at
// t, extrapolated from the smoothed reward and network-power estimates.

/// Days of projected reward deposited when pre-committing; forfeited if the
/// commitment never proves.
const PRE_COMMIT_DEPOSIT_DAYS: ChainEpoch = 20;
pub const PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD: ChainEpoch =
    PRE_COMMIT_DEPOSIT_DAYS * EPOCHS_IN_DAY;

/// Days of projected reward forming the storage-pledge half of the initial
/// pledge; lost pro-rata when a sector is cut short.
const INITIAL_PLEDGE_DAYS: ChainEpoch = 20;
pub const INITIAL_PLEDGE_PROJECTION_PERIOD: ChainEpoch = INITIAL_PLEDGE_DAYS * EPOCHS_IN_DAY;

// The consensus-pledge half of the initial pledge targets a 30% share of the
// circulating supply, apportioned by the sector's share of (at least) the
// network baseline power.
const LOCK_TARGET_NUM: u32 = 3;
const LOCK_TARGET_DENOM: u32 = 10;

// Continued faults pay 3.51 days of projected reward per deadline close spent
// faulty, conservatively assuming the sector lapsed right after its last good
// proof.
const CONTINUED_FAULT_DAYS_NUM: i64 = 351;
const CONTINUED_FAULT_DAYS_DENOM: i64 = 100;
pub const CONTINUED_FAULT_PROJECTION_PERIOD: ChainEpoch =
    EPOCHS_IN_DAY * CONTINUED_FAULT_DAYS_NUM / CONTINUED_FAULT_DAYS_DENOM;

// Floor for the termination penalty: the undeclared-fault projection.
const TERMINATION_FLOOR_PROJECTION_PERIOD: ChainEpoch = EPOCHS_IN_DAY * 35 / 10;

/// Termination charges half the sector's daily reward per day of age, capped
/// at this many days.
pub const TERMINATION_LIFETIME_CAP: ChainEpoch = 140;
pub const TERMINATION_REWARD_FACTOR_NUM: u32 = 1;
pub const TERMINATION_REWARD_FACTOR_DENOM: u32 = 2;

/// An invalidated optimistic proof costs a continued fault plus two extra days
/// of projection, on top of the flat base penalty.
const INVALID_WINDOW_POST_PROJECTION_PERIOD: ChainEpoch =
    CONTINUED_FAULT_PROJECTION_PERIOD + 2 * EPOCHS_IN_DAY;

/// A consensus fault costs five expected whole-block rewards.
const CONSENSUS_FAULT_REWARD_MULTIPLE: u64 = 5;

// Rewards vest 3/4 locked, 1/4 immediate.
const LOCKED_REWARD_NUM: u32 = 3;
const LOCKED_REWARD_DENOM: u32 = 4;

lazy_static! {
    /// Absolute ceiling on initial pledge: one whole token per 32 GiB of QA power.
    static ref INITIAL_PLEDGE_CAP_PER_BYTE: TokenAmount =
        TokenAmount::from_whole(1).div_floor(32i64 << 30);

    /// Flat reward paid for a successful Window PoSt dispute.
    pub static ref BASE_REWARD_FOR_DISPUTED_WINDOW_POST: TokenAmount = TokenAmount::from_whole(4);

    /// Flat penalty charged for a successful Window PoSt dispute.
    pub static ref BASE_PENALTY_FOR_DISPUTED_WINDOW_POST: TokenAmount =
        TokenAmount::from_whole(20);

    /// Floor price for aggregate-fee gas, so batching never becomes free.
    static ref BATCH_BALANCER: TokenAmount = TokenAmount::from_nano(5);

    // Calibrated single-message gas costs underlying the aggregate fees.
    static ref SINGLE_PROVE_COMMIT_GAS: BigInt = BigInt::from(49299973);
    static ref SINGLE_PRE_COMMIT_GAS: BigInt = BigInt::from(16433324);
}

/// BR(t, d): projected reward for `qa_power` over `projection_duration`
/// epochs, in Q.128 smoothing arithmetic. Degenerates to the raw reward
/// estimate when the network reports no power at all.
pub fn expected_reward_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    if network_qa_power_estimate.estimate().is_zero() {
        return TokenAmount::from_atto(reward_estimate.estimate());
    }

    let cumulative_ratio = smooth::extrapolated_cum_sum_of_ratio(
        projection_duration,
        0,
        reward_estimate,
        network_qa_power_estimate,
    );
    let br_q128 = qa_power * cumulative_ratio;
    TokenAmount::from_atto(cmp::max(br_q128 >> PRECISION, BigInt::zero()))
}

/// BR(t, d) floored at one atto. Deposit and pledge amounts must be strictly
/// positive so that a zero in the books unambiguously means "nothing at
/// stake".
pub fn reward_at_least_one_atto(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let br = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        projection_duration,
    );
    cmp::max(br, TokenAmount::from_atto(1))
}

/// FF(t): the fee for a sector staying faulty through a deadline close.
pub fn pledge_penalty_for_continued_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        CONTINUED_FAULT_PROJECTION_PERIOD,
    )
}

/// SP(t): lower bound on the termination penalty.
pub fn pledge_penalty_for_termination_lower_bound(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        TERMINATION_FLOOR_PROJECTION_PERIOD,
    )
}

/// The fee for retiring a sector ahead of its commitment: the twenty-day
/// pledge recorded at activation, plus half the sector's recorded daily reward
/// for each day of age up to the cap — a replaced sector's prior life counts
/// toward the cap too — floored by SP(t).
#[allow(clippy::too_many_arguments)]
pub fn pledge_penalty_for_termination(
    day_reward: &TokenAmount,
    sector_age: ChainEpoch,
    twenty_day_reward_at_activation: &TokenAmount,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    replaced_day_reward: &TokenAmount,
    replaced_sector_age: ChainEpoch,
) -> TokenAmount {
    let age_cap = TERMINATION_LIFETIME_CAP * EPOCHS_IN_DAY;

    let counted_age = cmp::min(sector_age, age_cap);
    let counted_replaced_age = cmp::min(replaced_sector_age, age_cap - counted_age);

    let earned = day_reward * counted_age + replaced_day_reward * counted_replaced_age;
    let age_charge =
        (earned * TERMINATION_REWARD_FACTOR_NUM).div_floor(TERMINATION_REWARD_FACTOR_DENOM);

    cmp::max(
        pledge_penalty_for_termination_lower_bound(
            reward_estimate,
            network_qa_power_estimate,
            qa_power,
        ),
        twenty_day_reward_at_activation + age_charge.div_floor(EPOCHS_IN_DAY),
    )
}

/// The penalty for having an optimistically accepted proof invalidated.
pub fn pledge_penalty_for_invalid_windowpost(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        INVALID_WINDOW_POST_PROJECTION_PERIOD,
    ) + &*BASE_PENALTY_FOR_DISPUTED_WINDOW_POST
}

/// The deposit securing a pre-commitment: BR over the deposit projection.
pub fn pre_commit_deposit_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_power: &StoragePower,
) -> TokenAmount {
    reward_at_least_one_atto(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD,
    )
}

/// IP(t) = IPBase(t) + AdditionalIP(t).
///
/// The base is twenty days of projected reward. The additional part ties up a
/// share of the circulating supply: 30% of supply, times the sector's share of
/// the larger of network power and the baseline (so that early networks still
/// charge as if at baseline). The total is capped at one token per 32 GiB.
pub fn initial_pledge_for_power(
    qa_power: &StoragePower,
    baseline_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    circulating_supply: &TokenAmount,
) -> TokenAmount {
    let ip_base = reward_at_least_one_atto(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        INITIAL_PLEDGE_PROJECTION_PERIOD,
    );

    let network_power = network_qa_power_estimate.estimate();
    let power_share_denom = cmp::max(cmp::max(&network_power, baseline_power), qa_power);

    let lock_share_num = circulating_supply.atto() * LOCK_TARGET_NUM * qa_power;
    let lock_share_denom = power_share_denom * LOCK_TARGET_DENOM;
    let additional_ip = lock_share_num.div_floor(&lock_share_denom);

    let pledge = ip_base + TokenAmount::from_atto(additional_ip);
    let cap = TokenAmount::from_atto(INITIAL_PLEDGE_CAP_PER_BYTE.atto() * qa_power);
    cmp::min(pledge, cap)
}

pub fn consensus_fault_penalty(this_epoch_reward: TokenAmount) -> TokenAmount {
    (this_epoch_reward * CONSENSUS_FAULT_REWARD_MULTIPLE)
        .div_floor(EXPECTED_LEADERS_PER_EPOCH)
}

/// Splits a reward into the portion to lock and the schedule to lock it on.
pub fn locked_reward_from_reward(reward: TokenAmount) -> (TokenAmount, &'static VestSpec) {
    let locked = (reward * LOCKED_REWARD_NUM).div_floor(LOCKED_REWARD_DENOM);
    (locked, &REWARD_VESTING_SPEC)
}

// Aggregated commitments pay 1/20th of the gas they would have cost as
// individual messages, priced at the base fee floored by the batch balancer.
const AGGREGATE_FEE_NUM: u32 = 1;
const AGGREGATE_FEE_DENOM: u32 = 20;

pub fn aggregate_prove_commit_network_fee(
    aggregate_size: i64,
    base_fee: &TokenAmount,
) -> TokenAmount {
    aggregate_network_fee(aggregate_size, &SINGLE_PROVE_COMMIT_GAS, base_fee)
}

pub fn aggregate_pre_commit_network_fee(
    aggregate_size: i64,
    base_fee: &TokenAmount,
) -> TokenAmount {
    aggregate_network_fee(aggregate_size, &SINGLE_PRE_COMMIT_GAS, base_fee)
}

fn aggregate_network_fee(
    aggregate_size: i64,
    single_message_gas: &BigInt,
    base_fee: &TokenAmount,
) -> TokenAmount {
    let gas_price = cmp::max(base_fee, &*BATCH_BALANCER);
    (gas_price * single_message_gas * aggregate_size * AGGREGATE_FEE_NUM)
        .div_floor(AGGREGATE_FEE_DENOM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(value: i64) -> FilterEstimate {
        FilterEstimate::new(BigInt::from(value), BigInt::zero())
    }

    #[test]
    fn br_integrates_constant_estimates_exactly() {
        // One atto per unit of power per epoch.
        let br = expected_reward_for_power(
            &estimate(100),
            &estimate(100),
            &StoragePower::from(1),
            1000,
        );
        assert_eq!(TokenAmount::from_atto(1000), br);
    }

    #[test]
    fn br_degenerates_to_reward_without_network_power() {
        let br = expected_reward_for_power(
            &estimate(1_000_000),
            &estimate(0),
            &StoragePower::from(1i64 << 30),
            720,
        );
        assert_eq!(TokenAmount::from_atto(1_000_000), br);
    }

    #[test]
    fn floored_br_never_returns_zero() {
        let br = reward_at_least_one_atto(
            &estimate(0),
            &estimate(1 << 40),
            &StoragePower::from(1i64 << 30),
            720,
        );
        assert_eq!(TokenAmount::from_atto(1), br);
    }

    #[test]
    fn termination_fee_stops_growing_at_the_age_cap() {
        let day_reward = TokenAmount::from_atto(2 * EPOCHS_IN_DAY);
        let at_cap = pledge_penalty_for_termination(
            &day_reward,
            TERMINATION_LIFETIME_CAP * EPOCHS_IN_DAY,
            &TokenAmount::zero(),
            &estimate(1 << 40),
            &StoragePower::from(1),
            &estimate(0),
            &TokenAmount::zero(),
            0,
        );
        let past_cap = pledge_penalty_for_termination(
            &day_reward,
            (TERMINATION_LIFETIME_CAP + 100) * EPOCHS_IN_DAY,
            &TokenAmount::zero(),
            &estimate(1 << 40),
            &StoragePower::from(1),
            &estimate(0),
            &TokenAmount::zero(),
            0,
        );
        assert_eq!(at_cap, past_cap);
    }

    #[test]
    fn aggregate_fee_is_linear_in_batch_size() {
        let base_fee = TokenAmount::from_nano(10);
        let single = aggregate_pre_commit_network_fee(1, &base_fee);
        let batch = aggregate_pre_commit_network_fee(10, &base_fee);
        assert_eq!(single * 10, batch);
    }

    #[test]
    fn balancer_floors_the_aggregate_fee() {
        // Any base fee at or below the balancer prices identically, and never free.
        let at_zero = aggregate_prove_commit_network_fee(10, &TokenAmount::zero());
        let at_balancer = aggregate_prove_commit_network_fee(10, &TokenAmount::from_nano(5));
        assert_eq!(at_zero, at_balancer);
        assert!(at_zero.is_positive());
    }
}
