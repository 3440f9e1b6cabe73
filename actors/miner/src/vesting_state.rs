// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::mem;

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::{ChainEpoch, QuantSpec};
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use super::VestSpec;

/// One tranche of locked funds, releasing at `epoch`.
#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// The miner's vesting table: tranches in strictly increasing epoch order.
#[derive(Serialize_tuple, Deserialize_tuple, Default)]
pub struct VestingFunds {
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Default::default()
    }

    /// Drops every tranche that has matured before `current_epoch` and returns
    /// their sum.
    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        let still_locked = self.funds.iter().position(|f| f.epoch >= current_epoch);
        let matured: Vec<VestingFund> = match still_locked {
            Some(at) => self.funds.drain(..at).collect(),
            None => mem::take(&mut self.funds),
        };
        matured.into_iter().map(|f| f.amount).sum()
    }

    /// Lays `vesting_sum` onto the table as a linear schedule per `spec`,
    /// with tranche epochs rounded onto the quantization grid anchored at the
    /// proving period. Tranches landing on an existing epoch merge with it.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        let grid = QuantSpec { unit: spec.quantization, offset: proving_period_start };
        let clock_start = current_epoch + spec.initial_delay;

        // Build the new tranches: at each step, bring the cumulative vested
        // amount up to the linear target for the elapsed time.
        let mut tranches = Vec::<VestingFund>::new();
        let mut vested = TokenAmount::zero();
        let mut step = clock_start;
        while vested < *vesting_sum {
            step += spec.step_duration;
            let tranche_epoch = grid.quantize_up(step);

            let elapsed = tranche_epoch - clock_start;
            let target = if elapsed < spec.vest_period {
                (vesting_sum * elapsed).div_floor(spec.vest_period)
            } else {
                vesting_sum.clone()
            };

            let amount = &target - &vested;
            vested = target;
            tranches.push(VestingFund { epoch: tranche_epoch, amount });
        }

        // Merge the two epoch-sorted lists, combining tranches that collide.
        let old = mem::take(&mut self.funds);
        let mut merged = Vec::with_capacity(old.len() + tranches.len());
        let mut new_iter = tranches.into_iter().peekable();
        for existing in old {
            while new_iter.peek().map_or(false, |n| n.epoch < existing.epoch) {
                merged.push(new_iter.next().unwrap());
            }
            if new_iter.peek().map_or(false, |n| n.epoch == existing.epoch) {
                let colliding = new_iter.next().unwrap();
                merged.push(VestingFund {
                    epoch: existing.epoch,
                    amount: existing.amount + colliding.amount,
                });
            } else {
                merged.push(existing);
            }
        }
        merged.extend(new_iter);
        self.funds = merged;
    }

    /// Forfeits up to `target` from tranches that have NOT yet matured,
    /// soonest first, shrinking or deleting tranches as needed. Returns the
    /// amount taken.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut taken = TokenAmount::zero();

        let mut remaining = Vec::with_capacity(self.funds.len());
        for mut tranche in mem::take(&mut self.funds) {
            if tranche.epoch >= current_epoch && &taken < target {
                let take_here = std::cmp::min(target - &taken, tranche.amount.clone());
                taken += &take_here;
                tranche.amount -= &take_here;
                if tranche.amount.is_zero() {
                    continue;
                }
            }
            remaining.push(tranche);
        }
        self.funds = remaining;

        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: VestSpec =
        VestSpec { initial_delay: 0, vest_period: 100, step_duration: 10, quantization: 10 };

    #[test]
    fn vests_linearly_over_the_period() {
        let mut table = VestingFunds::new();
        table.add_locked_funds(0, &TokenAmount::from_atto(1000), 0, &SPEC);

        let total: TokenAmount = table.funds.iter().map(|f| f.amount.clone()).sum();
        assert_eq!(TokenAmount::from_atto(1000), total);

        // Nothing matures before the first step's grid point passes.
        assert!(table.unlock_vested_funds(10).is_zero());

        // Half the total by the period midpoint...
        assert_eq!(TokenAmount::from_atto(500), table.unlock_vested_funds(51));
        // ...and the rest by the end.
        assert_eq!(TokenAmount::from_atto(500), table.unlock_vested_funds(101));
        assert!(table.funds.is_empty());
    }

    #[test]
    fn colliding_tranches_merge() {
        let mut table = VestingFunds::new();
        table.add_locked_funds(0, &TokenAmount::from_atto(1000), 0, &SPEC);
        let tranche_count = table.funds.len();

        table.add_locked_funds(0, &TokenAmount::from_atto(1000), 0, &SPEC);
        assert_eq!(tranche_count, table.funds.len());

        let total: TokenAmount = table.funds.iter().map(|f| f.amount.clone()).sum();
        assert_eq!(TokenAmount::from_atto(2000), total);
    }

    #[test]
    fn forfeiture_takes_soonest_tranches_first() {
        let mut table = VestingFunds::new();
        table.add_locked_funds(0, &TokenAmount::from_atto(1000), 0, &SPEC);

        assert_eq!(
            TokenAmount::from_atto(150),
            table.unlock_unvested_funds(0, &TokenAmount::from_atto(150))
        );
        let left: TokenAmount = table.funds.iter().map(|f| f.amount.clone()).sum();
        assert_eq!(TokenAmount::from_atto(850), left);

        // Asking for more than remains takes everything and empties the table.
        assert_eq!(
            TokenAmount::from_atto(850),
            table.unlock_unvested_funds(0, &TokenAmount::from_atto(10_000))
        );
        assert!(table.funds.is_empty());
    }
}
