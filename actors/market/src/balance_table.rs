// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use num_traits::{Signed, Zero};
use storage_actors_runtime::{
    actor_error, make_empty_map, make_map_with_root_and_bitwidth, ActorError, Map,
};

pub const BALANCE_TABLE_BITWIDTH: u32 = 6;

/// Token balances keyed by address. Zero balances are not stored; deleting on
/// reaching zero keeps the table minimal.
pub struct BalanceTable<'a, BS>(pub Map<'a, BS, TokenAmount>);

impl<'a, BS> BalanceTable<'a, BS>
where
    BS: Blockstore,
{
    /// An empty table.
    pub fn new(bs: &'a BS) -> Self {
        Self(make_empty_map(bs, BALANCE_TABLE_BITWIDTH))
    }

    /// Opens a table at a root CID.
    pub fn from_root(bs: &'a BS, cid: &Cid) -> anyhow::Result<Self> {
        Ok(Self(make_map_with_root_and_bitwidth(cid, bs, BALANCE_TABLE_BITWIDTH)?))
    }

    /// Flushes the table and returns its root.
    pub fn root(&mut self) -> anyhow::Result<Cid> {
        Ok(self.0.flush()?)
    }

    /// The balance held for an address, zero if absent.
    pub fn get(&self, key: &Address) -> anyhow::Result<TokenAmount> {
        Ok(self.0.get(&key.to_bytes())?.cloned().unwrap_or_else(TokenAmount::zero))
    }

    /// Adds to an address's balance. A negative value subtracts; the result
    /// must not go negative.
    pub fn add(&mut self, key: &Address, value: &TokenAmount) -> anyhow::Result<()> {
        let held = self.get(key)?;
        let updated = &held + value;
        if updated.is_negative() {
            return Err(anyhow::anyhow!(actor_error!(
                illegal_argument,
                "negative balance for {} adding {} to {}",
                key,
                value,
                held
            )));
        }
        if updated.is_zero() {
            if !held.is_zero() {
                self.0.delete(&key.to_bytes())?;
            }
        } else {
            self.0.set(key.to_bytes().into(), updated)?;
        }
        Ok(())
    }

    /// Subtracts up to `req`, never taking the balance below `floor`. Returns
    /// what was actually subtracted.
    pub fn subtract_with_minimum(
        &mut self,
        key: &Address,
        req: &TokenAmount,
        floor: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        let held = self.get(key)?;
        let available = (held - floor).max(TokenAmount::zero());
        let taken = available.min(req.clone());
        if taken.is_positive() {
            self.add(key, &-taken.clone())?;
        }
        Ok(taken)
    }

    /// Subtracts exactly `req`, failing if the balance cannot cover it.
    pub fn must_subtract(&mut self, key: &Address, req: &TokenAmount) -> Result<(), ActorError> {
        let held = self.get(key).map_err(|e| {
            actor_error!(illegal_state, "failed to get balance for {}: {}", key, e)
        })?;
        if req > &held {
            return Err(actor_error!(
                illegal_argument,
                "negative balance for {} subtracting {} from {}",
                key,
                req,
                held
            ));
        }
        self.add(key, &-req).map_err(|e| {
            actor_error!(illegal_state, "failed to subtract balance for {}: {}", key, e)
        })
    }

    /// Sum of every balance in the table.
    #[allow(dead_code)]
    pub fn total(&self) -> anyhow::Result<TokenAmount> {
        let mut sum = TokenAmount::zero();
        self.0.for_each(|_, held: &TokenAmount| {
            sum += held;
            Ok(())
        })?;
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use fvm_ipld_blockstore::MemoryBlockstore;

    use super::*;

    #[test]
    fn total_sums_every_entry() {
        let a = Address::new_id(100);
        let b = Address::new_id(101);
        let store = MemoryBlockstore::default();
        let mut table = BalanceTable::new(&store);

        assert!(table.total().unwrap().is_zero());

        for (addr, amount, running_total) in
            [(&a, 10, 10), (&a, 20, 30), (&b, 40, 70), (&b, 50, 120)]
        {
            table.add(addr, &TokenAmount::from_atto(amount)).unwrap();
            assert_eq!(TokenAmount::from_atto(running_total), table.total().unwrap());
        }
    }

    #[test]
    fn subtraction_respects_floor_and_balance() {
        let addr = Address::new_id(100);
        let store = MemoryBlockstore::default();
        let mut table = BalanceTable::new(&store);

        table.add(&addr, &TokenAmount::from_atto(80u8)).unwrap();

        // Only the portion above the floor comes out.
        assert_eq!(
            TokenAmount::from_atto(10u8),
            table
                .subtract_with_minimum(
                    &addr,
                    &TokenAmount::from_atto(20u8),
                    &TokenAmount::from_atto(70u8)
                )
                .unwrap()
        );
        assert_eq!(TokenAmount::from_atto(70u8), table.get(&addr).unwrap());

        // A request that fits within the floor gap comes out whole.
        assert_eq!(
            TokenAmount::from_atto(10u8),
            table
                .subtract_with_minimum(
                    &addr,
                    &TokenAmount::from_atto(10u8),
                    &TokenAmount::from_atto(60u8)
                )
                .unwrap()
        );
        assert_eq!(TokenAmount::from_atto(60u8), table.get(&addr).unwrap());

        table.must_subtract(&addr, &TokenAmount::from_atto(10u8)).unwrap();
        assert_eq!(TokenAmount::from_atto(50u8), table.get(&addr).unwrap());

        // Exact subtraction past the balance fails.
        assert!(table.must_subtract(&addr, &TokenAmount::from_atto(100u8)).is_err());
    }
}
