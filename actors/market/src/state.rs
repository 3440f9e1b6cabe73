// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::{anyhow, Context};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::clock::{ChainEpoch, EPOCH_UNDEFINED};
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::{Signed, Zero};
use storage_actors_runtime::runtime::Policy;
use storage_actors_runtime::{actor_error, ActorError, Array, AsActorError, Set, SetMultimap};

use super::balance_table::BalanceTable;
use super::policy::*;
use super::types::*;
use super::{DealProposal, DealState};

/// Which pool a locked amount belongs to. The three locked totals must track
/// the locked table exactly; tagging every unlock keeps them honest.
pub(super) enum Reason {
    ClientCollateral,
    ClientStorageFee,
    ProviderCollateral,
}

/// Market actor state.
///
/// Funds deposited by clients and providers live in the escrow table; the
/// locked table records the portion spoken for by published deals. Deal
/// settlement moves value between escrow entries and shrinks locked entries,
/// never touching the actor's own balance.
#[derive(Clone, Default, Serialize_tuple, Deserialize_tuple)]
pub struct State {
    /// Published deals that have not yet been cleaned up (AMT[DealID]DealProposal).
    pub proposals: Cid,

    /// Activation state for deals included in a proven sector
    /// (AMT[DealID]DealState). Keys here are always a subset of `proposals`.
    pub states: Cid,

    /// CIDs of proposals published but not yet activated, guarding against
    /// double publication (Set keyed by proposal CID).
    pub pending_proposals: Cid,

    /// Full balance per party, locked and unlocked together (BalanceTable).
    pub escrow_table: Cid,

    /// The spoken-for portion of each party's escrow (BalanceTable).
    pub locked_table: Cid,

    /// Next deal ID to hand out.
    pub next_id: DealID,

    /// Settlement schedule: epoch -> deal IDs due for processing
    /// (SetMultimap).
    pub deal_ops_by_epoch: Cid,

    /// Last epoch through which cron has settled. Settlement is idempotent per
    /// epoch because this gates the scan.
    pub last_cron: ChainEpoch,

    /// Locked client collateral, released on termination or expiry.
    pub total_client_locked_collateral: TokenAmount,
    /// Locked provider collateral, released on expiry or slashed.
    pub total_provider_locked_collateral: TokenAmount,
    /// Locked storage fees, paid out epoch by epoch.
    pub total_client_storage_fee: TokenAmount,
}

impl Cbor for State {}

impl State {
    pub fn new<BS: Blockstore>(store: &BS) -> anyhow::Result<Self> {
        let no_proposals = Array::<DealProposal, BS>::new_with_bit_width(store, PROPOSALS_AMT_BITWIDTH)
            .flush()
            .context("building empty proposals array")?;
        let no_states = Array::<DealState, BS>::new_with_bit_width(store, STATES_AMT_BITWIDTH)
            .flush()
            .context("building empty states array")?;
        let no_pending = Set::new(store).root().context("building empty pending set")?;
        let no_balances =
            BalanceTable::new(store).root().context("building empty balance table")?;
        let no_schedule =
            SetMultimap::new(store).root().context("building empty settlement schedule")?;

        Ok(Self {
            proposals: no_proposals,
            states: no_states,
            pending_proposals: no_pending,
            escrow_table: no_balances,
            locked_table: no_balances,
            next_id: 0,
            deal_ops_by_epoch: no_schedule,
            last_cron: EPOCH_UNDEFINED,
            total_client_locked_collateral: TokenAmount::zero(),
            total_provider_locked_collateral: TokenAmount::zero(),
            total_client_storage_fee: TokenAmount::zero(),
        })
    }

    pub fn total_locked(&self) -> TokenAmount {
        &self.total_client_locked_collateral
            + &self.total_provider_locked_collateral
            + &self.total_client_storage_fee
    }

    pub(super) fn generate_storage_deal_id(&mut self) -> DealID {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    //
    // Settlement schedule
    //

    /// The deal IDs scheduled at an epoch, in ascending order. The underlying
    /// set iterates in hash order, so sorting here is what makes settlement
    /// deterministic.
    pub(super) fn updates_for_epoch<BS: Blockstore>(
        &self,
        store: &BS,
        epoch: ChainEpoch,
    ) -> anyhow::Result<Vec<DealID>> {
        let schedule = SetMultimap::from_root(store, &self.deal_ops_by_epoch)
            .context("opening settlement schedule")?;

        let mut due = Vec::new();
        schedule.for_each(epoch, |deal_id| {
            due.push(deal_id);
            Ok(())
        })?;
        due.sort_unstable();
        Ok(due)
    }

    //
    // Deal settlement
    //

    /// Advances one activated deal to `epoch`: pays the provider for the span
    /// served since the last update, then settles slashing or expiry if
    /// either applies.
    ///
    /// Returns the amount to burn (slashed provider collateral), the epoch at
    /// which to process the deal next (undefined if none), and whether the
    /// deal is finished and should be deleted.
    pub(super) fn update_pending_deal_state<BS: Blockstore>(
        &mut self,
        store: &BS,
        policy: &Policy,
        state: &DealState,
        deal: &DealProposal,
        epoch: ChainEpoch,
    ) -> anyhow::Result<(TokenAmount, ChainEpoch, bool)> {
        let updated = state.last_updated_epoch != EPOCH_UNDEFINED;
        let slashed = state.slash_epoch != EPOCH_UNDEFINED;

        if updated && state.last_updated_epoch > epoch {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "deal updated at future epoch {}",
                state.last_updated_epoch
            )));
        }

        // Scheduling places deals at or after their start; anything earlier
        // would be a scheduling bug, handled as a no-op.
        if deal.start_epoch > epoch {
            return Ok((TokenAmount::zero(), EPOCH_UNDEFINED, false));
        }

        // Payment covers [max(start, last update), min(now, end, slash)).
        let span_start = std::cmp::max(deal.start_epoch, state.last_updated_epoch);
        let span_end = if slashed {
            if epoch < state.slash_epoch {
                return Err(anyhow!(actor_error!(
                    illegal_state,
                    "deal slashed at future epoch {}",
                    state.slash_epoch
                )));
            }
            if state.slash_epoch > deal.end_epoch {
                return Err(anyhow!(actor_error!(
                    illegal_state,
                    "deal slash epoch {} after deal end {}",
                    state.slash_epoch,
                    deal.end_epoch
                )));
            }
            state.slash_epoch
        } else {
            std::cmp::min(deal.end_epoch, epoch)
        };

        let payment = &deal.storage_price_per_epoch * (span_end - span_start);
        if payment.is_positive() {
            self.transfer_balance(store, &deal.client, &deal.provider, &payment)?;
        }

        if slashed {
            // The client walks away whole: remaining fee and collateral
            // unlock. The provider's collateral burns.
            let unpaid = remaining_payment(deal, state.slash_epoch)?;
            self.unlock_balance(store, &deal.client, &unpaid, Reason::ClientStorageFee)
                .context("unlocking remaining client storage fee")?;
            self.unlock_balance(
                store,
                &deal.client,
                &deal.client_collateral,
                Reason::ClientCollateral,
            )
            .context("unlocking client collateral")?;

            let forfeited = deal.provider_collateral.clone();
            self.slash_balance(store, &deal.provider, &forfeited, Reason::ProviderCollateral)
                .context("slashing provider collateral")?;

            return Ok((forfeited, EPOCH_UNDEFINED, true));
        }

        if epoch >= deal.end_epoch {
            self.settle_expired_deal(store, deal, state)?;
            return Ok((TokenAmount::zero(), EPOCH_UNDEFINED, true));
        }

        // Still running: come back after the standard interval. The end epoch
        // is deliberately not targeted exactly, so many deals ending together
        // cannot concentrate cron load.
        Ok((TokenAmount::zero(), epoch + policy.deal_updates_interval, false))
    }

    /// A published deal reached its start epoch without ever being proven:
    /// the provider forfeits collateral, the client walks away whole.
    pub(super) fn process_deal_init_timed_out<BS: Blockstore>(
        &mut self,
        store: &BS,
        deal: &DealProposal,
    ) -> anyhow::Result<TokenAmount> {
        self.unlock_balance(
            store,
            &deal.client,
            &deal.total_storage_fee(),
            Reason::ClientStorageFee,
        )
        .context("unlocking client storage fee")?;
        self.unlock_balance(store, &deal.client, &deal.client_collateral, Reason::ClientCollateral)
            .context("unlocking client collateral")?;

        let forfeited =
            collateral_penalty_for_deal_activation_missed(deal.provider_collateral.clone());
        let kept = deal.provider_balance_requirement() - &forfeited;

        self.slash_balance(store, &deal.provider, &forfeited, Reason::ProviderCollateral)
            .context("slashing provider collateral")?;
        self.unlock_balance(store, &deal.provider, &kept, Reason::ProviderCollateral)
            .context("unlocking provider remainder")?;

        Ok(forfeited)
    }

    /// A deal served to the end: both collaterals unlock.
    fn settle_expired_deal<BS: Blockstore>(
        &mut self,
        store: &BS,
        deal: &DealProposal,
        state: &DealState,
    ) -> anyhow::Result<()> {
        if state.sector_start_epoch == EPOCH_UNDEFINED {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "expired deal was never activated"
            )));
        }

        self.unlock_balance(
            store,
            &deal.provider,
            &deal.provider_collateral,
            Reason::ProviderCollateral,
        )
        .context("unlocking provider collateral")?;
        self.unlock_balance(store, &deal.client, &deal.client_collateral, Reason::ClientCollateral)
            .context("unlocking client collateral")
    }

    //
    // Escrow accounting
    //

    fn escrow<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> anyhow::Result<BalanceTable<'bs, BS>> {
        BalanceTable::from_root(store, &self.escrow_table).context("opening escrow table")
    }

    fn locked<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> anyhow::Result<BalanceTable<'bs, BS>> {
        BalanceTable::from_root(store, &self.locked_table).context("opening locked table")
    }

    pub(super) fn add_escrow_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        party: &Address,
        amount: &TokenAmount,
    ) -> anyhow::Result<()> {
        let mut escrow = self.escrow(store)?;
        escrow.add(party, amount).context("crediting escrow")?;
        self.escrow_table = escrow.root()?;
        Ok(())
    }

    /// Pays out up to `requested` of the party's unlocked escrow; the locked
    /// portion is untouchable. Returns the amount actually withdrawn.
    pub(super) fn withdraw_escrow_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        party: &Address,
        requested: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        let floor = self.locked(store)?.get(party).context("reading locked balance")?;

        let mut escrow = self.escrow(store)?;
        let withdrawn = escrow
            .subtract_with_minimum(party, requested, &floor)
            .context("debiting escrow")?;
        self.escrow_table = escrow.root()?;
        Ok(withdrawn)
    }

    pub fn get_escrow_balance<BS: Blockstore>(
        &self,
        store: &BS,
        party: &Address,
    ) -> Result<TokenAmount, ActorError> {
        self.escrow(store)
            .and_then(|t| t.get(party))
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading escrow balance")
    }

    pub fn get_locked_balance<BS: Blockstore>(
        &self,
        store: &BS,
        party: &Address,
    ) -> Result<TokenAmount, ActorError> {
        self.locked(store)
            .and_then(|t| t.get(party))
            .context_code(ExitCode::USR_ILLEGAL_STATE, "reading locked balance")
    }

    /// Whether the party's escrow can absorb `additional` more locked funds.
    pub(super) fn balance_covered<BS: Blockstore>(
        &self,
        store: &BS,
        party: Address,
        additional: &TokenAmount,
    ) -> anyhow::Result<bool> {
        let escrow = self.escrow(store)?.get(&party).context("reading escrow balance")?;
        let locked = self.locked(store)?.get(&party).context("reading locked balance")?;
        Ok(locked + additional <= escrow)
    }

    fn lock_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        party: &Address,
        amount: &TokenAmount,
    ) -> anyhow::Result<()> {
        if amount.is_negative() {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "cannot lock negative amount {}",
                amount
            )));
        }

        let escrow = self.escrow(store)?.get(party).context("reading escrow balance")?;
        let mut locked = self.locked(store)?;
        let already_locked = locked.get(party).context("reading locked balance")?;

        if &already_locked + amount > escrow {
            return Err(anyhow!(actor_error!(
                insufficient_funds,
                "escrow balance {} of {} under proposed lockup {}",
                escrow,
                party,
                already_locked + amount
            )));
        }

        locked.add(party, amount).context("growing locked balance")?;
        self.locked_table = locked.root()?;
        Ok(())
    }

    /// Reserves both parties' obligations for a freshly published deal.
    pub(super) fn lock_client_and_provider_balances<BS: Blockstore>(
        &mut self,
        store: &BS,
        proposal: &DealProposal,
    ) -> anyhow::Result<()> {
        self.lock_balance(store, &proposal.client, &proposal.client_balance_requirement())
            .context("locking client funds")?;
        self.lock_balance(store, &proposal.provider, &proposal.provider_collateral)
            .context("locking provider funds")?;

        self.total_client_locked_collateral += &proposal.client_collateral;
        self.total_client_storage_fee += proposal.total_storage_fee();
        self.total_provider_locked_collateral += &proposal.provider_collateral;
        Ok(())
    }

    /// Releases a locked amount back into the party's free escrow.
    fn unlock_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        party: &Address,
        amount: &TokenAmount,
        reason: Reason,
    ) -> anyhow::Result<()> {
        if amount.is_negative() {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "cannot unlock negative amount {}",
                amount
            )));
        }

        let mut locked = self.locked(store)?;
        locked
            .must_subtract(party, amount)
            .map_err(|e| anyhow!("shrinking locked balance: {}", e))?;
        self.locked_table = locked.root()?;

        match reason {
            Reason::ClientCollateral => self.total_client_locked_collateral -= amount,
            Reason::ClientStorageFee => self.total_client_storage_fee -= amount,
            Reason::ProviderCollateral => self.total_provider_locked_collateral -= amount,
        }
        Ok(())
    }

    /// Moves a locked storage fee out of the client's escrow into the
    /// provider's free escrow.
    fn transfer_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        from: &Address,
        to: &Address,
        amount: &TokenAmount,
    ) -> anyhow::Result<()> {
        if amount.is_negative() {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "cannot transfer negative amount {}",
                amount
            )));
        }

        let mut escrow = self.escrow(store)?;
        escrow.must_subtract(from, amount).map_err(|e| anyhow!("debiting payer: {}", e))?;
        self.unlock_balance(store, from, amount, Reason::ClientStorageFee)
            .context("unlocking payment")?;
        escrow.add(to, amount).context("crediting payee")?;
        self.escrow_table = escrow.root()?;
        Ok(())
    }

    /// Removes a locked amount from the party's escrow entirely; the caller
    /// burns it.
    fn slash_balance<BS: Blockstore>(
        &mut self,
        store: &BS,
        party: &Address,
        amount: &TokenAmount,
        reason: Reason,
    ) -> anyhow::Result<()> {
        if amount.is_negative() {
            return Err(anyhow!(actor_error!(
                illegal_state,
                "cannot slash negative amount {}",
                amount
            )));
        }

        let mut escrow = self.escrow(store)?;
        escrow.must_subtract(party, amount).map_err(|e| anyhow!("debiting escrow: {}", e))?;
        self.escrow_table = escrow.root()?;

        self.unlock_balance(store, party, amount, reason)
    }
}

/// The storage fee still owed from `from_epoch` to the deal's end. Payments
/// always span start to end regardless of when slashing interrupts them.
fn remaining_payment(
    deal: &DealProposal,
    from_epoch: ChainEpoch,
) -> anyhow::Result<TokenAmount> {
    if from_epoch > deal.end_epoch {
        return Err(anyhow!(actor_error!(
            illegal_state,
            "payment epoch {} after deal end {}",
            from_epoch,
            deal.end_epoch
        )));
    }
    let span = deal.end_epoch - std::cmp::max(from_epoch, deal.start_epoch);
    Ok(&deal.storage_price_per_epoch * span)
}
