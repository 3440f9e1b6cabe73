// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::{ChainEpoch, QuantSpec};
use storage_actors_runtime::runtime::Policy;

/// A deadline's position in time, computed for some observation epoch.
///
/// The proving window is the half-open span [open, close). The challenge seed
/// is drawn from `challenge`, strictly before the window opens, and fault or
/// recovery declarations must land before `fault_cutoff`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct DeadlineInfo {
    /// The epoch this info was computed at.
    pub current_epoch: ChainEpoch,
    /// First epoch of the proving period holding this instance.
    pub period_start: ChainEpoch,
    /// The deadline's index within the period.
    pub index: u64,
    /// First epoch at which a proof is accepted.
    pub open: ChainEpoch,
    /// First epoch at which a proof is no longer accepted.
    pub close: ChainEpoch,
    /// Epoch from which challenge randomness is drawn.
    pub challenge: ChainEpoch,
    /// First epoch at which declarations for this instance are rejected.
    pub fault_cutoff: ChainEpoch,

    // Window geometry, retained so the info can project itself forward.
    proving_period: ChainEpoch,
    period_deadlines: u64,
}

impl DeadlineInfo {
    pub fn new(
        policy: &Policy,
        period_start: ChainEpoch,
        index: u64,
        current_epoch: ChainEpoch,
    ) -> Self {
        let (open, close, challenge, fault_cutoff) = if index < policy.wpost_period_deadlines {
            let open = period_start + index as i64 * policy.wpost_challenge_window;
            (
                open,
                open + policy.wpost_challenge_window,
                open - policy.wpost_challenge_lookback,
                open - policy.fault_declaration_cutoff,
            )
        } else {
            // An out-of-range index denotes a zero-width instance just past
            // the period's end.
            let after = period_start + policy.wpost_proving_period;
            (after, after, after, 0)
        };

        Self {
            current_epoch,
            period_start,
            index,
            open,
            close,
            challenge,
            fault_cutoff,
            proving_period: policy.wpost_proving_period,
            period_deadlines: policy.wpost_period_deadlines,
        }
    }

    pub fn period_started(&self) -> bool {
        self.current_epoch >= self.period_start
    }

    pub fn period_elapsed(&self) -> bool {
        self.current_epoch >= self.next_period_start()
    }

    pub fn period_end(&self) -> ChainEpoch {
        self.period_start + self.proving_period - 1
    }

    pub fn next_period_start(&self) -> ChainEpoch {
        self.period_start + self.proving_period
    }

    pub fn is_open(&self) -> bool {
        self.open <= self.current_epoch && self.current_epoch < self.close
    }

    pub fn has_elapsed(&self) -> bool {
        self.current_epoch >= self.close
    }

    /// The final epoch at which a proof is accepted.
    pub fn last(&self) -> ChainEpoch {
        self.close - 1
    }

    /// The epoch at which the following deadline opens.
    pub fn next_open(&self) -> ChainEpoch {
        self.close
    }

    pub fn fault_cutoff_passed(&self) -> bool {
        self.current_epoch >= self.fault_cutoff
    }

    /// This same deadline index, projected forward whole periods until its
    /// window has not yet closed.
    pub fn next_not_elapsed(self) -> Self {
        if !self.has_elapsed() {
            return self;
        }

        let lag = self.current_epoch - self.close;
        let shift = (1 + lag / self.proving_period) * self.proving_period;

        Self {
            period_start: self.period_start + shift,
            open: self.open + shift,
            close: self.close + shift,
            challenge: self.challenge + shift,
            fault_cutoff: if self.index < self.period_deadlines {
                self.fault_cutoff + shift
            } else {
                0
            },
            ..self
        }
    }

    /// The grid on which this deadline's expirations are bucketed: once per
    /// period, anchored at the window's last epoch.
    pub fn quant_spec(&self) -> QuantSpec {
        QuantSpec { unit: self.proving_period, offset: self.last() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(period_start: ChainEpoch, index: u64, now: ChainEpoch) -> DeadlineInfo {
        DeadlineInfo::new(&Policy::default(), period_start, index, now)
    }

    #[test]
    fn window_geometry() {
        let policy = Policy::default();
        let di = info(100, 2, 100);
        assert_eq!(100 + 2 * policy.wpost_challenge_window, di.open);
        assert_eq!(di.open + policy.wpost_challenge_window, di.close);
        assert_eq!(di.open - policy.wpost_challenge_lookback, di.challenge);
        assert_eq!(di.close - 1, di.last());
        assert!(!di.is_open());
    }

    #[test]
    fn window_is_half_open() {
        let di = info(0, 0, 0);
        assert!(di.is_open());
        let at_close = info(0, 0, di.close);
        assert!(!at_close.is_open());
        assert!(at_close.has_elapsed());
    }

    #[test]
    fn projection_lands_in_an_unelapsed_window() {
        let policy = Policy::default();
        let di = info(0, 0, 10 * policy.wpost_proving_period + 5);
        let projected = di.next_not_elapsed();
        assert!(!projected.has_elapsed());
        assert_eq!(di.index, projected.index);
        assert_eq!(0, (projected.period_start - di.period_start) % policy.wpost_proving_period);
    }
}
