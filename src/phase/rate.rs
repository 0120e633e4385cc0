//! Arrival-rate governor for the `ConstantRate` and `RampRate` phase models.
//!
//! The governor runs on one event loop and converts a target rate into discrete session
//! starts. Every `tick` it computes the instantaneous rate by linear interpolation between
//! the initial and the target rate, then issues that many sessions:
//!
//! ```text
//! t = min(elapsed / ramp, 1)
//! r(t) = initial + (target - initial) * t
//! add_f = r(t) * tick_seconds
//! tokens = floor(add_f + fractional)
//! fractional = (add_f + fractional) - tokens
//! ```
//!
//! Once the ramp is over the rate holds at `target` until the phase stops running.
//! Fractional tokens are carried over, so the long-term average matches the rate even when
//! `rate * tick` is not an integer.
//!
//! Tokens are not banked. A token that cannot get a session (the pool is depleted) is
//! dropped, which is how an open model throttles without queueing.
use std::time::Duration;

use tokio::{sync::watch, time::Instant};

use super::PhaseStatus;
#[cfg(feature = "internals")]
pub use internals::*;

/// Cap for a single tick, keeps the float-to-int conversion in range.
const MAX_TOKENS: usize = usize::MAX >> 3;

/// Rate curve of one phase, in sessions per second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSchedule {
    pub initial: f64,
    pub target: f64,
    /// Time to move from `initial` to `target`. Zero jumps to `target` right away.
    pub ramp: Duration,
}

impl RateSchedule {
    pub fn constant(rate: f64) -> Self {
        Self {
            initial: rate,
            target: rate,
            ramp: Duration::ZERO,
        }
    }

    pub fn ramp(initial: f64, target: f64, duration: Duration) -> Self {
        Self {
            initial,
            target,
            ramp: duration,
        }
    }
}

pub(crate) mod internals {
    use super::*;

    /// Issues sessions according to `schedule` until `status` leaves `Running`.
    ///
    /// `start_session` is called once per token and returns `false` when no session was
    /// available; the rest of that tick's tokens are then dropped. At most `burst` tokens
    /// are issued per tick. Returns the number of sessions started.
    pub async fn token_governor_task(
        schedule: RateSchedule,
        tick: Duration,
        burst: usize,
        mut status: watch::Receiver<PhaseStatus>,
        mut start_session: impl FnMut() -> bool,
    ) -> u64 {
        let started_at = Instant::now();
        let mut next_tick = started_at;
        let mut fractional = 0.0;
        let mut started = 0;
        loop {
            let (tokens, f) = calc_token_limit(
                started_at.elapsed(),
                schedule.ramp,
                schedule.initial,
                schedule.target,
                fractional,
                tick,
            );
            fractional = f;
            for _ in 0..tokens.min(burst) {
                if !start_session() {
                    break;
                }
                started += 1;
            }
            next_tick += tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = status.wait_for(|s| *s != PhaseStatus::Running) => break,
            }
        }
        tracing::debug!("Rate governor stopped after {started} sessions");
        started
    }

    /// Pure function to calculate the number of tokens to add this tick.
    ///
    /// It performs linear interpolation of the rate and carries any
    /// fractional tokens over to the next tick to maintain the long-term
    /// average rate.
    ///
    /// Returns `(tokens_to_add, next_fractional_part)`.
    pub fn calc_token_limit(
        elapsed: Duration,
        ramp: Duration,
        start_rate: f64,
        end_rate: f64,
        fractional: f64,
        tick: Duration,
    ) -> (usize, f64) {
        let t = if ramp.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / ramp.as_secs_f64()).min(1.0)
        };
        let tick_rate = start_rate + (end_rate - start_rate) * t;
        let add_f = tick_rate * tick.as_secs_f64();

        let add_total_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - add_total_f;

        let add_total = if add_total_f >= MAX_TOKENS as f64 {
            MAX_TOKENS
        } else if add_total_f < 0.0 {
            0
        } else {
            add_total_f as usize
        };

        (add_total, fractional)
    }
}
