//! Token-bucket rate control
//!
//! Each duct carries a throttle with a nominal rate in bytes per second
//! and a current-second capacity that transmission debits (possibly
//! below zero). Consumers wait until capacity is non-negative; the
//! clock credits capacity once per second, capped at one second's worth
//! of the nominal rate. A zero or negative nominal rate does not gate.

use std::sync::Mutex;

use crate::vdb::{Signal, WaitOutcome};

#[derive(Debug)]
struct ThrottleState {
    nominal_rate: i64,
    capacity: i64,
}

/// Rate limiter for one duct
#[derive(Debug)]
pub struct Throttle {
    state: Mutex<ThrottleState>,
    signal: Signal,
}

impl Throttle {
    pub(crate) fn new(nominal_rate: i64, signal: Signal) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                nominal_rate,
                capacity: nominal_rate.max(0),
            }),
            signal,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current capacity in bytes (may be negative)
    pub fn capacity(&self) -> i64 {
        self.lock().capacity
    }

    /// Nominal rate in bytes per second
    pub fn nominal_rate(&self) -> i64 {
        self.lock().nominal_rate
    }

    /// Change the nominal rate
    pub fn set_nominal_rate(&self, rate: i64) {
        let mut state = self.lock();
        state.nominal_rate = rate;
        if rate <= 0 {
            self.signal.post();
        }
    }

    /// Debit transmitted bytes
    pub fn debit(&self, bytes: u64) {
        let mut state = self.lock();
        if state.nominal_rate <= 0 {
            return;
        }
        state.capacity -= bytes as i64;
    }

    /// One second's token credit, posted by the clock
    pub fn credit(&self) {
        let mut state = self.lock();
        if state.nominal_rate <= 0 {
            return;
        }
        state.capacity = (state.capacity + state.nominal_rate).min(state.nominal_rate);
        if state.capacity >= 0 {
            self.signal.post();
        }
    }

    /// Wait until capacity is non-negative
    pub async fn wait_ready(&self) -> WaitOutcome {
        loop {
            {
                let state = self.lock();
                if state.nominal_rate <= 0 || state.capacity >= 0 {
                    return WaitOutcome::Posted;
                }
            }
            match self.signal.wait().await {
                WaitOutcome::Posted => continue,
                other => return other,
            }
        }
    }

    /// Unblock one waiter with the interrupted sentinel
    pub fn interrupt(&self) {
        self.signal.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdb::Vdb;

    #[tokio::test]
    async fn test_zero_rate_never_gates() {
        let vdb = Vdb::new();
        let throttle = Throttle::new(0, vdb.signal());
        throttle.debit(1_000_000);
        assert_eq!(throttle.wait_ready().await, WaitOutcome::Posted);
    }

    #[tokio::test]
    async fn test_debit_below_zero_blocks_until_credit() {
        let vdb = Vdb::new();
        let throttle = Throttle::new(100, vdb.signal());
        throttle.debit(250);
        assert_eq!(throttle.capacity(), -150);

        // One credit is not enough, two are.
        throttle.credit();
        assert_eq!(throttle.capacity(), -50);
        throttle.credit();
        assert_eq!(throttle.capacity(), 50);
        assert_eq!(throttle.wait_ready().await, WaitOutcome::Posted);
    }

    #[tokio::test]
    async fn test_credit_caps_at_one_second() {
        let vdb = Vdb::new();
        let throttle = Throttle::new(100, vdb.signal());
        throttle.credit();
        throttle.credit();
        assert_eq!(throttle.capacity(), 100);
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_waiter() {
        let vdb = Vdb::new();
        let throttle = std::sync::Arc::new(Throttle::new(10, vdb.signal()));
        throttle.debit(100);

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.wait_ready().await })
        };
        tokio::task::yield_now().await;
        throttle.interrupt();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Interrupted);
        drop(vdb);
    }
}
