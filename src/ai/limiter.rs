//! Global token-bucket limiter for outbound LLM calls.
//!
//! One instance lives on the application context and every call site goes
//! through it, retries included. Grants are spaced at least 1/RPS apart,
//! so the provider never sees more than RPS calls in any one-second
//! window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AiError;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Arc<Self> {
        let rps = rps.max(1);
        Arc::new(Self {
            interval: Duration::from_secs_f64(1.0 / rps as f64),
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Wait for the next free slot. Excess callers suspend in FIFO order on
    /// the internal lock.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AiError> {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let wait_until = *next;
        *next = wait_until.max(now) + self.interval;
        drop(next);

        if wait_until > now {
            tokio::select! {
                _ = tokio::time::sleep_until(wait_until) => {}
                _ = cancel.cancelled() => return Err(AiError::Cancelled),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ten_calls_at_rps_two_take_four_and_a_half_seconds() {
        let limiter = RateLimiter::new(2);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(4500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn single_call_is_immediate() {
        let limiter = RateLimiter::new(3);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiters() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let limiter2 = limiter.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(&cancel2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AiError::Cancelled)));
    }
}
