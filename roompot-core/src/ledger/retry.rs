use super::{LedgerError, LedgerOp};
use crate::config::RetryPolicy;
use rand::{Rng, RngCore};
use std::future::Future;
use std::time::Duration;

pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // Equal jitter: delay lands in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Issue one logical ledger call, re-issuing it on retryable failures.
///
/// `call` must rebuild the same request with the same idempotency key on
/// every attempt. Each attempt is bounded by `timeout`. `Rejected` is
/// returned immediately. A timed-out payout is not re-issued: funds may
/// already have moved, so the caller has to reconcile instead.
pub async fn call_ledger<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    op: LedgerOp,
    mut call: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(format!(
                "escrow {} exceeded {:?}",
                op, timeout
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retryable = match &err {
            LedgerError::Unreachable(_) => true,
            LedgerError::Timeout(_) => !op.is_payout(),
            LedgerError::Rejected(_) => false,
        };

        if !retryable || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = jittered_backoff(&mut rand::thread_rng(), policy.backoff_for(attempt));
        tracing::warn!(
            "Escrow {} attempt {}/{} failed: {}; retrying in {:?}",
            op,
            attempt,
            policy.max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let delay = jittered_backoff(&mut rng, Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_retries_unreachable_until_success() {
        let calls = AtomicU32::new(0);
        let result = call_ledger(&fast_policy(3), Duration::from_secs(1), LedgerOp::Join, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LedgerError::Unreachable("down".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            call_ledger(&fast_policy(5), Duration::from_secs(1), LedgerOp::Join, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::Rejected("room full".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_timeout_is_not_reissued() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_ledger(
            &fast_policy(5),
            Duration::from_millis(10),
            LedgerOp::Settle,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(LedgerError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refund_timeout_is_reissued() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_ledger(
            &fast_policy(2),
            Duration::from_millis(10),
            LedgerOp::Refund,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(LedgerError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
