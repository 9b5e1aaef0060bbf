use std::future::Future;
use std::time::Duration;

/// Backoff settings for outbound destination calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or attempts run out.
///
/// `jitter_key` spreads the delays of concurrent callers (a segment id or batch index works).
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    jitter_key: u64,
    mut op: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !is_retryable(&error) {
                    return Err(error);
                }
                let delay = compute_backoff_delay(policy, attempt, jitter_key);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, jitter_key: u64) -> Duration {
    if policy.initial_backoff.is_zero() && policy.jitter.is_zero() {
        return Duration::ZERO;
    }

    let shift = attempt.saturating_sub(1).min(20);
    let exponential_ms = policy
        .initial_backoff
        .as_millis()
        .saturating_mul(1u128 << shift);
    let capped_ms = exponential_ms.min(policy.max_backoff.as_millis());

    let jitter_cap = policy.jitter.as_millis();
    let jitter_ms = if jitter_cap == 0 {
        0
    } else {
        mix(jitter_key, attempt) as u128 % (jitter_cap + 1)
    };

    let total_ms = capped_ms.saturating_add(jitter_ms);
    Duration::from_millis(u64::try_from(total_ms).unwrap_or(u64::MAX))
}

fn mix(key: u64, attempt: u32) -> u64 {
    let mut x = key ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}
