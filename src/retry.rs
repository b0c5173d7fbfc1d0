//! Bounded retry for store calls.
//!
//! Only [`LedgerError::is_transient`] failures are retried; a per-attempt
//! timeout counts as one. Writes that cannot safely be re-issued carry a
//! check: after a transient failure that check runs first, and a write that
//! turns out to have landed is returned instead of issued again.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use crate::ledger::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rounds per call, the first included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub factor: u32,
    pub max_backoff: Duration,
    /// Applied to every store call, landed checks included.
    pub op_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            factor: 2,
            max_backoff: Duration::from_secs(10),
            op_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sleep before round `attempt + 1`, after round `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let mult = self.factor.max(1).saturating_pow(exp);
        self.base_backoff
            .checked_mul(mult)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub type LandedCheck<'a, T> =
    Box<dyn FnMut() -> BoxFuture<'a, Result<Option<T>, LedgerError>> + Send + 'a>;

/// How a call may be repeated after a transient failure.
pub enum Idempotency<'a, T> {
    /// Safe to issue again as is.
    Blind,
    /// Run the check first; `Some` means the earlier attempt landed.
    CheckFirst(LandedCheck<'a, T>),
}

async fn timed<T>(
    limit: Duration,
    what: &'static str,
    fut: BoxFuture<'_, Result<T, LedgerError>>,
) -> Result<T, LedgerError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| LedgerError::Timeout(what))?
}

/// Run `op` under `policy`. Returns the last transient error once the
/// rounds are used up; the caller decides how to surface that.
pub async fn run<'a, T, F>(
    policy: &RetryPolicy,
    what: &'static str,
    mut idempotency: Idempotency<'a, T>,
    mut op: F,
) -> Result<T, LedgerError>
where
    T: Send,
    F: FnMut() -> BoxFuture<'a, Result<T, LedgerError>> + Send,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    let mut issue = true;
    loop {
        let outcome = if issue {
            timed(policy.op_timeout, what, op()).await
        } else {
            match &mut idempotency {
                Idempotency::CheckFirst(check) => {
                    match timed(policy.op_timeout, what, check()).await {
                        Ok(Some(landed)) => return Ok(landed),
                        Ok(None) => timed(policy.op_timeout, what, op()).await,
                        Err(e) => Err(e),
                    }
                }
                Idempotency::Blind => timed(policy.op_timeout, what, op()).await,
            }
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };
        if attempt >= max {
            warn!(op = what, attempts = attempt, "giving up: {err}");
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        warn!(op = what, attempt, ?delay, "transient store failure: {err}");
        metrics::counter!(crate::observability::STORE_RETRIES_TOTAL, "op" => what).increment(1);
        tokio::time::sleep(delay).await;
        attempt += 1;
        // After any transient failure a guarded write must be checked first.
        issue = matches!(idempotency, Idempotency::Blind);
    }
}
