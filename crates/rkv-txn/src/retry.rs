use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use rkv_types::{CommitResult, RkvError};

use crate::{KvDatabase, KvTransaction, TxOptions};

/// The future a retried operation returns. It borrows the transaction it
/// runs in.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, RkvError>> + Send + 't>>;

/// Replays an operation on a fresh transaction when it or its commit fails
/// with `Conflict`. Any other error is returned as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first included. At least one attempt is made.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        RetryPolicy { max_attempts: 1, ..RetryPolicy::default() }
    }

    /// Run `op` in a transaction begun with `options` and commit it.
    ///
    /// ```ignore
    /// let (value, _) = policy
    ///     .run(&db, options, |tx| Box::pin(async move { tx.get(b"k").await }))
    ///     .await?;
    /// ```
    pub async fn run<D, F, T>(&self, db: &D, options: TxOptions, mut op: F) -> Result<(T, CommitResult), RkvError>
    where
        D: KvDatabase,
        F: for<'t> FnMut(&'t mut D::Tx) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        let mut attempt = 1;
        let mut backoff = self.initial_backoff;
        loop {
            let err = match Self::attempt(db, options, &mut op).await {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };
            if !err.is_conflict() || attempt >= self.max_attempts {
                return Err(err);
            }
            let delay = jitter(backoff);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transaction");
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(self.max_backoff);
            attempt += 1;
        }
    }

    async fn attempt<D, F, T>(db: &D, options: TxOptions, op: &mut F) -> Result<(T, CommitResult), RkvError>
    where
        D: KvDatabase,
        F: for<'t> FnMut(&'t mut D::Tx) -> TxFuture<'t, T> + Send,
        T: Send,
    {
        let mut tx = db.begin(options).await?;
        let value = match op(&mut tx).await {
            Ok(value) => value,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };
        let result = tx.commit().await?;
        Ok((value, result))
    }
}

/// Somewhere in `[backoff / 2, backoff]`.
fn jitter(backoff: Duration) -> Duration {
    let max = backoff.as_millis() as u64;
    if max < 2 {
        return backoff;
    }
    Duration::from_millis(rand::thread_rng().gen_range(max / 2..=max))
}
