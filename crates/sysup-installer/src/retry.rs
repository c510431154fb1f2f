// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Fixed-interval retry shared by the registration handshakes

use crate::error::{InstallerError, Result};
use crate::shutdown::CancelToken;
use std::future::Future;
use std::time::Duration;

/// Run `op` until it succeeds, sleeping `interval` between attempts.
///
/// `max_attempts` of `None` retries forever. Returns the last error once the
/// attempts are exhausted, or `Cancelled` when the token fires first.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    interval: Duration,
    max_attempts: Option<u32>,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(InstallerError::Cancelled);
        }

        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{what} succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(e) if max_attempts.is_some_and(|max| attempt >= max) => {
                tracing::error!("{what} failed after {attempt} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    "{what} failed (attempt {attempt}), retrying in {}s: {e}",
                    interval.as_secs()
                );
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(InstallerError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }
}
