//! Backing store boundary.
//!
//! The catalog, writer and handle talk to storage only through
//! [`BackingStore`]; Postgres and in-memory adapters implement it.

pub mod copy;
#[cfg(test)]
pub(crate) mod gated;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::future::Future;
use std::time::Duration;

pub use in_memory::InMemoryBackingStore;
pub use postgres::PostgresBackingStore;
pub use r#trait::{BackingStore, DatasetSummary, StoreError};

/// Run a store call under `timeout`.
///
/// On expiry the call's future is dropped, which rolls back any open
/// transaction it holds.
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            timeout_ms: timeout.as_millis().try_into().unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let ok = bounded("noop", Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_slow_calls() {
        let slow = bounded("slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        })
        .await;
        assert_eq!(
            slow,
            Err(StoreError::Timeout {
                operation: "slow",
                timeout_ms: 50
            })
        );
    }
}
