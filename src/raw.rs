//! Raw store writes.
//!
//! Documents are committed in transaction groups; a failed group is reported
//! against every key it contained and the remaining groups still run.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::models::{RawDocument, RawKey};
use crate::store::WeatherStore;

// ---

/// Outcome of a batched raw write.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub stored: usize,
    pub failed: Vec<(RawKey, String)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write `docs` in groups of at most `group_size` through `write`.
pub async fn upsert_grouped<'a, F, Fut>(
    docs: &'a [RawDocument],
    group_size: usize,
    mut write: F,
) -> BatchReport
where
    F: FnMut(&'a [RawDocument]) -> Fut,
    Fut: Future<Output = Result<u64, StorageError>>,
{
    // ---
    let mut report = BatchReport::default();
    for (n, group) in docs.chunks(group_size.max(1)).enumerate() {
        match write(group).await {
            Ok(_) => {
                debug!("Raw group {} stored ({} documents)", n, group.len());
                report.stored += group.len();
            }
            Err(e) => {
                warn!("Raw group {} failed ({} documents): {}", n, group.len(), e);
                let message = error_chain(&e);
                report
                    .failed
                    .extend(group.iter().map(|d| (d.key, message.clone())));
            }
        }
    }
    report
}

/// Write `docs` to `store` in transaction groups of at most `group_size`.
pub async fn upsert_batch(
    store: &dyn WeatherStore,
    docs: &[RawDocument],
    group_size: usize,
) -> BatchReport {
    upsert_grouped(docs, group_size, |group| store.upsert_raw(group)).await
}

/// `error: cause: cause` so the root cause survives into the tracker.
pub(crate) fn error_chain(e: &dyn std::error::Error) -> String {
    // ---
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
