//! Batch/concurrency controller.
//!
//! Bounds how many dates (or ingest units) are in flight at once and how many
//! rows go into one write transaction.

use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::config::Config;
use crate::transform::UpsertBatch;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Governor {
    parallelism: usize,
    write_batch_size: usize,
    raw_batch_size: usize,
}

impl Governor {
    // ---
    /// `parallelism` is capped at half of `pool_size`: an in-flight date
    /// keeps one connection for its run claim and needs at least one more
    /// to write.
    pub fn new(
        parallelism: usize,
        pool_size: u32,
        write_batch_size: usize,
        raw_batch_size: usize,
    ) -> Self {
        // ---
        Governor {
            parallelism: parallelism.min(pool_size as usize / 2).max(1),
            write_batch_size: write_batch_size.max(1),
            raw_batch_size: raw_batch_size.max(1),
        }
    }

    /// Settings from `cfg`; `parallel` overrides `PARALLELISM`.
    pub fn from_config(cfg: &Config, parallel: Option<usize>) -> Self {
        // ---
        Governor::new(
            parallel.unwrap_or(cfg.parallelism),
            cfg.db_pool_max,
            cfg.write_batch_size,
            cfg.raw_batch_size,
        )
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn raw_batch_size(&self) -> usize {
        self.raw_batch_size
    }

    /// Run `f` over `items` with at most `parallelism` futures in flight.
    ///
    /// Futures are created lazily as slots free up, and every result is
    /// collected: one failing item never cancels its siblings. Results come
    /// back in completion order.
    pub async fn for_each_bounded<I, F, Fut, T>(&self, items: I, f: F) -> Vec<T>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = T>,
    {
        // ---
        stream::iter(items)
            .map(f)
            .buffer_unordered(self.parallelism)
            .collect()
            .await
    }

    /// Split `batch` into write transactions of at most `write_batch_size` rows.
    pub fn chunks(&self, batch: UpsertBatch) -> Vec<UpsertBatch> {
        batch.chunks(self.write_batch_size)
    }
}
