//! Concurrency-bounded, paced batch fetching.
//!
//! Targets are split into consecutive groups of `concurrency_limit`. A group
//! runs all of its fetches concurrently and waits for every one of them to
//! settle before the next group starts, after `inter_batch_delay_ms`.

use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use coalesce_core::constants::{DEFAULT_CONCURRENCY_LIMIT, DEFAULT_INTER_BATCH_DELAY_MS};
use coalesce_core::error::{CoalesceError, Result};

/// Batch configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum simultaneous fetches per group
    pub concurrency_limit: usize,
    /// Pause between consecutive groups in milliseconds
    pub inter_batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            inter_batch_delay_ms: DEFAULT_INTER_BATCH_DELAY_MS,
        }
    }
}

impl BatchConfig {
    /// Creates a config with the given group size and pacing.
    pub fn new(concurrency_limit: usize, inter_batch_delay: Duration) -> Self {
        Self {
            concurrency_limit,
            inter_batch_delay_ms: inter_batch_delay.as_millis() as u64,
        }
    }

    /// Pause between consecutive groups.
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    /// Rejects a zero group size.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(CoalesceError::Config("concurrency_limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Ordered partition of `len` targets into groups of at most `limit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    groups: Vec<Range<usize>>,
}

impl BatchPlan {
    /// Plans `len` targets in groups of `limit` (a zero limit is treated as 1).
    pub fn new(len: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        let groups = (0..len)
            .step_by(limit)
            .map(|start| start..(start + limit).min(len))
            .collect();
        Self { groups }
    }

    /// Index ranges of each group, in order.
    pub fn groups(&self) -> &[Range<usize>] {
        &self.groups
    }

    /// Size of each group, in order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.len()).collect()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if there is nothing to fetch.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Runs many fetches in paced, concurrency-bounded groups.
#[derive(Clone, Debug, Default)]
pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    /// Creates a scheduler with the given configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Returns the batch configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Fetches every target, returning results in input order.
    ///
    /// Fetches within a group run concurrently and all of them settle even if
    /// one fails. If any fetch in a group fails, the first failure to complete
    /// is returned once the group has settled and later groups are not
    /// started. Groups are separated by the configured pause; there is no
    /// pause after the last group.
    #[instrument(skip_all, fields(targets = targets.len(), limit = self.config.concurrency_limit))]
    pub async fn fetch_all<T, R, F, Fut>(&self, targets: Vec<T>, fetch_one: F) -> Result<Vec<R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let plan = BatchPlan::new(targets.len(), self.config.concurrency_limit);
        let mut results: Vec<Option<R>> = Vec::with_capacity(targets.len());
        let mut remaining = targets.into_iter();

        for (group_index, range) in plan.groups().iter().enumerate() {
            if group_index > 0 && self.config.inter_batch_delay_ms > 0 {
                tokio::time::sleep(self.config.inter_batch_delay()).await;
            }
            debug!(group = group_index + 1, of = plan.len(), size = range.len(), "Starting batch group");

            let mut pending: FuturesUnordered<_> = remaining
                .by_ref()
                .take(range.len())
                .zip(range.clone())
                .map(|(target, index)| {
                    let fetch = fetch_one(target);
                    async move { (index, fetch.await) }
                })
                .collect();

            let mut slots: Vec<Option<R>> = (0..range.len()).map(|_| None).collect();
            let mut first_failure: Option<CoalesceError> = None;

            while let Some((index, outcome)) = pending.next().await {
                match outcome {
                    Ok(value) => slots[index - range.start] = Some(value),
                    Err(e) => {
                        warn!(target_index = index, error = %e, "Batch target failed");
                        first_failure.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = first_failure {
                return Err(e);
            }
            results.extend(slots);
        }

        Ok(results.into_iter().flatten().collect())
    }
}
