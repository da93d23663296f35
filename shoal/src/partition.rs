//! Batch partitioning of a discovered repository list.
//!
//! Partitioning is a pure function of the repository list and the
//! [`SchedulingPolicy`]. Batch boundaries must be stable for a given input
//! because a batch's index doubles as the worker index handed to the
//! dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SchedulingPolicy;
use crate::error::{Error, Result};

/// An ordered slice of the repository list assigned to one worker.
pub type Batch = Vec<String>;

/// How a repository list is cut into batches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// A single batch holding every repository.
    #[default]
    None,
    /// `batch_size` is the number of batches to produce.
    FixedBatchCount,
    /// `batch_size` is the maximum number of repositories per batch.
    FixedBatchSize,
}

impl PartitionStrategy {
    /// Returns the configuration spelling of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FixedBatchCount => "fixed-batch-count",
            Self::FixedBatchSize => "fixed-batch-size",
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits `repositories` into ordered batches according to `policy`.
///
/// The concatenation of the returned batches always equals the input, in
/// order. An empty input yields no batches regardless of strategy.
///
/// # Errors
///
/// Returns [`Error::InvalidBatchSize`] when a sized strategy is configured
/// with `batch_size <= 0`. The check runs before the empty-input shortcut so a
/// misconfiguration is reported even while discovery returns nothing.
pub fn partition(repositories: &[String], policy: &SchedulingPolicy) -> Result<Vec<Batch>> {
    let size = match policy.strategy {
        PartitionStrategy::None => None,
        strategy => {
            if policy.batch_size <= 0 {
                return Err(Error::InvalidBatchSize {
                    strategy,
                    size: policy.batch_size,
                });
            }
            Some(usize::try_from(policy.batch_size).unwrap_or(usize::MAX))
        }
    };

    if repositories.is_empty() {
        return Ok(Vec::new());
    }

    let batches = match (policy.strategy, size) {
        (PartitionStrategy::FixedBatchSize, Some(size)) => slice_by_size(repositories, size),
        (PartitionStrategy::FixedBatchCount, Some(count)) => slice_by_count(repositories, count),
        _ => vec![repositories.to_vec()],
    };

    Ok(batches)
}

fn slice_by_size(repositories: &[String], size: usize) -> Vec<Batch> {
    repositories.chunks(size).map(<[String]>::to_vec).collect()
}

// Contiguous slices whose lengths differ by at most one; the leading
// batches absorb the remainder.
fn slice_by_count(repositories: &[String], count: usize) -> Vec<Batch> {
    let count = count.min(repositories.len());
    let base = repositories.len() / count;
    let remainder = repositories.len() % count;

    let mut batches = Vec::with_capacity(count);
    let mut offset = 0;
    for index in 0..count {
        let len = base + usize::from(index < remainder);
        batches.push(repositories[offset..offset + len].to_vec());
        offset += len;
    }
    batches
}
