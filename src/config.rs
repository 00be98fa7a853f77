//! Tuning knobs for the tree engine and the group coordinator.

use std::time::Duration;

use crate::errors::{SpatialError, SpatialResult};

/// Default maximum children per node.
pub const DEFAULT_MAX_FILLED: usize = 80;

/// Default minimum children per node after a split.
pub const DEFAULT_MIN_FILLED: usize = 40;

/// Default delay before a header commit is attempted.
pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(1);

/// Default number of documents between updater checkpoints.
pub const DEFAULT_CHECKPOINT_DOCS: usize = 500;

/// Default node cache capacity, in nodes.
pub const DEFAULT_CACHE_NODES: usize = 1024;

/// Fill bounds for tree nodes.
///
/// A node splits when an insertion would bring it to `max_filled` children;
/// each half of a non-degenerate split holds at least `min_filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    pub min_filled: usize,
    pub max_filled: usize,
}

impl TreeConfig {
    pub fn new(min_filled: usize, max_filled: usize) -> SpatialResult<TreeConfig> {
        let config = TreeConfig {
            min_filled,
            max_filled,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SpatialResult<()> {
        if self.min_filled < 2 || self.max_filled < 2 * self.min_filled {
            return Err(SpatialError::InvalidOperation(format!(
                "invalid fill bounds: min_filled={} max_filled={} (need min >= 2 and max >= 2*min)",
                self.min_filled, self.max_filled
            )));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            min_filled: DEFAULT_MIN_FILLED,
            max_filled: DEFAULT_MAX_FILLED,
        }
    }
}

/// Configuration for a spatial group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub tree: TreeConfig,
    /// Delay between an updater progress report and the header commit attempt.
    pub commit_delay: Duration,
    /// Documents processed between updater checkpoints.
    pub checkpoint_docs: usize,
    /// Node cache capacity.
    pub cache_nodes: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            tree: TreeConfig::default(),
            commit_delay: DEFAULT_COMMIT_DELAY,
            checkpoint_docs: DEFAULT_CHECKPOINT_DOCS,
            cache_nodes: DEFAULT_CACHE_NODES,
        }
    }
}
