//! Per-repository fallbacks for options a call leaves unset.

use crate::config::Config;
use crate::core::options::{BulkOptions, PseudoTableType, DEFAULT_BATCH_SIZE};

/// Defaults a connection applies to every command it runs.
#[derive(Debug, Clone)]
pub struct WorkerDefaults {
    /// Schema for unqualified table names.
    pub schema: String,
    pub batch_size: Option<usize>,
    pub pseudo_table: PseudoTableType,
}

impl WorkerDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema: config.database.schema().to_string(),
            batch_size: config.bulk.batch_size,
            pseudo_table: config.bulk.pseudo_table,
        }
    }

    /// Call option, then repository default, then [`DEFAULT_BATCH_SIZE`]. Zero counts as unset.
    pub fn batch_size(&self, options: &BulkOptions) -> usize {
        options
            .batch_size
            .filter(|n| *n > 0)
            .or(self.batch_size.filter(|n| *n > 0))
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn pseudo_table(&self, options: &BulkOptions) -> PseudoTableType {
        options.pseudo_table.unwrap_or(self.pseudo_table)
    }
}
