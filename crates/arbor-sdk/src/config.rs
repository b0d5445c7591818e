use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use arbor_store::BulkQueryConfig;
use arbor_sync::DEFAULT_INVALIDATION_LIMIT;
use arbor_types::ClientIdGenerator;
use arbor_version::INLINE_OPERATIONS_LIMIT;

use crate::error::{SdkError, SdkResult};

/// Settings of one repository handle.
///
/// Every field has a default, so a TOML file only needs the keys it
/// overrides:
///
/// ```toml
/// batch_size = 1000
/// poll_timeout_secs = 5
/// client_id = 42
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Maximum number of hashes per backend round trip.
    pub batch_size: usize,
    /// Capacity of the decoded object cache.
    pub cache_size: usize,
    /// Versions with more operations than this store them out of line.
    pub inline_operations_limit: usize,
    pub poll_timeout_secs: u64,
    /// Tracked nodes before an invalidation tree coarsens.
    pub invalidation_limit: usize,
    /// Client namespace for generated ids; random when unset.
    pub client_id: Option<u32>,
    /// Recorded on regular, undo and revert versions.
    pub author: Option<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        let bulk = BulkQueryConfig::default();
        Self {
            batch_size: bulk.batch_size,
            cache_size: bulk.cache_size,
            inline_operations_limit: INLINE_OPERATIONS_LIMIT,
            poll_timeout_secs: 30,
            invalidation_limit: DEFAULT_INVALIDATION_LIMIT,
            client_id: None,
            author: None,
        }
    }
}

impl RepositoryConfig {
    pub fn from_toml(text: &str) -> SdkResult<Self> {
        toml::from_str(text).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> SdkResult<String> {
        toml::to_string(self).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn bulk(&self) -> BulkQueryConfig {
        BulkQueryConfig {
            batch_size: self.batch_size,
            cache_size: self.cache_size,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn id_generator(&self) -> ClientIdGenerator {
        match self.client_id {
            Some(id) => ClientIdGenerator::new(id),
            None => ClientIdGenerator::random(),
        }
    }
}
