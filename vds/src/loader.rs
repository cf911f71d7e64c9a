use async_trait::async_trait;

use crate::{descriptor::DatasetDescriptor, dimension::Dimension, errors::Result};

/// Parses a single physical dataset into a descriptor.
///
/// Loading is opaque and possibly expensive; callers treat every call as
/// I/O. Implementations live outside this crate (file parsers, remote
/// fetchers); `testing::MemoryLoader` backs the tests.
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load(&self, location: &str) -> Result<DatasetDescriptor>;
}

/// Persisted dimension-size cache, keyed by member location.
///
/// The on-disk format belongs to the implementation; this crate only loads,
/// saves, and probes.
#[async_trait]
pub trait DimensionCache: Send + Sync {
    async fn load(&self, location: &str) -> Result<Option<Vec<Dimension>>>;

    async fn save(&self, location: &str, dimensions: &[Dimension]) -> Result<()>;

    async fn is_cached(&self, location: &str) -> bool;
}

/// Resolves a directory-scan element of an aggregation group into an
/// ordered list of member locations. Include/exclude and symlink policy
/// are the implementation's concern.
#[async_trait]
pub trait CatalogScanner: Send + Sync {
    async fn scan(&self, directory: &str, suffix: &str) -> Result<Vec<String>>;
}
