use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    descriptor::DatasetDescriptor,
    dimension::Dimension,
    errors::{Error, Result},
    loader::DatasetLoader,
};

/// One participant dataset in an aggregation.
///
/// A member is a shared, immutable-after-construction handle: aggregation
/// strategies hold `Arc<MemberDataset>` lists, never owned clones. The
/// descriptor is loaded at most once per instance, and the dimension-size
/// cache is write-once per key unless explicitly flushed.
pub struct MemberDataset {
    location: String,
    loader: Option<Arc<dyn DatasetLoader>>,
    descriptor: Mutex<Option<Arc<DatasetDescriptor>>>,
    dim_sizes: Mutex<HashMap<String, u32>>,
}

impl MemberDataset {
    pub fn new<S: Into<String>>(location: S, loader: Arc<dyn DatasetLoader>) -> Self {
        Self {
            location: location.into(),
            loader: Some(loader),
            descriptor: Mutex::new(None),
            dim_sizes: Mutex::new(HashMap::new()),
        }
    }

    /// A member backed by an in-memory descriptor instead of a loadable
    /// location, e.g. the output of a nested aggregation. The location may
    /// be empty.
    pub fn virtual_member<S: Into<String>>(
        location: S,
        descriptor: Arc<DatasetDescriptor>,
    ) -> Self {
        Self {
            location: location.into(),
            loader: None,
            descriptor: Mutex::new(Some(descriptor)),
            dim_sizes: Mutex::new(HashMap::new()),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_virtual(&self) -> bool {
        self.loader.is_none()
    }

    /// The parsed dataset. The first call on a non-virtual member performs
    /// the load; later calls reuse it.
    pub async fn descriptor(&self) -> Result<Arc<DatasetDescriptor>> {
        if let Some(descriptor) = self.descriptor.lock().clone() {
            return Ok(descriptor);
        }

        let loader = self.loader.as_ref().ok_or_else(|| Error::Load {
            location: self.location.clone(),
            reason: String::from("virtual member has no loader"),
        })?;
        let descriptor = loader.load(&self.location).await.map_err(|err| match err {
            Error::Load { .. } => err,
            other => Error::Load {
                location: self.location.clone(),
                reason: other.to_string(),
            },
        })?;
        let descriptor = Arc::new(descriptor);
        *self.descriptor.lock() = Some(Arc::clone(&descriptor));

        Ok(descriptor)
    }

    pub fn cached_dimension_size(&self, name: &str) -> Option<u32> {
        self.dim_sizes.lock().get(name).copied()
    }

    pub fn is_dimension_cached(&self, name: &str) -> bool {
        self.dim_sizes.lock().contains_key(name)
    }

    /// Seed one cache entry. Entries are immutable once set; overwriting an
    /// existing entry requires `overwrite`.
    pub fn set_dimension_cache(&self, dimension: &Dimension, overwrite: bool) -> Result<()> {
        let mut sizes = self.dim_sizes.lock();
        if !overwrite && sizes.contains_key(&dimension.name) {
            return Err(Error::DuplicateDimension {
                name: dimension.name.clone(),
                location: self.location.clone(),
            });
        }
        sizes.insert(dimension.name.clone(), dimension.size);

        Ok(())
    }

    /// Force a full load purely to discover dimension sizes. Expensive;
    /// used only when no cardinality hint or persisted cache entry exists.
    /// Entries already cached are left untouched.
    pub async fn fill_dimension_cache_from_descriptor(&self) -> Result<()> {
        let descriptor = self.descriptor().await?;
        let mut sizes = self.dim_sizes.lock();
        for dimension in &descriptor.dimensions {
            sizes.entry(dimension.name.clone()).or_insert(dimension.size);
        }

        Ok(())
    }

    pub fn flush_dimension_cache(&self) {
        self.dim_sizes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn test_descriptor_loaded_once() -> Result<()> {
        let memory_loader = testing::MemoryLoader::new();
        memory_loader.insert("a.nc", testing::scalar_f64_dataset("a.nc", "temp", 10.0));
        let loader: Arc<dyn DatasetLoader> = Arc::new(memory_loader.clone());
        let member = MemberDataset::new("a.nc", loader);

        let first = member.descriptor().await?;
        let second = member.descriptor().await?;

        assert_eq!(first.name, "a.nc");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memory_loader.load_count("a.nc"), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_descriptor_load_failure() {
        let loader: Arc<dyn DatasetLoader> = Arc::new(testing::MemoryLoader::new());
        let member = MemberDataset::new("missing.nc", loader);

        match member.descriptor().await {
            Err(Error::Load { location, .. }) => assert_eq!(location, "missing.nc"),
            Err(other) => panic!("expected Load error, got {other:?}"),
            Ok(_) => panic!("expected Load error"),
        }
    }

    #[tokio::test]
    async fn test_virtual_member_never_loads() -> Result<()> {
        let descriptor = Arc::new(testing::scalar_f64_dataset("", "temp", 1.0));
        let member = MemberDataset::virtual_member("", descriptor);

        assert!(member.is_virtual());
        assert_eq!(member.descriptor().await?.variables.len(), 1);

        Ok(())
    }

    #[test]
    fn test_dimension_cache_write_once() -> Result<()> {
        let loader: Arc<dyn DatasetLoader> = Arc::new(testing::MemoryLoader::new());
        let member = MemberDataset::new("a.nc", loader);

        assert!(!member.is_dimension_cached("time"));
        member.set_dimension_cache(&Dimension::new("time", 5), false)?;
        assert_eq!(member.cached_dimension_size("time"), Some(5));

        let duplicate = member.set_dimension_cache(&Dimension::new("time", 6), false);
        assert!(matches!(duplicate, Err(Error::DuplicateDimension { .. })));
        assert_eq!(member.cached_dimension_size("time"), Some(5));

        member.set_dimension_cache(&Dimension::new("time", 6), true)?;
        assert_eq!(member.cached_dimension_size("time"), Some(6));

        Ok(())
    }

    #[tokio::test]
    async fn test_fill_cache_from_descriptor() -> Result<()> {
        let loader = testing::MemoryLoader::new();
        loader.insert(
            "a.nc",
            testing::array_f64_dataset("a.nc", "temp", &[("time", 5), ("lat", 3)], None),
        );
        let member = MemberDataset::new("a.nc", Arc::new(loader.clone()));
        member.set_dimension_cache(&Dimension::new("time", 99), false)?;

        member.fill_dimension_cache_from_descriptor().await?;

        // Existing entries stay put until flushed
        assert_eq!(member.cached_dimension_size("time"), Some(99));
        assert_eq!(member.cached_dimension_size("lat"), Some(3));

        member.flush_dimension_cache();
        assert!(!member.is_dimension_cached("time"));
        assert!(!member.is_dimension_cached("lat"));

        Ok(())
    }
}
