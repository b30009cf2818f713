//! Storage drivers registered by name and constructed from configuration.

use std::collections::BTreeMap;
use std::fmt;

use storage_driver::{StorageError, StorageErrorKind};

use crate::{Storage, StorageConfig};

type Factory = Box<dyn Fn(&StorageConfig) -> Result<Storage, StorageError> + Send + Sync>;

/// A set of storage driver constructors, keyed by driver name.
///
/// Drivers are registered once at process start. [`StorageConfig::build`] resolves
/// the configured driver through [`DriverRegistry::with_defaults`].
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, Factory>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every driver compiled into this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |config| match config {
            StorageConfig::Memory { bucket } => {
                Ok(crate::MemoryStorage::with_buckets(&[bucket.as_str()]).into())
            }
            other => Err(mismatch("memory", other)),
        });

        #[cfg(feature = "local")]
        registry.register("local", |config| match config {
            StorageConfig::Local { path } => Ok(crate::LocalDriver::new(path.clone()).into()),
            other => Err(mismatch("local", other)),
        });

        #[cfg(feature = "tmp")]
        registry.register("temp", |config| match config {
            StorageConfig::Temp => Ok(crate::TempDriver::new()
                .map_err(|err| StorageError::io("temp", err))?
                .into()),
            other => Err(mismatch("temp", other)),
        });

        registry
    }

    /// Register a driver constructor, replacing any previous one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StorageConfig) -> Result<Storage, StorageError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Names of the registered drivers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Construct the driver named by `config`.
    pub fn build(&self, config: &StorageConfig) -> Result<Storage, StorageError> {
        let name = config.driver();
        let factory = self.factories.get(name).ok_or_else(|| {
            StorageError::new(
                "registry",
                StorageErrorKind::InvalidRequest,
                format!("no storage driver registered as {name}"),
            )
        })?;
        tracing::debug!(driver = name, "building storage driver");
        factory(config)
    }
}

fn mismatch(name: &str, config: &StorageConfig) -> StorageError {
    StorageError::new(
        "registry",
        StorageErrorKind::InvalidRequest,
        format!(
            "{name} driver cannot be built from {} configuration",
            config.driver()
        ),
    )
}
