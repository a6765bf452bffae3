//! String-keyed constructor registries (spec §11), standing in for the
//! upstream framework's reflective `Class.forName(storage_class)` /
//! `Class.forName(record_writer_provider_class)` loading: a fixed set of
//! implementations is registered ahead of time and resolved by the name
//! carried in [`crate::config::Config`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::ConfigurationError;
use crate::record_writer::{JsonLinesWriterProvider, RecordWriterProvider};
use crate::storage::{LocalFsStorage, Storage};

type StorageFactory = Box<dyn Fn(&Config) -> Result<Arc<dyn Storage>, ConfigurationError> + Send + Sync>;

/// Resolves [`Config::storage_class`] to a [`Storage`] implementation.
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    /// A registry pre-populated with every `Storage` implementation this
    /// crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("local_fs", |config| {
            Ok(Arc::new(LocalFsStorage::new(config.url.clone(), config.topics_dir.clone())) as Arc<dyn Storage>)
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        factory: impl Fn(&Config) -> Result<Arc<dyn Storage>, ConfigurationError> + Send + Sync + 'static,
    ) {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn resolve(&self, config: &Config) -> Result<Arc<dyn Storage>, ConfigurationError> {
        let factory = self.factories.get(&config.storage_class).ok_or_else(|| {
            ConfigurationError(format!("unknown storage_class: {}", config.storage_class))
        })?;
        factory(config)
    }
}

type RecordWriterProviderFactory = Box<dyn Fn() -> Arc<dyn RecordWriterProvider> + Send + Sync>;

/// Resolves [`Config::record_writer_provider_class`] to a
/// [`RecordWriterProvider`].
pub struct RecordWriterProviderRegistry {
    factories: HashMap<String, RecordWriterProviderFactory>,
}

impl RecordWriterProviderRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("json_lines", || Arc::new(JsonLinesWriterProvider) as Arc<dyn RecordWriterProvider>);
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        factory: impl Fn() -> Arc<dyn RecordWriterProvider> + Send + Sync + 'static,
    ) {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn resolve(&self, config: &Config) -> Result<Arc<dyn RecordWriterProvider>, ConfigurationError> {
        let factory = self.factories.get(&config.record_writer_provider_class).ok_or_else(|| {
            ConfigurationError(format!(
                "unknown record_writer_provider_class: {}",
                config.record_writer_provider_class
            ))
        })?;
        Ok(factory())
    }
}
