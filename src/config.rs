//! Connector configuration.
//!
//! Bootstrap and parsing of these values from a properties file or CLI is an
//! external collaborator (§1, out of scope); this module only validates a
//! config once it has already been constructed.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Recognized configuration options (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rotation threshold, in records, for a partition's temp artifact.
    pub flush_size: usize,

    /// Base backoff, in milliseconds, applied after a partition drain fails.
    pub retry_backoff_ms: u64,

    /// Root URI of the distributed file store.
    pub url: String,

    /// Subdirectory under `url` holding per-topic partition directories.
    pub topics_dir: String,

    /// Registry key resolved to a concrete [`crate::storage::Storage`] impl.
    pub storage_class: String,

    /// Registry key resolved to a concrete
    /// [`crate::record_writer::RecordWriterProvider`] impl.
    pub record_writer_provider_class: String,
}

impl Config {
    /// Validate the config, surfacing a [`ConfigurationError`] for anything
    /// that would make the core misbehave. Called once at startup, never
    /// from the hot path (§11).
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.flush_size == 0 {
            return Err(ConfigurationError("flush_size must be positive".into()));
        }
        if self.url.is_empty() {
            return Err(ConfigurationError("url must not be empty".into()));
        }
        if self.storage_class.is_empty() {
            return Err(ConfigurationError("storage_class must not be empty".into()));
        }
        if self.record_writer_provider_class.is_empty() {
            return Err(ConfigurationError(
                "record_writer_provider_class must not be empty".into(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            flush_size: 100,
            retry_backoff_ms: 5_000,
            url: "file:///data".into(),
            topics_dir: "topics".into(),
            storage_class: "local_fs".into(),
            record_writer_provider_class: "json_lines".into(),
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_flush_size() {
        let mut c = base();
        c.flush_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_empty_url() {
        let mut c = base();
        c.url = String::new();
        assert!(c.validate().is_err());
    }
}
