//! Cache configuration.

use strata_core::ConfigError;

use crate::push::DEFAULT_VERSION_CAPACITY;

/// Configuration for the entity cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Request only records changed since the last sync when the layer
    /// supports it. Off means every sync is a full fetch.
    pub delta_sync: bool,
    /// Records requested per page from the sync endpoints.
    pub page_size: usize,
    /// Maximum depth of each draft's undo stack.
    pub draft_undo_limit: usize,
    /// Buffered change events before slow subscribers start lagging.
    pub notify_capacity: usize,
    /// Instances whose last pushed version is remembered.
    pub version_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            delta_sync: true,
            page_size: 500,
            draft_undo_limit: 50,
            notify_capacity: 1024,
            version_capacity: DEFAULT_VERSION_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable delta sync.
    pub fn with_delta_sync(mut self, enabled: bool) -> Self {
        self.delta_sync = enabled;
        self
    }

    /// Set the sync page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the undo depth for drafts.
    pub fn with_draft_undo_limit(mut self, limit: usize) -> Self {
        self.draft_undo_limit = limit;
        self
    }

    /// Set the change-notification buffer size.
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }

    /// Set how many instances the push version tracker remembers.
    pub fn with_version_capacity(mut self, capacity: usize) -> Self {
        self.version_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: self.page_size.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.draft_undo_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "draft_undo_limit".to_string(),
                value: self.draft_undo_limit.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.notify_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notify_capacity".to_string(),
                value: self.notify_capacity.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.version_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "version_capacity".to_string(),
                value: self.version_capacity.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.delta_sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new()
            .with_delta_sync(false)
            .with_page_size(25)
            .with_draft_undo_limit(3);
        assert!(!config.delta_sync);
        assert_eq!(config.page_size, 25);
        assert_eq!(config.draft_undo_limit, 3);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let err = CacheConfig::new().with_page_size(0).validate().unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }
}
