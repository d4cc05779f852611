use std::time::Duration;

use crate::{ApiVersion, API_VERSION};

/// How a host may call into a plugin from several threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConcurrency {
    /// At most one `call` per plugin is in flight; the host serialises them.
    #[default]
    Serialized,
    /// The plugin is thread-safe and `call` may run concurrently.
    Concurrent,
}

/// Host side settings applied to every plugin it loads.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// The API version the host implements.
    pub api_version: ApiVersion,
    /// Whether calls into a plugin are serialised.
    pub concurrency: CallConcurrency,
    /// Abandon calls that take longer than this.
    pub call_timeout: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION,
            concurrency: CallConcurrency::default(),
            call_timeout: None,
        }
    }
}

impl HostConfig {
    /// Set the API version the host implements.
    #[must_use]
    pub fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }

    /// Set whether calls into a plugin are serialised.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: CallConcurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Abandon calls that take longer than `timeout`.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
