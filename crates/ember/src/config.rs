//! Configuration for engine handles and the host engine.

use crate::types::Context;

/// Options for one [`Engine`](crate::dispatch::Engine) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Query the native engine after every operation and compare what it
    /// reports with the descriptor the dispatch layer computed.
    pub verify_metadata: bool,

    /// Context for descriptors that name none. When absent the native
    /// engine's own default applies.
    pub default_context: Option<Context>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_metadata: true,
            default_context: None,
        }
    }
}

impl EngineConfig {
    pub fn with_verify_metadata(mut self, verify: bool) -> Self {
        self.verify_metadata = verify;
        self
    }

    pub fn with_default_context(mut self, context: Context) -> Self {
        self.default_context = Some(context);
        self
    }
}

/// Options for the in-process [`HostEngine`](crate::engine::HostEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HostConfig {
    /// Upper bound on bytes held by live allocations; unbounded when absent.
    pub capacity_bytes: Option<usize>,

    /// Number of addressable `cpu(i)` contexts.
    pub cpu_count: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: None,
            cpu_count: 1,
        }
    }
}

impl HostConfig {
    pub fn with_capacity_bytes(mut self, capacity: usize) -> Self {
        self.capacity_bytes = Some(capacity);
        self
    }

    pub fn with_cpu_count(mut self, count: usize) -> Self {
        self.cpu_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let engine = EngineConfig::default();
        assert!(engine.verify_metadata);
        assert_eq!(engine.default_context, None);

        let host = HostConfig::default();
        assert_eq!(host.capacity_bytes, None);
        assert_eq!(host.cpu_count, 1);
    }

    #[test]
    fn test_builders() {
        let engine = EngineConfig::default()
            .with_verify_metadata(false)
            .with_default_context(Context::cpu_at(1));
        assert!(!engine.verify_metadata);
        assert_eq!(engine.default_context, Some(Context::cpu_at(1)));

        let host = HostConfig::default().with_capacity_bytes(1024).with_cpu_count(4);
        assert_eq!(host.capacity_bytes, Some(1024));
        assert_eq!(host.cpu_count, 4);
    }
}
