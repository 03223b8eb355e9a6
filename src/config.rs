use std::collections::HashMap;
use std::sync::Arc;

use crate::client_config::{ClientGenerator, ClientSpec, HttpOptions, RequestOptions, RetryOptions};
use crate::error::{DispatcherError, DispatcherResult};
use crate::transport::Transport;

/// Options merged under every generated client spec. Spec values win.
#[derive(Clone, Default)]
pub struct ClientDefaults {
    pub request_options: RequestOptions,
    pub retry_options: RetryOptions,
    pub http_options: HttpOptions,
}

/// Construction options for a [`crate::dispatcher::Dispatcher`].
#[derive(Clone)]
pub struct DispatcherOptions {
    /// Key material for the credential cache cipher.
    pub encryption_key: String,
    /// Storage and pub/sub backend shared by the fleet.
    pub transport: Arc<dyn Transport>,
    /// Optional namespace prefix, for several deployments sharing one
    /// Redis. Instances must agree on it to see each other.
    pub key_prefix: Option<String>,
    /// Named factories producing this instance's client specs.
    pub client_generators: HashMap<String, ClientGenerator>,
    pub default_client_options: ClientDefaults,
    /// Election priority. Higher wins controller roles.
    pub priority: i64,
}

impl DispatcherOptions {
    pub fn new(encryption_key: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            encryption_key: encryption_key.to_string(),
            transport,
            key_prefix: None,
            client_generators: HashMap::new(),
            default_client_options: ClientDefaults::default(),
            priority: 1,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_generator<F>(mut self, name: &str, generator: F) -> Self
    where
        F: Fn() -> Vec<ClientSpec> + Send + Sync + 'static,
    {
        self.client_generators
            .insert(name.to_string(), Arc::new(generator));
        self
    }

    pub fn with_default_client_options(mut self, defaults: ClientDefaults) -> Self {
        self.default_client_options = defaults;
        self
    }

    pub fn validate(&self) -> DispatcherResult<()> {
        if self.encryption_key.is_empty() {
            return Err(DispatcherError::InvalidSpec(
                "encryption key must not be empty".to_string(),
            ));
        }
        for name in self.client_generators.keys() {
            if name.is_empty() {
                return Err(DispatcherError::InvalidSpec(
                    "generator names must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHub;

    #[test]
    fn builder_collects_generators() {
        let hub = MemoryHub::new();
        let options = DispatcherOptions::new("key", hub.transport())
            .with_priority(3)
            .with_prefix("app:")
            .with_generator("svc", || vec![ClientSpec::new("svc")]);

        assert_eq!(options.priority, 3);
        assert_eq!(options.key_prefix.as_deref(), Some("app:"));
        assert_eq!(options.client_generators.len(), 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn empty_encryption_key_is_rejected() {
        let hub = MemoryHub::new();
        let options = DispatcherOptions::new("", hub.transport());
        assert!(options.validate().is_err());
    }
}
