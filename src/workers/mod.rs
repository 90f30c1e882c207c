//! Workers turn the source text of a task into result text.
//!
//! The orchestrator only sees the [`Worker`] trait. Concrete workers are
//! looked up by id in a [`WorkerRegistry`] that is filled once at startup.

mod anthropic;
mod echo;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use anthropic::AnthropicWorker;
pub use echo::EchoWorker;

use crate::config::RunConfig;
use crate::error::{ConfigError, WorkerError};

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Produces the result for one prompt. `timeout` is a hint for the
    /// worker's own transport; the orchestrator enforces it as well.
    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, WorkerError>;
}

pub type WorkerFactory = Box<dyn Fn(&RunConfig) -> Result<Arc<dyn Worker>, ConfigError> + Send + Sync>;

/// Explicit worker id → factory table.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: BTreeMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the workers shipped in this crate: `echo` and `anthropic`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", |_| Ok(Arc::new(EchoWorker) as Arc<dyn Worker>));
        registry.register("anthropic", |config| {
            let worker = AnthropicWorker::from_settings(&config.anthropic)?;
            Ok(Arc::new(worker) as Arc<dyn Worker>)
        });
        registry
    }

    /// Adds or replaces the factory for `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&RunConfig) -> Result<Arc<dyn Worker>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
    }

    /// Registers an already-built worker instance under `id`.
    pub fn register_instance(&mut self, id: impl Into<String>, worker: Arc<dyn Worker>) {
        self.register(id, move |_| Ok(Arc::clone(&worker)));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the worker registered as `id`. Unknown ids are a
    /// configuration error.
    pub fn build(&self, id: &str, config: &RunConfig) -> Result<Arc<dyn Worker>, ConfigError> {
        let factory = self.factories.get(id).ok_or_else(|| ConfigError::UnknownWorker {
            worker: id.to_string(),
            target: "worker registry".to_string(),
        })?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_ids() {
        let registry = WorkerRegistry::with_builtin();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["anthropic", "echo"]);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("gpt"));
    }

    #[tokio::test]
    async fn builds_echo_worker() {
        let registry = WorkerRegistry::with_builtin();
        let worker = registry.build("echo", &RunConfig::default()).unwrap();
        assert_eq!(worker.name(), "echo");
        let out = worker.execute("hello", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn unknown_id_is_config_error() {
        let registry = WorkerRegistry::with_builtin();
        let err = registry.build("gpt", &RunConfig::default()).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownWorker { ref worker, .. } if worker == "gpt"));
    }

    #[test]
    fn anthropic_worker_needs_api_key() {
        let registry = WorkerRegistry::with_builtin();
        let mut config = RunConfig::default();
        config.anthropic.api_key.clear();
        let err = registry.build("anthropic", &config).err().unwrap();
        assert!(matches!(err, ConfigError::WorkerSetup { .. }));
    }

    #[tokio::test]
    async fn registered_instance_is_shared() {
        let mut registry = WorkerRegistry::new();
        let echo: Arc<dyn Worker> = Arc::new(EchoWorker);
        registry.register_instance("mine", Arc::clone(&echo));
        let built = registry.build("mine", &RunConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&built, &echo));
    }
}
