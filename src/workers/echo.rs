use std::time::Duration;

use async_trait::async_trait;

use super::Worker;
use crate::error::WorkerError;

/// Returns the prompt unchanged. Used by `demo` and as a dry-run worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
        Ok(prompt.to_string())
    }
}
