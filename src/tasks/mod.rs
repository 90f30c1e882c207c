mod registry;
mod task;

pub use registry::TaskRegistry;
pub use task::{ProcessingProgress, ProcessingStatus, ProcessingTask, TaskKey};
