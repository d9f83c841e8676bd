mod executor;
mod report;
mod retry;

pub use crate::executor::{Engine, EngineError, EngineOptions};
pub use crate::report::{ApplyReport, ResourceStatus};
pub use crate::retry::RetryPolicy;
