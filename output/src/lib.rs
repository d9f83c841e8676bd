mod output;
mod resolver;

pub use crate::output::{Output, Projection, Resolution};
pub use crate::resolver::{OutputResolver, ResolvedOutputs, Slot};

pub type Value = serde_json::Value;
