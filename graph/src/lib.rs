mod build;
mod definition;

pub use crate::build::{build, BuildError, CycleError, Graph};
pub use crate::definition::{Definition, Input};
