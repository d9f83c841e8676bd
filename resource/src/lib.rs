mod id;

pub use crate::id::{ParseResourceIdError, ResourceId, ResourceName, ResourceType};
