mod record;
mod secret;
mod store;

pub use crate::record::{digest, StateFile, StateRecord, StoredValue, STATE_VERSION};
pub use crate::secret::{SecretBox, SecretCipher};
pub use crate::store::{SnapshotRecord, StateError, StateSnapshot, StateStore};

pub type Value = serde_json::Value;
