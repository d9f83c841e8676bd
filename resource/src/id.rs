use std::fmt::Display;
use std::str::FromStr;

use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resource type token, e.g. `azure:sql-server`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(pub String);

impl ResourceType {
    pub fn new(ty: impl Into<String>) -> Self {
        Self(ty.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The logical name an author gives a resource within a definition set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(pub String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource identity: `(type, logical name)`, unique within a graph and
/// immutable once the resource has been created.
///
/// Rendered as `type::name`, which is also the key format of the state
/// file, so identities must order and compare stably.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub ty: ResourceType,
    pub name: ResourceName,
}

impl ResourceId {
    pub fn new(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ResourceType::new(ty),
            name: ResourceName::new(name),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.ty, self.name)
    }
}

#[derive(Debug, Clone, Error, DisplayDoc)]
pub enum ParseResourceIdError {
    /// Expected `type::name`, got "{0}"
    MissingSeparator(String),
    /// Empty type in resource id "{0}"
    EmptyType(String),
    /// Empty name in resource id "{0}"
    EmptyName(String),
}

impl FromStr for ResourceId {
    type Err = ParseResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((ty, name)) = s.split_once("::") else {
            return Err(ParseResourceIdError::MissingSeparator(s.to_string()));
        };
        if ty.is_empty() {
            return Err(ParseResourceIdError::EmptyType(s.to_string()));
        }
        if name.is_empty() {
            return Err(ParseResourceIdError::EmptyName(s.to_string()));
        }
        Ok(ResourceId::new(ty, name))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
