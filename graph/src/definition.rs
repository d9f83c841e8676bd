use std::collections::BTreeSet;

use indexmap::IndexMap;
use veld_output::{Output, Projection, Value};
use veld_resource::ResourceId;

/// One input property of a resource: a literal value or a deferred
/// output of another resource.
#[derive(Debug, Clone)]
pub enum Input {
    Value { value: Value, secret: bool },
    Output(Output),
}

impl Input {
    pub fn literal(value: impl Into<Value>) -> Self {
        Input::Value {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<Value>) -> Self {
        Input::Value {
            value: value.into(),
            secret: true,
        }
    }

    pub fn output(output: Output) -> Self {
        Input::Output(output)
    }

    /// Resources this input's value depends on.
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        match self {
            Input::Value { .. } => BTreeSet::new(),
            Input::Output(output) => output.dependencies().clone(),
        }
    }

    pub fn is_secret(&self) -> bool {
        match self {
            Input::Value { secret, .. } => *secret,
            Input::Output(output) => output.is_secret(),
        }
    }

    /// Project this input against recorded state (see
    /// [`Output::project`]).
    pub fn project(&self, lookup: &dyn Fn(&ResourceId, &str) -> Projection) -> Projection {
        match self {
            Input::Value { value, secret } => Projection::Known {
                value: value.clone(),
                secret: *secret,
            },
            Input::Output(output) => output.project(lookup),
        }
    }
}

/// A declarative resource definition.
///
/// Identity is immutable; inputs may change across runs, which is what
/// the diff engine classifies. `parent` scopes the resource under an
/// owning resource (tag inheritance, plus an ordering edge);
/// `depends_on` declares ordering the inputs don't already imply.
#[derive(Debug, Clone)]
pub struct Definition {
    pub id: ResourceId,
    pub inputs: IndexMap<String, Input>,
    pub parent: Option<ResourceId>,
    pub depends_on: BTreeSet<ResourceId>,
}

impl Definition {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            inputs: IndexMap::new(),
            parent: None,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, input: Input) -> Self {
        self.inputs.insert(name.into(), input);
        self
    }

    pub fn parent(mut self, parent: ResourceId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn depends_on(mut self, dependency: ResourceId) -> Self {
        self.depends_on.insert(dependency);
        self
    }
}
