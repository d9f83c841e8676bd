use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;
use veld_resource::ResourceId;

use crate::resolver::{OutputResolver, Slot};
use crate::Value;

/// A deferred, possibly-secret value.
///
/// Outputs are dataflow nodes: literals, a named property of a
/// resource, or combinators over other outputs. Secrecy and the
/// dependency set are contagious through every transformation, and a
/// failed upstream resource fails everything derived from it.
#[derive(Clone)]
pub struct Output {
    secret: bool,
    dependencies: BTreeSet<ResourceId>,
    kind: Arc<Kind>,
}

type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

enum Kind {
    Literal(Value),
    Property {
        resource: ResourceId,
        property: String,
    },
    Map {
        source: Output,
        map: MapFn,
        memo: OnceCell<Resolution>,
    },
    Combine {
        sources: Vec<Output>,
        memo: OnceCell<Resolution>,
    },
}

/// Run-time resolution of an output.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { value: Value, secret: bool },
    /// Cannot be determined until after apply.
    Unknown,
    /// An upstream resource's apply failed.
    Failed(ResourceId),
}

/// Preview-time projection of an output against recorded state.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Known { value: Value, secret: bool },
    Unknown,
}

impl Output {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self {
            secret: false,
            dependencies: BTreeSet::new(),
            kind: Arc::new(Kind::Literal(value.into())),
        }
    }

    /// A literal whose value must never be rendered in plaintext.
    pub fn secret(value: impl Into<Value>) -> Self {
        Self {
            secret: true,
            ..Self::literal(value)
        }
    }

    /// An output bound to a named property of a resource, unresolved
    /// until that resource's operation completes.
    pub fn property(resource: ResourceId, property: impl Into<String>) -> Self {
        let dependencies = BTreeSet::from([resource.clone()]);
        Self {
            secret: false,
            dependencies,
            kind: Arc::new(Kind::Property {
                resource,
                property: property.into(),
            }),
        }
    }

    /// Derive a new output by applying `map` to the resolved value.
    ///
    /// Lazy: `map` runs once, after the source resolves, and the
    /// result is memoized.
    pub fn map(&self, map: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            secret: self.secret,
            dependencies: self.dependencies.clone(),
            kind: Arc::new(Kind::Map {
                source: self.clone(),
                map: Arc::new(map),
                memo: OnceCell::new(),
            }),
        }
    }

    /// Combine several outputs into one resolving to an array of their
    /// values, in order.
    pub fn combine(sources: impl IntoIterator<Item = Output>) -> Self {
        let sources: Vec<Output> = sources.into_iter().collect();
        let secret = sources.iter().any(|source| source.secret);
        let dependencies = sources
            .iter()
            .flat_map(|source| source.dependencies.iter().cloned())
            .collect();
        Self {
            secret,
            dependencies,
            kind: Arc::new(Kind::Combine {
                sources,
                memo: OnceCell::new(),
            }),
        }
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Resources that must complete before this output can resolve.
    pub fn dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.dependencies
    }

    /// Resolve against live run state, blocking on upstream slots.
    pub fn resolve<'a>(&'a self, resolver: &'a OutputResolver) -> BoxFuture<'a, Resolution> {
        Box::pin(async move {
            match &*self.kind {
                Kind::Literal(value) => Resolution::Resolved {
                    value: value.clone(),
                    secret: self.secret,
                },
                Kind::Property { resource, property } => {
                    match resolver.wait(resource).await {
                        Slot::Resolved(outputs) => match outputs.values.get(property) {
                            Some(value) => Resolution::Resolved {
                                value: value.clone(),
                                secret: self.secret || outputs.is_secret(property),
                            },
                            None => Resolution::Unknown,
                        },
                        Slot::Failed => Resolution::Failed(resource.clone()),
                        // wait() only returns on a terminal slot.
                        Slot::Pending => Resolution::Unknown,
                    }
                }
                Kind::Map { source, map, memo } => memo
                    .get_or_init(|| async {
                        match source.resolve(resolver).await {
                            Resolution::Resolved { value, secret } => Resolution::Resolved {
                                value: map(value),
                                secret: secret || self.secret,
                            },
                            other => other,
                        }
                    })
                    .await
                    .clone(),
                Kind::Combine { sources, memo } => memo
                    .get_or_init(|| async {
                        let mut values = Vec::with_capacity(sources.len());
                        let mut secret = self.secret;
                        let mut unknown = false;
                        for source in sources {
                            match source.resolve(resolver).await {
                                Resolution::Resolved {
                                    value,
                                    secret: source_secret,
                                } => {
                                    secret |= source_secret;
                                    values.push(value);
                                }
                                Resolution::Unknown => unknown = true,
                                Resolution::Failed(id) => return Resolution::Failed(id),
                            }
                        }
                        if unknown {
                            Resolution::Unknown
                        } else {
                            Resolution::Resolved {
                                value: Value::Array(values),
                                secret,
                            }
                        }
                    })
                    .await
                    .clone(),
            }
        })
    }

    /// Evaluate the same dataflow against a state lookup, without
    /// touching the memo caches. Used by the diff engine to project
    /// values before anything executes.
    pub fn project(&self, lookup: &dyn Fn(&ResourceId, &str) -> Projection) -> Projection {
        match &*self.kind {
            Kind::Literal(value) => Projection::Known {
                value: value.clone(),
                secret: self.secret,
            },
            Kind::Property { resource, property } => match lookup(resource, property) {
                Projection::Known { value, secret } => Projection::Known {
                    value,
                    secret: secret || self.secret,
                },
                Projection::Unknown => Projection::Unknown,
            },
            Kind::Map { source, map, .. } => match source.project(lookup) {
                Projection::Known { value, secret } => Projection::Known {
                    value: map(value),
                    secret: secret || self.secret,
                },
                Projection::Unknown => Projection::Unknown,
            },
            Kind::Combine { sources, .. } => {
                let mut values = Vec::with_capacity(sources.len());
                let mut secret = self.secret;
                for source in sources {
                    match source.project(lookup) {
                        Projection::Known {
                            value,
                            secret: source_secret,
                        } => {
                            secret |= source_secret;
                            values.push(value);
                        }
                        Projection::Unknown => return Projection::Unknown,
                    }
                }
                Projection::Known {
                    value: Value::Array(values),
                    secret,
                }
            }
        }
    }
}

impl Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.kind {
            Kind::Literal(value) => format!("Literal({value})"),
            Kind::Property { resource, property } => format!("Property({resource}.{property})"),
            Kind::Map { .. } => "Map".to_string(),
            Kind::Combine { sources, .. } => format!("Combine({})", sources.len()),
        };
        f.debug_struct("Output")
            .field("secret", &self.secret)
            .field("dependencies", &self.dependencies)
            .field("kind", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use crate::resolver::ResolvedOutputs;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test:thing", name)
    }

    #[test]
    fn secrecy_is_contagious_through_combinators() {
        let x = Output::secret("hunter2");
        let y = x.map(|v| v);
        let z = Output::combine([Output::literal("plain"), y.clone()]);
        assert!(y.is_secret());
        assert!(z.is_secret());
        assert!(z.map(|v| v).is_secret());
    }

    #[test]
    fn combine_unions_dependencies() {
        let a = Output::property(rid("a"), "id");
        let b = Output::property(rid("b"), "id");
        let combined = Output::combine([a, b]);
        assert_eq!(
            combined.dependencies().iter().cloned().collect::<Vec<_>>(),
            vec![rid("a"), rid("b")]
        );
    }

    #[tokio::test]
    async fn property_resolves_after_resource_resolution() {
        let resolver = OutputResolver::new();
        let output = Output::property(rid("a"), "hostname");

        let waiter = {
            let resolver = resolver.clone();
            let output = output.clone();
            tokio::spawn(async move { output.resolve(&resolver).await })
        };

        resolver.resolve(
            &rid("a"),
            ResolvedOutputs {
                values: IndexMap::from([("hostname".to_string(), json!("db.example.com"))]),
                ..Default::default()
            },
        );

        assert_eq!(
            waiter.await.unwrap(),
            Resolution::Resolved {
                value: json!("db.example.com"),
                secret: false,
            }
        );
    }

    #[tokio::test]
    async fn map_runs_once_and_memoizes() {
        let resolver = OutputResolver::new();
        resolver.resolve(
            &rid("a"),
            ResolvedOutputs {
                values: IndexMap::from([("n".to_string(), json!(2))]),
                ..Default::default()
            },
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let doubled = Output::property(rid("a"), "n").map(move |v| {
            counted.fetch_add(1, Ordering::SeqCst);
            json!(v.as_i64().unwrap() * 2)
        });

        let first = doubled.resolve(&resolver).await;
        let second = doubled.resolve(&resolver).await;
        assert_eq!(first, second);
        assert_eq!(
            first,
            Resolution::Resolved {
                value: json!(4),
                secret: false,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_propagates_through_derived_outputs() {
        let resolver = OutputResolver::new();
        resolver.fail(&rid("b"));

        let derived = Output::combine([
            Output::literal("ok"),
            Output::property(rid("b"), "id").map(|v| v),
        ]);
        assert_eq!(derived.resolve(&resolver).await, Resolution::Failed(rid("b")));
    }

    #[tokio::test]
    async fn secret_override_marks_all_properties() {
        let resolver = OutputResolver::new();
        resolver.resolve(
            &rid("a"),
            ResolvedOutputs {
                values: IndexMap::from([("password".to_string(), json!("s3cret"))]),
                all_secret: true,
                ..Default::default()
            },
        );

        let resolved = Output::property(rid("a"), "password").resolve(&resolver).await;
        assert_eq!(
            resolved,
            Resolution::Resolved {
                value: json!("s3cret"),
                secret: true,
            }
        );
    }

    #[test]
    fn projection_follows_state_lookup() {
        let known = |value: Value| Projection::Known {
            value,
            secret: false,
        };
        let output = Output::combine([
            Output::literal("https://"),
            Output::property(rid("storage"), "name"),
        ])
        .map(|v| {
            let parts: Vec<String> = v
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p.as_str().unwrap().to_string())
                .collect();
            json!(parts.join(""))
        });

        let projected = output.project(&|_, _| known(json!("blob")));
        assert_eq!(
            projected,
            Projection::Known {
                value: json!("https://blob"),
                secret: false,
            }
        );
        assert_eq!(output.project(&|_, _| Projection::Unknown), Projection::Unknown);
    }
}
