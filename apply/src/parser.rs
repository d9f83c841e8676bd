use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use veld_graph::{Definition, Input};
use veld_output::Output;
use veld_resource::ResourceId;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read definitions file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("definitions file {path} is not valid JSON")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid reference {reference:?} (expected \"type::name.property\")")]
    Reference { reference: String },
}

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    resources: Vec<ResourceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceEntry {
    #[serde(rename = "type")]
    ty: String,
    name: String,
    #[serde(default)]
    inputs: IndexMap<String, Value>,
    #[serde(default)]
    depends_on: Vec<ResourceId>,
    #[serde(default)]
    parent: Option<ResourceId>,
}

/// Load resource definitions from a JSON file.
///
/// Each input property is a plain JSON value, or one of three forms:
/// `{"$ref": "type::name.property"}` for another resource's output,
/// `{"$secret": value}` for a value that must never render in
/// plaintext, and `{"$concat": [part, ...]}` which joins its parts
/// (themselves any of these forms) into one string.
pub async fn load_definitions(path: &Path) -> Result<Vec<Definition>, ParseError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: DefinitionsFile =
        serde_json::from_slice(&bytes).map_err(|source| ParseError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    file.resources.into_iter().map(to_definition).collect()
}

fn to_definition(entry: ResourceEntry) -> Result<Definition, ParseError> {
    let mut definition = Definition::new(ResourceId::new(entry.ty, entry.name));
    for (property, value) in entry.inputs {
        definition = definition.input(property, parse_input(&value)?);
    }
    if let Some(parent) = entry.parent {
        definition = definition.parent(parent);
    }
    for dependency in entry.depends_on {
        definition = definition.depends_on(dependency);
    }
    Ok(definition)
}

fn parse_input(value: &Value) -> Result<Input, ParseError> {
    if let Value::Object(map) = value {
        if map.len() == 1 {
            if let Some(Value::String(reference)) = map.get("$ref") {
                return Ok(Input::output(parse_reference(reference)?));
            }
            if let Some(inner) = map.get("$secret") {
                return Ok(Input::secret(inner.clone()));
            }
            if let Some(Value::Array(parts)) = map.get("$concat") {
                return Ok(Input::output(parse_concat(parts)?));
            }
        }
    }
    Ok(Input::literal(value.clone()))
}

fn parse_reference(reference: &str) -> Result<Output, ParseError> {
    let invalid = || ParseError::Reference {
        reference: reference.to_string(),
    };
    let (id, property) = reference.rsplit_once('.').ok_or_else(invalid)?;
    let id: ResourceId = id.parse().map_err(|_| invalid())?;
    Ok(Output::property(id, property))
}

fn parse_concat(parts: &[Value]) -> Result<Output, ParseError> {
    let mut sources = Vec::with_capacity(parts.len());
    for part in parts {
        let source = match parse_input(part)? {
            Input::Value {
                value,
                secret: false,
            } => Output::literal(value),
            Input::Value {
                value,
                secret: true,
            } => Output::secret(value),
            Input::Output(output) => output,
        };
        sources.push(source);
    }
    Ok(Output::combine(sources).map(|value| join_parts(&value)))
}

fn join_parts(value: &Value) -> Value {
    let Some(parts) = value.as_array() else {
        return value.clone();
    };
    let joined: String = parts
        .iter()
        .map(|part| match part {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect();
    Value::String(joined)
}
