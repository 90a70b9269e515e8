//! Document Metadata Inference
//!
//! Pulls the endpoint name, path and method out of an exported OpenAPI
//! document when the caller did not supply them. Documents are trees, so
//! the walk is plain recursion over `serde_json::Value` variants.

use serde_json::{Map, Value};

/// HTTP methods in the order operations are considered
const METHODS: [&str; 8] = [
    "get", "post", "put", "patch", "delete", "head", "options", "trace",
];

/// How deep to look for a `paths` object inside an export envelope
const MAX_ENVELOPE_DEPTH: usize = 4;

/// Metadata found in a document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferredMetadata {
    pub name: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
}

/// Infer endpoint metadata from an exported document
pub fn infer(document: &Value) -> InferredMetadata {
    let mut inferred = InferredMetadata::default();

    let Some(root) = find_spec_root(document, 0) else {
        return inferred;
    };

    if let Some(paths) = root.get("paths").and_then(Value::as_object) {
        if let Some((path, method, operation)) = first_operation(paths) {
            inferred.path = Some(path.to_string());
            inferred.method = Some(method.to_uppercase());
            inferred.name = operation_name(operation);
        }
    }

    if inferred.name.is_none() {
        inferred.name = root
            .get("info")
            .and_then(|info| info.get("title"))
            .and_then(non_empty_str);
    }

    inferred
}

/// The object that carries `paths`, searching nested envelopes
fn find_spec_root(value: &Value, depth: usize) -> Option<&Map<String, Value>> {
    let object = value.as_object()?;
    if object.get("paths").is_some_and(Value::is_object) {
        return Some(object);
    }
    if depth >= MAX_ENVELOPE_DEPTH {
        return None;
    }
    object
        .values()
        .filter(|child| child.is_object())
        .find_map(|child| find_spec_root(child, depth + 1))
}

fn first_operation(paths: &Map<String, Value>) -> Option<(&str, &'static str, &Map<String, Value>)> {
    paths.iter().find_map(|(path, item)| {
        let item = item.as_object()?;
        METHODS.iter().find_map(|&method| {
            item.get(method)
                .and_then(Value::as_object)
                .map(|operation| (path.as_str(), method, operation))
        })
    })
}

fn operation_name(operation: &Map<String, Value>) -> Option<String> {
    ["summary", "operationId"]
        .iter()
        .find_map(|field| operation.get(*field).and_then(non_empty_str))
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
