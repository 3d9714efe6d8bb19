//! Minimal `OpenAPI` 3.x document model
//!
//! Deserializes just the parts of an API document the bridge needs: operation
//! metadata for index building, parameters and request-body schemas for the
//! request synthesizer, and the `x-nl-bridge` host extension carrying the
//! per-API plugin data. Schemas stay as raw [`serde_json::Value`]s; the
//! [`RefResolver`] walks `#/components/...` references on demand.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

/// Operation extension listing natural-language input examples
pub const EXT_INPUT_EXAMPLES: &str = "x-nl-input-examples";
/// Document extension carrying host-assigned identity and plugin data
pub const EXT_BRIDGE: &str = "x-nl-bridge";

/// A parsed API document
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    /// Path template -> path item
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
    /// Reusable components
    #[serde(default)]
    pub components: Components,
    /// Host extension: `{"id", "listenPath", "pluginConfig"}`
    #[serde(rename = "x-nl-bridge")]
    pub bridge: Option<BridgeExtension>,
}

/// The `x-nl-bridge` document extension
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeExtension {
    /// Host-assigned API identifier
    pub id: String,
    /// Gateway-visible path prefix
    #[serde(rename = "listenPath", default)]
    pub listen_path: String,
    /// Opaque plugin configuration block
    #[serde(rename = "pluginConfig", default)]
    pub plugin_config: Value,
}

/// One path item; only the HTTP methods are modeled
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathItem {
    #[serde(default)]
    get: Option<Operation>,
    #[serde(default)]
    put: Option<Operation>,
    #[serde(default)]
    post: Option<Operation>,
    #[serde(default)]
    delete: Option<Operation>,
    #[serde(default)]
    patch: Option<Operation>,
    #[serde(default)]
    head: Option<Operation>,
    #[serde(default)]
    options: Option<Operation>,
    #[serde(default)]
    trace: Option<Operation>,
}

impl PathItem {
    /// Iterate the operations defined on this path item as `(METHOD, op)`
    pub fn operations(&self) -> impl Iterator<Item = (&'static str, &Operation)> {
        [
            ("GET", &self.get),
            ("PUT", &self.put),
            ("POST", &self.post),
            ("DELETE", &self.delete),
            ("PATCH", &self.patch),
            ("HEAD", &self.head),
            ("OPTIONS", &self.options),
            ("TRACE", &self.trace),
        ]
        .into_iter()
        .filter_map(|(m, op)| op.as_ref().map(|op| (m, op)))
    }
}

/// One API operation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    /// Operation identifier
    #[serde(rename = "operationId", default)]
    pub operation_id: Option<String>,
    /// Short summary
    #[serde(default)]
    pub summary: Option<String>,
    /// Long description
    #[serde(default)]
    pub description: Option<String>,
    /// Parameters, possibly `$ref`s into the components table
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Request body
    #[serde(rename = "requestBody", default)]
    pub request_body: Option<RequestBody>,
    /// Natural-language input examples
    #[serde(rename = "x-nl-input-examples", default)]
    pub input_examples: Vec<String>,
}

/// Request body with its media types
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestBody {
    /// Media type -> schema holder
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

/// One media type entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaType {
    /// Raw schema (may contain `$ref`s)
    #[serde(default)]
    pub schema: Option<Value>,
}

impl RequestBody {
    /// Select the media type the synthesizer targets: the only one when
    /// there is exactly one, otherwise `application/json` when present.
    #[must_use]
    pub fn select_media_type(&self) -> Option<(&str, &MediaType)> {
        if self.content.is_empty() {
            return None;
        }
        if self.content.len() == 1 {
            return self.content.iter().next().map(|(k, v)| (k.as_str(), v));
        }
        self.content
            .get_key_value("application/json")
            .map(|(k, v)| (k.as_str(), v))
    }
}

/// Reusable components
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Components {
    /// Named schemas
    #[serde(default)]
    pub schemas: BTreeMap<String, Value>,
    /// Named parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// A concrete `(path, method, operation)` selected for a request
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Path template, e.g. `/repos/{owner}/{repo}/issues`
    pub path: &'a str,
    /// Upper-case HTTP method
    pub method: &'a str,
    /// The operation definition
    pub operation: &'a Operation,
}

impl Document {
    /// Parse a document from JSON text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }

    /// Load a document from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Iterate all operations as routes
    pub fn routes(&self) -> impl Iterator<Item = Route<'_>> {
        self.paths.iter().flat_map(|(path, item)| {
            item.operations().map(move |(method, operation)| Route {
                path,
                method,
                operation,
            })
        })
    }

    /// Find the route carrying the given operation id
    #[must_use]
    pub fn find_by_operation_id(&self, operation_id: &str) -> Option<Route<'_>> {
        self.routes()
            .find(|r| r.operation.operation_id.as_deref() == Some(operation_id))
    }

    /// Match a concrete request path against the path templates, extracting
    /// `{name}` placeholders. The first matching template wins; templates
    /// are tried in lexicographic order so matching is deterministic.
    #[must_use]
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Route<'_>, HashMap<String, String>)> {
        let method = method.to_ascii_uppercase();
        for (template, item) in &self.paths {
            if let Some(params) = match_template(template, path) {
                for (m, operation) in item.operations() {
                    if m == method {
                        return Some((
                            Route {
                                path: template,
                                method: m,
                                operation,
                            },
                            params,
                        ));
                    }
                }
            }
        }
        None
    }

    /// Resolver over this document's components
    #[must_use]
    pub fn resolver(&self) -> RefResolver<'_> {
        RefResolver { document: self }
    }
}

/// Match a single path against a template, returning extracted parameters
fn match_template(template: &str, path: &str) -> Option<HashMap<String, String>> {
    let template_segments: Vec<&str> = template.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    if template_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (ts, ps) in template_segments.iter().zip(&path_segments) {
        if let Some(name) = ts.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            params.insert(name.to_string(), (*ps).to_string());
        } else if ts != ps {
            return None;
        }
    }
    Some(params)
}

/// Walks `#/components/...` references of a [`Document`]
pub struct RefResolver<'a> {
    document: &'a Document,
}

impl<'a> RefResolver<'a> {
    /// Dereference a parameter to first level: a `$ref` into
    /// `#/components/parameters/` is replaced by its target, anything else
    /// is returned as-is.
    #[must_use]
    pub fn resolve_parameter(&self, parameter: &'a Value) -> Option<&'a Value> {
        match ref_target(parameter) {
            Some(name) => {
                let short = name.strip_prefix("#/components/parameters/")?;
                self.document.components.parameters.get(short)
            }
            None => Some(parameter),
        }
    }

    /// Follow a schema `$ref` chain to its effective (non-reference) schema
    #[must_use]
    pub fn effective_schema(&self, schema: &'a Value) -> Option<&'a Value> {
        let mut current = schema;
        // Bounded walk so a reference cycle cannot spin forever
        for _ in 0..32 {
            match ref_target(current) {
                Some(name) => {
                    let short = name.strip_prefix("#/components/schemas/")?;
                    current = self.document.components.schemas.get(short)?;
                }
                None => return Some(current),
            }
        }
        None
    }

    /// Collect the transitive `$ref` closure reachable from a schema into
    /// `refs`, keyed by reference name with the effective schema as value.
    /// Each reference is recorded exactly once.
    pub fn collect_schema_refs(&self, schema: &'a Value, refs: &mut BTreeMap<String, Value>) {
        if let Some(name) = ref_target(schema) {
            if refs.contains_key(name) {
                return;
            }
            let Some(effective) = self.effective_schema(schema) else {
                return;
            };
            refs.insert(name.to_string(), effective.clone());
            self.collect_subschema_refs(effective, refs);
        } else {
            self.collect_subschema_refs(schema, refs);
        }
    }

    /// Recurse into the first present combinator of an effective schema
    fn collect_subschema_refs(&self, schema: &'a Value, refs: &mut BTreeMap<String, Value>) {
        if let Some(list) = schema.get("anyOf").and_then(Value::as_array) {
            for sub in list {
                self.collect_schema_refs(sub, refs);
            }
        } else if let Some(list) = schema.get("oneOf").and_then(Value::as_array) {
            for sub in list {
                self.collect_schema_refs(sub, refs);
            }
        } else if let Some(list) = schema.get("allOf").and_then(Value::as_array) {
            for sub in list {
                self.collect_schema_refs(sub, refs);
            }
        } else if let Some(sub) = schema.get("not") {
            self.collect_schema_refs(sub, refs);
        } else if let Some(sub) = schema.get("items") {
            self.collect_schema_refs(sub, refs);
        } else if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for sub in props.values() {
                self.collect_schema_refs(sub, refs);
            }
        }
    }
}

/// The `$ref` target of a JSON node, if it is a reference
fn ref_target(node: &Value) -> Option<&str> {
    node.get("$ref").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        Document::from_json(
            &json!({
                "openapi": "3.0.0",
                "info": {"title": "t", "version": "1"},
                "paths": {
                    "/repos/{owner}/{repo}/issues": {
                        "get": {
                            "operationId": "issues/list",
                            "summary": "List issues",
                            "x-nl-input-examples": ["give me the issues"]
                        },
                        "post": {"operationId": "issues/create"}
                    },
                    "/user": {"get": {"operationId": "user/get"}}
                },
                "x-nl-bridge": {"id": "tyk-github-id", "listenPath": "/github/"}
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn finds_route_by_operation_id() {
        let doc = sample();
        let route = doc.find_by_operation_id("issues/create").unwrap();
        assert_eq!(route.method, "POST");
        assert_eq!(route.path, "/repos/{owner}/{repo}/issues");
    }

    #[test]
    fn matches_templated_path() {
        let doc = sample();
        let (route, params) = doc
            .match_route("get", "/repos/TykTechnologies/tyk/issues")
            .unwrap();
        assert_eq!(route.operation.operation_id.as_deref(), Some("issues/list"));
        assert_eq!(params.get("owner").unwrap(), "TykTechnologies");
        assert_eq!(params.get("repo").unwrap(), "tyk");
    }

    #[test]
    fn no_match_on_wrong_segment_count() {
        let doc = sample();
        assert!(doc.match_route("GET", "/repos/just-owner/issues").is_none());
    }

    #[test]
    fn input_examples_deserialized() {
        let doc = sample();
        let route = doc.find_by_operation_id("issues/list").unwrap();
        assert_eq!(route.operation.input_examples, vec!["give me the issues"]);
    }

    #[test]
    fn bridge_extension_carries_identity() {
        let doc = sample();
        let ext = doc.bridge.unwrap();
        assert_eq!(ext.id, "tyk-github-id");
        assert_eq!(ext.listen_path, "/github/");
    }

    #[test]
    fn media_type_selection_prefers_json() {
        let body: RequestBody = serde_json::from_value(json!({
            "content": {
                "application/xml": {"schema": {"type": "object"}},
                "application/json": {"schema": {"type": "object"}}
            }
        }))
        .unwrap();
        assert_eq!(body.select_media_type().unwrap().0, "application/json");
    }

    #[test]
    fn media_type_selection_single_entry_wins() {
        let body: RequestBody = serde_json::from_value(json!({
            "content": {"text/csv": {"schema": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(body.select_media_type().unwrap().0, "text/csv");
    }

    #[test]
    fn media_type_selection_none_without_json() {
        let body: RequestBody = serde_json::from_value(json!({
            "content": {
                "application/xml": {},
                "text/plain": {}
            }
        }))
        .unwrap();
        assert!(body.select_media_type().is_none());
    }

    #[test]
    fn ref_chain_collapses_to_effective_schema() {
        let doc = Document::from_json(
            &json!({
                "paths": {},
                "components": {"schemas": {
                    "a": {"$ref": "#/components/schemas/b"},
                    "b": {"$ref": "#/components/schemas/c"},
                    "c": {"type": "integer"}
                }}
            })
            .to_string(),
        )
        .unwrap();
        let resolver = doc.resolver();
        let node = json!({"$ref": "#/components/schemas/a"});
        let effective = resolver.effective_schema(&node).unwrap();
        assert_eq!(effective, &json!({"type": "integer"}));
    }

    #[test]
    fn ref_closure_records_each_ref_once() {
        let doc = Document::from_json(
            &json!({
                "paths": {},
                "components": {"schemas": {
                    "outer": {
                        "type": "object",
                        "properties": {
                            "left": {"$ref": "#/components/schemas/leaf"},
                            "right": {"$ref": "#/components/schemas/leaf"}
                        }
                    },
                    "leaf": {"type": "string"}
                }}
            })
            .to_string(),
        )
        .unwrap();
        let resolver = doc.resolver();
        let node = json!({"$ref": "#/components/schemas/outer"});
        let mut refs = BTreeMap::new();
        resolver.collect_schema_refs(&node, &mut refs);
        assert_eq!(
            refs.keys().collect::<Vec<_>>(),
            vec!["#/components/schemas/leaf", "#/components/schemas/outer"]
        );
    }
}
