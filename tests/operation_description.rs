//! Operation description construction tests
//!
//! The description string fed to the synthesis prompt must be a pure
//! function of the operation, with references rendered in lexicographic
//! order; the cases below pin the exact rendering.

use nl_bridge::openapi::Document;
use nl_bridge::synth::build_operation_description;
use pretty_assertions::assert_eq;

fn describe(spec: &str) -> String {
    let doc = Document::from_json(spec).expect("invalid spec, the test is broken");
    let (route, _) = doc.match_route("GET", "/test").expect("no /test route");
    let media_type = route
        .operation
        .request_body
        .as_ref()
        .and_then(|b| b.select_media_type())
        .map(|(_, mt)| mt);
    build_operation_description(&route, media_type, &doc.resolver()).unwrap()
}

#[test]
fn empty_operation_renders_nothing() {
    let spec = r#"{
        "openapi": "3.0.0",
        "info": {"title": "Minimal API", "version": "1.0.0"},
        "paths": {"/test": {"get": {}}}
    }"#;
    assert_eq!(describe(spec), "");
}

#[test]
fn summary_only() {
    let spec = r#"{
        "openapi": "3.0.0",
        "info": {"title": "Minimal API", "version": "1.0.0"},
        "paths": {"/test": {"get": {"summary": "The request's query parameters."}}}
    }"#;
    assert_eq!(
        describe(spec),
        "Operation summary: The request's query parameters.\n"
    );
}

#[test]
fn description_only() {
    let spec = r#"{
        "openapi": "3.0.0",
        "info": {"title": "Minimal API", "version": "1.0.0"},
        "paths": {"/test": {"get": {"description": "The request's query parameters, with a description."}}}
    }"#;
    assert_eq!(
        describe(spec),
        "Operation description: The request's query parameters, with a description.\n"
    );
}

#[test]
fn description_preferred_over_summary() {
    let spec = r#"{
        "openapi": "3.0.0",
        "info": {"title": "Minimal API", "version": "1.0.0"},
        "paths": {"/test": {"get": {
            "description": "The request's query parameters, with a description.",
            "summary": "The request's query parameters summary."
        }}}
    }"#;
    assert_eq!(
        describe(spec),
        "Operation description: The request's query parameters, with a description.\n"
    );
}

const SPEC_WITH_REF_PARAMETERS: &str = r##"{
    "openapi": "3.0.0",
    "info": {"title": "Minimal API", "version": "1.0.0"},
    "paths": {
        "/test": {
            "get": {
                "summary": "The request's query parameters.",
                "parameters": [
                    {"name": "genre", "in": "query"},
                    {"$ref": "#/components/parameters/age"},
                    {"$ref": "#/components/parameters/name"}
                ]
            }
        }
    },
    "components": {
        "schemas": {
            "age0": {"$ref": "#/components/schemas/age1"},
            "age1": {"$ref": "#/components/schemas/age2"},
            "age2": {"$ref": "#/components/schemas/age3"},
            "age3": {"$ref": "#/components/schemas/age4"},
            "age4": {
                "type": "object",
                "properties": {
                    "romanage": {"type": "string"},
                    "age": {"$ref": "#/components/schemas/age"}
                }
            },
            "age": {"type": "integer", "format": "int32"}
        },
        "parameters": {
            "age": {
                "name": "age",
                "in": "header",
                "description": "The age of the person",
                "schema": {"$ref": "#/components/schemas/age0"}
            },
            "name": {
                "name": "name",
                "in": "header",
                "description": "The age of the person",
                "schema": {"type": "integer"}
            }
        }
    }
}"##;

#[test]
fn parameters_dereferenced_and_ref_chain_collapsed() {
    let expected = "Operation summary: The request's query parameters.\n\
The list of Parameters:\n\
- {\"in\":\"query\",\"name\":\"genre\"}\n\
- {\"description\":\"The age of the person\",\"in\":\"header\",\"name\":\"age\",\"schema\":{\"$ref\":\"#/components/schemas/age0\"}}\n\
- {\"description\":\"The age of the person\",\"in\":\"header\",\"name\":\"name\",\"schema\":{\"type\":\"integer\"}}\n\
The list of References:\n\
- #/components/schemas/age: {\"format\":\"int32\",\"type\":\"integer\"}\n\
- #/components/schemas/age0: {\"properties\":{\"age\":{\"$ref\":\"#/components/schemas/age\"},\"romanage\":{\"type\":\"string\"}},\"type\":\"object\"}\n";
    assert_eq!(describe(SPEC_WITH_REF_PARAMETERS), expected);
}

#[test]
fn request_body_schema_rendered() {
    let spec = r#"{
        "openapi": "3.0.0",
        "info": {"title": "Minimal API", "version": "1.0.0"},
        "paths": {
            "/test": {
                "get": {
                    "summary": "The request's query parameters.",
                    "requestBody": {
                        "content": {
                            "application/json": {
                                "schema": {
                                    "required": ["url"],
                                    "type": "object",
                                    "properties": {"url": {"type": "string"}}
                                }
                            }
                        },
                        "required": true
                    }
                }
            }
        }
    }"#;
    let expected = "Operation summary: The request's query parameters.\n\
The request body:\n\
{\"properties\":{\"url\":{\"type\":\"string\"}},\"required\":[\"url\"],\"type\":\"object\"}\n";
    assert_eq!(describe(spec), expected);
}

const SPEC_WITH_PARAMS_AND_BODY: &str = r##"{
    "openapi": "3.0.0",
    "info": {"title": "Minimal API", "version": "1.0.0"},
    "paths": {
        "/test": {
            "get": {
                "summary": "The request's query parameters.",
                "parameters": [
                    {"name": "genre", "in": "query"},
                    {"$ref": "#/components/parameters/age"},
                    {"$ref": "#/components/parameters/name"}
                ],
                "requestBody": {
                    "content": {
                        "application/json": {
                            "schema": {
                                "required": ["url"],
                                "type": "object",
                                "properties": {
                                    "url": {"type": "string"},
                                    "age": {"$ref": "#/components/schemas/age"},
                                    "city": {"$ref": "#/components/schemas/city"}
                                }
                            }
                        }
                    },
                    "required": true
                }
            }
        }
    },
    "components": {
        "schemas": {
            "age0": {"$ref": "#/components/schemas/age1"},
            "age1": {"$ref": "#/components/schemas/age2"},
            "age2": {"$ref": "#/components/schemas/age3"},
            "age3": {"$ref": "#/components/schemas/age4"},
            "age4": {
                "type": "object",
                "properties": {
                    "romanage": {"type": "string"},
                    "age": {"$ref": "#/components/schemas/age"}
                }
            },
            "age": {"type": "integer", "format": "int32"},
            "city": {"type": "string"}
        },
        "parameters": {
            "age": {
                "name": "age",
                "in": "header",
                "description": "The age of the person",
                "schema": {"$ref": "#/components/schemas/age0"}
            },
            "name": {
                "name": "name",
                "in": "header",
                "description": "The age of the person",
                "schema": {"type": "integer"}
            }
        }
    }
}"##;

#[test]
fn parameters_body_and_sorted_reference_closure() {
    let expected = "Operation summary: The request's query parameters.\n\
The list of Parameters:\n\
- {\"in\":\"query\",\"name\":\"genre\"}\n\
- {\"description\":\"The age of the person\",\"in\":\"header\",\"name\":\"age\",\"schema\":{\"$ref\":\"#/components/schemas/age0\"}}\n\
- {\"description\":\"The age of the person\",\"in\":\"header\",\"name\":\"name\",\"schema\":{\"type\":\"integer\"}}\n\
The request body:\n\
{\"properties\":{\"age\":{\"$ref\":\"#/components/schemas/age\"},\"city\":{\"$ref\":\"#/components/schemas/city\"},\"url\":{\"type\":\"string\"}},\"required\":[\"url\"],\"type\":\"object\"}\n\
The list of References:\n\
- #/components/schemas/age: {\"format\":\"int32\",\"type\":\"integer\"}\n\
- #/components/schemas/age0: {\"properties\":{\"age\":{\"$ref\":\"#/components/schemas/age\"},\"romanage\":{\"type\":\"string\"}},\"type\":\"object\"}\n\
- #/components/schemas/city: {\"type\":\"string\"}\n";
    assert_eq!(describe(SPEC_WITH_PARAMS_AND_BODY), expected);
}

#[test]
fn description_is_deterministic_across_calls() {
    let first = describe(SPEC_WITH_PARAMS_AND_BODY);
    let second = describe(SPEC_WITH_PARAMS_AND_BODY);
    assert_eq!(first, second);
}
