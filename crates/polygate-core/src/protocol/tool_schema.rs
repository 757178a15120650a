//! `clean_json_schema`: normalizes tool-parameter JSON Schemas received from
//! any of the three dialects so every nested object carries an explicit
//! `type: "object"` and a `properties` map, which some backends require and
//! some IDEs omit.

use serde_json::{json, Map, Value};

/// Recursively walks a JSON Schema value and:
/// - ensures every object-shaped schema node declares `"type": "object"`
/// - ensures every object node has a `properties` map (defaulting to `{}`)
/// - recurses into `properties`, array `items`, and `$defs`/`definitions`
pub fn clean_json_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => clean_object(map),
        other => other.clone(),
    }
}

fn clean_object(map: &Map<String, Value>) -> Value {
    let mut out = map.clone();

    let looks_like_object = matches!(out.get("type"), Some(Value::String(t)) if t == "object")
        || out.contains_key("properties")
        || (!out.contains_key("type") && !out.contains_key("enum") && !out.contains_key("anyOf") && !out.contains_key("oneOf"));

    if looks_like_object && !out.contains_key("enum") {
        out.insert("type".to_string(), json!("object"));
        let properties = out
            .entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(props) = properties {
            let cleaned: Map<String, Value> = props
                .iter()
                .map(|(k, v)| (k.clone(), clean_json_schema(v)))
                .collect();
            *props = cleaned;
        }
    }

    if let Some(Value::Object(items)) = out.get("items") {
        out.insert("items".to_string(), clean_object(items));
    }

    for key in ["$defs", "definitions"] {
        if let Some(Value::Object(defs)) = out.get(key) {
            let cleaned: Map<String, Value> = defs
                .iter()
                .map(|(k, v)| (k.clone(), clean_json_schema(v)))
                .collect();
            out.insert(key.to_string(), Value::Object(cleaned));
        }
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_missing_object_type_and_properties() {
        let schema = json!({
            "properties": {
                "path": {"type": "string"}
            }
        });
        let cleaned = clean_json_schema(&schema);
        assert_eq!(cleaned["type"], json!("object"));
        assert_eq!(cleaned["properties"]["path"]["type"], json!("string"));
    }

    #[test]
    fn recurses_into_nested_object_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "nested": {
                    "properties": {
                        "x": {"type": "number"}
                    }
                }
            }
        });
        let cleaned = clean_json_schema(&schema);
        assert_eq!(cleaned["properties"]["nested"]["type"], json!("object"));
    }

    #[test]
    fn leaves_enum_schemas_alone() {
        let schema = json!({"enum": ["a", "b"]});
        let cleaned = clean_json_schema(&schema);
        assert!(cleaned.get("type").is_none());
    }
}
