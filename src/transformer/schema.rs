//! JSON Schema cleanup for Gemini function declarations.
//!
//! Gemini accepts an OpenAPI subset and rejects requests that carry
//! keywords outside it.

use serde_json::{Map, Value};

const UNSUPPORTED_KEYWORDS: [&str; 12] = [
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "additionalProperties",
    "strict",
    "patternProperties",
    "unevaluatedProperties",
    "examples",
    "default",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

/// Return a copy of `schema` that Gemini will accept.
pub fn clean_schema_for_gemini(schema: &Value) -> Value {
    let mut value = schema.clone();
    clean(&mut value);
    value
}

fn clean(value: &mut Value) {
    match value {
        Value::Object(map) => {
            clean_object(map);
            for child in map.values_mut() {
                clean(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clean),
        _ => {}
    }
}

fn clean_object(map: &mut Map<String, Value>) {
    if let Some(reference) = map.remove("$ref") {
        let name = reference
            .as_str()
            .and_then(|r| r.rsplit('/').next())
            .unwrap_or("object")
            .to_string();
        map.entry("type").or_insert_with(|| Value::from("object"));
        append_description(map, &format!("See: {}", name));
    }

    if let Some(constant) = map.remove("const") {
        map.entry("enum")
            .or_insert_with(|| Value::Array(vec![constant]));
    }

    if let Some(Value::Array(values)) = map.get_mut("enum") {
        for v in values.iter_mut() {
            if !v.is_string() {
                *v = Value::String(match &*v {
                    Value::Null => "null".to_string(),
                    other => other.to_string(),
                });
            }
        }
        map.insert("type".to_string(), Value::from("string"));
    }

    // ["string", "null"] -> "string"
    if let Some(Value::Array(types)) = map.get("type") {
        let first = types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("string")
            .to_string();
        map.insert("type".to_string(), Value::from(first));
    }

    // anyOf/oneOf with a single non-null branch collapses into it
    for key in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = map.get(key) {
            let non_null: Vec<&Value> = branches
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) != Some("null"))
                .collect();
            if non_null.len() == 1 {
                if let Value::Object(inner) = non_null[0].clone() {
                    map.remove(key);
                    for (k, v) in inner {
                        map.entry(k).or_insert(v);
                    }
                }
            }
        }
    }

    for key in UNSUPPORTED_KEYWORDS {
        map.remove(key);
    }

    if let (Some(Value::Array(required)), Some(Value::Object(properties))) =
        (map.get("required"), map.get("properties"))
    {
        let kept: Vec<Value> = required
            .iter()
            .filter(|r| r.as_str().is_some_and(|name| properties.contains_key(name)))
            .cloned()
            .collect();
        if kept.is_empty() {
            map.remove("required");
        } else {
            map.insert("required".to_string(), Value::Array(kept));
        }
    }
}

fn append_description(map: &mut Map<String, Value>, hint: &str) {
    let description = match map.get("description").and_then(Value::as_str) {
        Some(existing) if !existing.is_empty() => format!("{} ({})", existing, hint),
        _ => hint.to_string(),
    };
    map.insert("description".to_string(), Value::from(description));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_removes_unsupported_keywords() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "city": {"type": "string", "default": "Paris"}
            },
            "required": ["city", "country"]
        });
        assert_eq!(
            clean_schema_for_gemini(&schema),
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            })
        );
    }

    #[test]
    fn test_const_becomes_string_enum() {
        let cleaned = clean_schema_for_gemini(&json!({"const": 3}));
        assert_eq!(cleaned, json!({"enum": ["3"], "type": "string"}));
    }

    #[test]
    fn test_non_string_enum_values_stringified() {
        let cleaned = clean_schema_for_gemini(&json!({
            "type": "integer",
            "enum": [1, true, null, "x"]
        }));
        assert_eq!(
            cleaned,
            json!({"type": "string", "enum": ["1", "true", "null", "x"]})
        );
    }

    #[test]
    fn test_nullable_type_array_and_any_of_flattened() {
        let cleaned = clean_schema_for_gemini(&json!({
            "type": "object",
            "properties": {
                "limit": {"type": ["integer", "null"]},
                "tag": {"anyOf": [{"type": "string"}, {"type": "null"}]}
            }
        }));
        assert_eq!(cleaned["properties"]["limit"], json!({"type": "integer"}));
        assert_eq!(cleaned["properties"]["tag"], json!({"type": "string"}));
    }
}
