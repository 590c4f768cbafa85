use serde_json::Value;

const STRIP_KEYS: &[&str] = &[
    "$schema",
    "additionalProperties",
    "format",
    "default",
    "uniqueItems",
];

/// Validation keywords the upstream rejects; their intent survives as a
/// suffix on the property description.
const CONSTRAINT_KEYS: &[&str] = &[
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minItems",
    "maxItems",
    "minProperties",
    "maxProperties",
];

/// Rewrites a client tool `input_schema` into the dialect the upstream
/// accepts: unsupported keywords are stripped, numeric constraints are
/// folded into the description, nullable unions collapse to their non-null
/// member, and every `type` is uppercased. Applying the cleaner twice is a
/// no-op.
pub fn clean_tool_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in STRIP_KEYS {
                map.remove(*key);
            }

            let mut constraints = Vec::new();
            for key in CONSTRAINT_KEYS {
                if let Some(constraint) = map.remove(*key) {
                    constraints.push(format!("{}: {}", key, constraint));
                }
            }
            if !constraints.is_empty() {
                let note = format!("({})", constraints.join(", "));
                let description = map
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let merged = if description.is_empty() {
                    note
                } else {
                    format!("{} {}", description, note)
                };
                map.insert("description".to_string(), Value::String(merged));
            }

            if let Some(type_value) = map.get_mut("type") {
                collapse_nullable_union(type_value);
                uppercase_type(type_value);
            }

            for (_, child) in map.iter_mut() {
                clean_tool_schema(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                clean_tool_schema(child);
            }
        }
        _ => {}
    }
}

fn collapse_nullable_union(type_value: &mut Value) {
    if let Value::Array(members) = type_value {
        let non_null: Vec<Value> = members
            .iter()
            .filter(|m| m.as_str().map(|s| !s.eq_ignore_ascii_case("null")).unwrap_or(true))
            .cloned()
            .collect();
        *type_value = match non_null.len() {
            0 => Value::String("STRING".to_string()),
            1 => non_null.into_iter().next().expect("single member"),
            _ => Value::Array(non_null),
        };
    }
}

fn uppercase_type(type_value: &mut Value) {
    match type_value {
        Value::String(s) => *s = s.to_ascii_uppercase(),
        Value::Array(members) => {
            for member in members.iter_mut() {
                if let Value::String(s) = member {
                    *s = s.to_ascii_uppercase();
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_unsupported_keywords() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "name": { "type": "string", "format": "uri", "default": "x" },
                "tags": { "type": "array", "uniqueItems": true, "items": { "type": "string" } }
            }
        });
        clean_tool_schema(&mut schema);

        assert!(schema.get("$schema").is_none());
        assert!(schema.get("additionalProperties").is_none());
        assert!(schema["properties"]["name"].get("format").is_none());
        assert!(schema["properties"]["name"].get("default").is_none());
        assert!(schema["properties"]["tags"].get("uniqueItems").is_none());
    }

    #[test]
    fn flattens_constraints_into_description() {
        let mut schema = json!({
            "type": "string",
            "description": "A short name",
            "minLength": 1,
            "maxLength": 64
        });
        clean_tool_schema(&mut schema);

        let description = schema["description"].as_str().unwrap();
        assert!(description.starts_with("A short name"));
        assert!(description.contains("minLength: 1"));
        assert!(description.contains("maxLength: 64"));
        assert!(schema.get("minLength").is_none());
    }

    #[test]
    fn collapses_nullable_type_unions() {
        let mut schema = json!({ "type": ["string", "null"] });
        clean_tool_schema(&mut schema);
        assert_eq!(schema["type"], "STRING");
    }

    #[test]
    fn uppercases_types_recursively() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer" },
                "nested": {
                    "type": "array",
                    "items": { "type": "boolean" }
                }
            }
        });
        clean_tool_schema(&mut schema);
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["count"]["type"], "INTEGER");
        assert_eq!(schema["properties"]["nested"]["items"]["type"], "BOOLEAN");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let mut schema = json!({
            "$schema": "x",
            "type": ["string", "null"],
            "description": "desc",
            "minLength": 2,
            "properties": {
                "a": { "type": "number", "maximum": 10 }
            }
        });
        clean_tool_schema(&mut schema);
        let once = schema.clone();
        clean_tool_schema(&mut schema);
        assert_eq!(schema, once);
    }
}
