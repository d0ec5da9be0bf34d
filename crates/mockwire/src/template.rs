//! JSON response templating.
//!
//! A string leaf that is exactly `{{dotted.path}}` is replaced by the value
//! found at that path in the backing object. The backing object exposes the
//! intercepted request:
//!
//! - `{{requestBody.<path>}}` - decoded JSON request body
//! - `{{requestQuery.<name>}}` - query parameter
//! - `{{requestParams.<name>}}` - path parameter from the handler URL pattern
//!
//! # Example
//!
//! ```json
//! { "id": "{{requestParams.id}}", "echo": "{{requestBody.user.name}}" }
//! ```
//!
//! Missing and falsy values (`false`, `0`, `""`, `null`) render as `null`.
//! Strings with surrounding text are left untouched.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Regex for a whole-string template placeholder: {{requestBody.user.id}}
static TEMPLATE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_template_regex() -> &'static Regex {
    TEMPLATE_REGEX.get_or_init(|| Regex::new(r"^\{\{(.+)\}\}$").unwrap())
}

/// Request data a response template can reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonBacking {
    pub request_body: Value,
    pub request_query: Value,
    pub request_params: Value,
}

impl JsonBacking {
    /// Merge request data over optional defaults.
    ///
    /// Object values are merged key by key. A missing (`null`) request value
    /// falls back to the defaults; arrays are used as-is; any other scalar
    /// yields an empty object.
    pub fn with_defaults(self, defaults: &JsonBacking) -> Self {
        Self {
            request_body: merge_backing(self.request_body, &defaults.request_body),
            request_query: merge_backing(self.request_query, &defaults.request_query),
            request_params: merge_backing(self.request_params, &defaults.request_params),
        }
    }

    fn into_payload(self) -> Value {
        let mut payload = Map::new();
        payload.insert("requestBody".to_string(), self.request_body);
        payload.insert("requestQuery".to_string(), self.request_query);
        payload.insert("requestParams".to_string(), self.request_params);
        Value::Object(payload)
    }
}

fn merge_backing(data: Value, defaults: &Value) -> Value {
    let mut merged = match defaults {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    match data {
        Value::Object(map) => {
            merged.extend(map);
            Value::Object(merged)
        }
        Value::Null => Value::Object(merged),
        Value::Array(items) => Value::Array(items),
        _ => Value::Object(Map::new()),
    }
}

/// Render `body` against the request backing.
pub fn apply_json_backing(body: &Value, backing: JsonBacking, defaults: &JsonBacking) -> Value {
    let payload = backing.with_defaults(defaults).into_payload();
    let mut rendered = body.clone();
    apply_template(&mut rendered, &payload);
    rendered
}

/// Replace placeholder leaves of `template` in place. The root value itself
/// is never replaced, only its members.
pub fn apply_template(template: &mut Value, payload: &Value) {
    match template {
        Value::Object(map) => {
            for entry in map.values_mut() {
                apply_entry(entry, payload);
            }
        }
        Value::Array(items) => {
            for entry in items.iter_mut() {
                apply_entry(entry, payload);
            }
        }
        _ => {}
    }
}

fn apply_entry(entry: &mut Value, payload: &Value) {
    let path = match entry {
        Value::String(s) => get_template_regex()
            .captures(s)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()),
        _ => None,
    };

    match path {
        Some(path) => {
            *entry = lookup(payload, &path)
                .filter(|v| is_truthy(v))
                .cloned()
                .unwrap_or(Value::Null);
        }
        None => apply_template(entry, payload),
    }
}

/// Walk a dotted path through objects and arrays.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn backing() -> Value {
        json!({
            "backingObj": {"s": "test-name", "b": true, "n": 123, "zero": 0, "list": ["x", "y"]}
        })
    }

    #[test]
    fn test_plain_values_untouched() {
        let mut template = json!({"nameStr": "test-name", "boolValue": true, "count": 123});
        let expected = template.clone();
        apply_template(&mut template, &json!({}));
        assert_eq!(template, expected);
    }

    #[test]
    fn test_placeholders_replaced() {
        let mut template = json!({
            "count": "{{backingObj.n}}",
            "nameStr": "{{backingObj.s}}",
            "boolValue": "{{backingObj.b}}",
            "unknownVar": "{{backingObj.unknownVar}}",
            "message": "Some message text"
        });
        apply_template(&mut template, &backing());

        assert_json_eq!(
            template,
            json!({
                "count": 123,
                "nameStr": "test-name",
                "boolValue": true,
                "unknownVar": null,
                "message": "Some message text"
            })
        );
    }

    #[test]
    fn test_falsy_values_render_null() {
        let mut template = json!({"z": "{{backingObj.zero}}"});
        apply_template(&mut template, &backing());
        assert_eq!(template, json!({"z": null}));
    }

    #[test]
    fn test_nested_arrays_and_objects() {
        let mut template = json!([
            {"inner": {"v": "{{backingObj.list.1}}"}},
            ["{{backingObj.s}}", "literal {{backingObj.s}}"]
        ]);
        apply_template(&mut template, &backing());
        assert_eq!(
            template,
            json!([
                {"inner": {"v": "y"}},
                ["test-name", "literal {{backingObj.s}}"]
            ])
        );
    }

    #[test]
    fn test_root_string_is_not_replaced() {
        let mut template = json!("{{backingObj.s}}");
        apply_template(&mut template, &backing());
        assert_eq!(template, json!("{{backingObj.s}}"));
    }

    #[test]
    fn test_apply_json_backing_merges_defaults() {
        let body = json!({
            "id": "{{requestParams.id}}",
            "name": "{{requestBody.name}}",
            "page": "{{requestQuery.page}}"
        });
        let request = JsonBacking {
            request_body: json!({"name": "Ada"}),
            request_query: Value::Null,
            request_params: json!({"id": "42"}),
        };
        let defaults = JsonBacking {
            request_body: json!({"name": "default"}),
            request_query: json!({"page": "1"}),
            request_params: Value::Null,
        };

        let rendered = apply_json_backing(&body, request, &defaults);
        assert_json_eq!(rendered, json!({"id": "42", "name": "Ada", "page": "1"}));
        // The stored template is left intact
        assert_eq!(body["id"], json!("{{requestParams.id}}"));
    }

    #[test]
    fn test_scalar_request_body_backs_nothing() {
        let body = json!({"name": "{{requestBody.name}}"});
        let request = JsonBacking {
            request_body: json!("raw text"),
            ..Default::default()
        };
        let defaults = JsonBacking {
            request_body: json!({"name": "default"}),
            ..Default::default()
        };
        let rendered = apply_json_backing(&body, request, &defaults);
        assert_eq!(rendered, json!({"name": null}));
    }
}
