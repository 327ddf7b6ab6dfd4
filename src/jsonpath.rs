//! Restricted JSONPath for context mappings.
//!
//! Supports:
//! - `$.a.b.c` (dot notation, `$` prefix optional)
//! - `$.a[0].b` (array index)
//! - `$.a[*]` / `$.a.*` (wildcard, read-only)
//! - `$.a..name` (recursive descent, terminal field only, read-only)
//!
//! Does NOT support filters (`$[?(...)]`), slices (`[0:5]`), or unions.
//! Write paths are further restricted to field/index segments so every
//! write has exactly one destination.

use serde_json::Value;
use thiserror::Error;

/// A parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field access: `.field`
    Field(String),
    /// Array index access: `[0]`
    Index(usize),
    /// Wildcard over array elements or object members: `[*]` or `.*`
    Wildcard,
    /// Recursive descent to every `field` in the subtree: `..field`
    Descend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("unsupported JSONPath syntax: '{path}'")]
    Unsupported { path: String },

    #[error("path '{path}' is not writable: wildcard and descent have no single destination")]
    NotWritable { path: String },

    #[error("empty JSONPath")]
    Empty,
}

/// Parse a JSONPath string into segments.
///
/// `"$.state.items[0].name"` → `[Field(state), Field(items), Index(0), Field(name)]`
pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let original = path;
    if path == "$" {
        return Ok(vec![]);
    }
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    // Keep a leading '.' after '$' so `$..field` still reads as descent.
    let path = path.strip_prefix('$').unwrap_or(path);

    let mut segments = Vec::new();
    let bytes = path.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // `..name` is recursive descent and must be the final segment.
        if bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1] == b'.' {
            let name = &path[i + 2..];
            if name.is_empty() || !name.chars().all(is_ident_char) {
                return Err(PathError::Unsupported { path: original.to_string() });
            }
            segments.push(Segment::Descend(name.to_string()));
            return Ok(segments);
        }

        if bytes[i] == b'.' {
            i += 1;
            continue;
        }

        if bytes[i] == b'[' {
            let close = path[i..]
                .find(']')
                .map(|p| p + i)
                .ok_or_else(|| PathError::Unsupported { path: original.to_string() })?;
            let inner = &path[i + 1..close];
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                let index: usize = inner
                    .parse()
                    .map_err(|_| PathError::Unsupported { path: original.to_string() })?;
                segments.push(Segment::Index(index));
            }
            i = close + 1;
            continue;
        }

        // Bare part up to the next '.' or '['.
        let rest = &path[i..];
        let end = rest
            .find(|c| c == '.' || c == '[')
            .unwrap_or(rest.len());
        let part = &rest[..end];
        if part == "*" {
            segments.push(Segment::Wildcard);
        } else if let Ok(index) = part.parse::<usize>() {
            // Numeric segment treated as array index ("items.0").
            segments.push(Segment::Index(index));
        } else if !part.is_empty() && part.chars().all(is_ident_char) {
            segments.push(Segment::Field(part.to_string()));
        } else {
            return Err(PathError::Unsupported { path: original.to_string() });
        }
        i += end;
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Parse a path and require that it is writable (field/index segments only).
pub fn parse_writable(path: &str) -> Result<Vec<Segment>, PathError> {
    let segments = parse(path)?;
    if segments
        .iter()
        .any(|s| matches!(s, Segment::Wildcard | Segment::Descend(_)))
    {
        return Err(PathError::NotWritable { path: path.to_string() });
    }
    Ok(segments)
}

/// Resolve segments against a value.
///
/// Missing intermediate keys yield `None`, never an error. A wildcard or
/// descent segment switches evaluation to collection mode: the result is an
/// array of every match (possibly empty) as long as the prefix resolved.
pub fn read(root: &Value, segments: &[Segment]) -> Option<Value> {
    read_inner(root, segments)
}

fn read_inner(current: &Value, segments: &[Segment]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(current.clone());
    };

    match head {
        Segment::Field(name) => read_inner(current.get(name)?, rest),
        Segment::Index(idx) => read_inner(current.get(*idx)?, rest),
        Segment::Wildcard => {
            let children: Vec<&Value> = match current {
                Value::Array(items) => items.iter().collect(),
                Value::Object(map) => map.values().collect(),
                _ => return None,
            };
            let mut matches = Vec::new();
            for child in children {
                if let Some(v) = read_inner(child, rest) {
                    matches.push(v);
                }
            }
            Some(Value::Array(matches))
        }
        Segment::Descend(name) => {
            // Terminal by construction (parser enforces it).
            debug_assert!(rest.is_empty());
            let mut matches = Vec::new();
            collect_descendants(current, name, &mut matches);
            Some(Value::Array(matches))
        }
    }
}

/// Preorder walk collecting every value held under `name`.
fn collect_descendants(value: &Value, name: &str, out: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == name {
                    out.push(child.clone());
                }
                collect_descendants(child, name, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descendants(child, name, out);
            }
        }
        _ => {}
    }
}

/// Parse and read in one step.
pub fn resolve(root: &Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    Ok(read(root, &segments))
}

/// Write `value` at `segments`, creating intermediate objects/arrays as
/// needed. Arrays are padded with `null` up to a written index.
pub fn write(root: &mut Value, segments: &[Segment], value: Value) -> Result<(), PathError> {
    let Some((head, rest)) = segments.split_first() else {
        *root = value;
        return Ok(());
    };

    match head {
        Segment::Field(name) => {
            if !root.is_object() {
                *root = Value::Object(serde_json::Map::new());
            }
            let map = root.as_object_mut().expect("object ensured above");
            let slot = map.entry(name.clone()).or_insert(Value::Null);
            write(slot, rest, value)
        }
        Segment::Index(idx) => {
            if !root.is_array() {
                *root = Value::Array(Vec::new());
            }
            let items = root.as_array_mut().expect("array ensured above");
            while items.len() <= *idx {
                items.push(Value::Null);
            }
            write(&mut items[*idx], rest, value)
        }
        Segment::Wildcard | Segment::Descend(_) => Err(PathError::NotWritable {
            path: display(segments),
        }),
    }
}

/// Render segments back into canonical dotted form (for error messages and
/// `context.field_set` event payloads).
pub fn display(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            Segment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
            Segment::Wildcard => {
                out.push_str("[*]");
            }
            Segment::Descend(name) => {
                out.push_str("..");
                out.push_str(name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_path() {
        let segments = parse("$.a.b.c").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("a".to_string()),
                Segment::Field("b".to_string()),
                Segment::Field("c".to_string()),
            ]
        );
    }

    #[test]
    fn parse_without_dollar() {
        let segments = parse("a.b").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Field("a".to_string()), Segment::Field("b".to_string())]
        );
    }

    #[test]
    fn parse_with_array_index() {
        let segments = parse("$.items[0].name").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("items".to_string()),
                Segment::Index(0),
                Segment::Field("name".to_string()),
            ]
        );
    }

    #[test]
    fn parse_wildcard_forms() {
        assert_eq!(
            parse("$.items[*].id").unwrap(),
            vec![
                Segment::Field("items".to_string()),
                Segment::Wildcard,
                Segment::Field("id".to_string()),
            ]
        );
        assert_eq!(
            parse("$.items.*").unwrap(),
            vec![Segment::Field("items".to_string()), Segment::Wildcard]
        );
    }

    #[test]
    fn parse_terminal_descent() {
        assert_eq!(
            parse("$.state..count").unwrap(),
            vec![
                Segment::Field("state".to_string()),
                Segment::Descend("count".to_string()),
            ]
        );
    }

    #[test]
    fn parse_rejects_non_terminal_descent() {
        assert!(parse("$.state..a.b").is_err());
    }

    #[test]
    fn parse_rejects_filters_and_slices() {
        assert!(parse("$.a[?(@.x==1)]").is_err());
        assert!(parse("$.a[0:5]").is_err());
    }

    #[test]
    fn parse_just_root() {
        assert!(parse("$").unwrap().is_empty());
    }

    #[test]
    fn writable_rejects_wildcard() {
        assert!(parse_writable("$.a.b").is_ok());
        assert!(matches!(
            parse_writable("$.a[*]"),
            Err(PathError::NotWritable { .. })
        ));
        assert!(matches!(
            parse_writable("$.a..b"),
            Err(PathError::NotWritable { .. })
        ));
    }

    #[test]
    fn read_simple() {
        let value = json!({"a": {"b": "value"}});
        assert_eq!(resolve(&value, "$.a.b").unwrap(), Some(json!("value")));
    }

    #[test]
    fn read_array_index() {
        let value = json!({"items": ["first", "second", "third"]});
        assert_eq!(resolve(&value, "$.items[1]").unwrap(), Some(json!("second")));
    }

    #[test]
    fn read_missing_yields_none() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, "$.b").unwrap(), None);
        assert_eq!(resolve(&value, "$.a.b.c").unwrap(), None);
    }

    #[test]
    fn read_wildcard_over_array() {
        let value = json!({"items": [{"id": 1}, {"id": 2}, {"noid": 3}]});
        assert_eq!(
            resolve(&value, "$.items[*].id").unwrap(),
            Some(json!([1, 2]))
        );
    }

    #[test]
    fn read_wildcard_over_object() {
        let value = json!({"branches": {"a": {"v": 1}, "b": {"v": 2}}});
        assert_eq!(
            resolve(&value, "$.branches.*.v").unwrap(),
            Some(json!([1, 2]))
        );
    }

    #[test]
    fn read_wildcard_missing_prefix() {
        let value = json!({});
        assert_eq!(resolve(&value, "$.items[*]").unwrap(), None);
    }

    #[test]
    fn read_descent_collects_everywhere() {
        let value = json!({
            "phase1": {"count": 3, "nested": {"count": 4}},
            "other": [{"count": 5}]
        });
        assert_eq!(
            resolve(&value, "$..count").unwrap(),
            Some(json!([3, 4, 5]))
        );
    }

    #[test]
    fn write_creates_intermediates() {
        let mut doc = json!({});
        let segments = parse_writable("$.a.b.c").unwrap();
        write(&mut doc, &segments, json!(42)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn write_pads_arrays() {
        let mut doc = json!({});
        let segments = parse_writable("$.items[2]").unwrap();
        write(&mut doc, &segments, json!("x")).unwrap();
        assert_eq!(doc, json!({"items": [null, null, "x"]}));
    }

    #[test]
    fn write_overwrites_scalar_intermediate() {
        let mut doc = json!({"a": 7});
        let segments = parse_writable("$.a.b").unwrap();
        write(&mut doc, &segments, json!(1)).unwrap();
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }

    #[test]
    fn display_roundtrip() {
        let segments = parse("$.a.items[3].name").unwrap();
        assert_eq!(display(&segments), "a.items[3].name");
    }
}
