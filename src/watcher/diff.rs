// Canonical JSON diff for native-config snapshots
//
// Walks two JSON trees and reports leaf-level differences as dotted
// paths ("env.ANTHROPIC_BASE_URL"). Patterns filter those paths; a `*`
// matches exactly one path segment.

use serde_json::Value;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// Compare two snapshots, returning every differing leaf path.
pub fn diff(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    walk(old, new, String::new(), &mut entries);
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn walk(old: &Value, new: &Value, path: String, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = join(&path, key);
                match new_map.get(key) {
                    Some(new_value) => walk(old_value, new_value, child, out),
                    None => out.push(DiffEntry {
                        path: child,
                        kind: DiffKind::Removed,
                        old: Some(old_value.clone()),
                        new: None,
                    }),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    out.push(DiffEntry {
                        path: join(&path, key),
                        kind: DiffKind::Added,
                        old: None,
                        new: Some(new_value.clone()),
                    });
                }
            }
        }
        _ if old == new => {}
        // Null-vs-missing at the root counts as added/removed wholesale
        (Value::Null, other) => out.push(DiffEntry {
            path,
            kind: DiffKind::Added,
            old: None,
            new: Some(other.clone()),
        }),
        (other, Value::Null) => out.push(DiffEntry {
            path,
            kind: DiffKind::Removed,
            old: Some(other.clone()),
            new: None,
        }),
        (old_value, new_value) => out.push(DiffEntry {
            path,
            kind: DiffKind::Changed,
            old: Some(old_value.clone()),
            new: Some(new_value.clone()),
        }),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Match a dotted path against a pattern where `*` matches exactly one
/// segment ("ui.*" matches "ui.scale" but not "ui.panel.width").
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let path_segments: Vec<&str> = path.split('.').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(&path_segments)
        .all(|(p, s)| *p == "*" || p == s)
}

/// True if any pattern in the list matches the path.
pub fn any_match(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, path))
}
