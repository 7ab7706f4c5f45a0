//! Dot-path get/set over `serde_json::Value` maps.
//!
//! Used wherever nested reads/writes are permitted via dot notation: join
//! `path_mappings`, output extraction.

use serde_json::Value;

/// Read a dot-path (`"a.b.c"`) out of a JSON object. Returns `None` if any
/// segment is missing or the value at some prefix isn't an object.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at a dot-path (`"a.b.c"`) into a JSON object, creating
/// intermediate objects as needed. Fails silently (overwrites) if an
/// intermediate segment already holds a non-object value.
pub fn set(root: &mut Value, path: &str, value: Value) {
    if !root.is_object() {
        *root = Value::Object(serde_json::Map::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let map = current.as_object_mut().expect("root coerced to object above");
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }
    let map = current.as_object_mut().expect("intermediate coerced to object above");
    map.insert(
        segments[segments.len() - 1].to_string(),
        value,
    );
}
