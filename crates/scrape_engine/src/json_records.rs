use std::collections::VecDeque;

use scrape_core::Record;
use serde_json::Value;

const MAX_VISITED: usize = 500;
const MAX_ITEMS_PER_ARRAY: usize = 50;

/// Records discovered in an API payload and where they were found.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRecords {
    pub records: Vec<Record>,
    /// JSONPath-like location, `$` for the root.
    pub path: String,
}

/// Finds the largest non-empty array of objects with a bounded breadth-first
/// walk. Falls back to the root object as a single record; `None` when the
/// payload holds nothing record-shaped.
pub fn find_json_records(payload: &Value) -> Option<JsonRecords> {
    if let Some(records) = as_records(payload) {
        return Some(JsonRecords {
            records,
            path: "$".to_string(),
        });
    }
    if !payload.is_object() && !payload.is_array() {
        return None;
    }

    let mut best: Option<(&Vec<Value>, String)> = None;
    let mut queue: VecDeque<(&Value, String)> = VecDeque::from([(payload, "$".to_string())]);
    let mut visited = 0;

    while let Some((node, path)) = queue.pop_front() {
        if visited >= MAX_VISITED {
            break;
        }
        visited += 1;

        match node {
            Value::Array(items) if is_record_list(items) => {
                if best.as_ref().map_or(true, |(b, _)| items.len() > b.len()) {
                    best = Some((items, path));
                }
            }
            Value::Object(map) => {
                for (key, value) in map {
                    queue.push_back((value, format!("{path}.{key}")));
                }
            }
            Value::Array(items) => {
                for (idx, value) in items.iter().take(MAX_ITEMS_PER_ARRAY).enumerate() {
                    queue.push_back((value, format!("{path}[{idx}]")));
                }
            }
            _ => {}
        }
    }

    if let Some((items, path)) = best {
        return Some(JsonRecords {
            records: items.iter().filter_map(|v| v.as_object().cloned()).collect(),
            path,
        });
    }

    match payload {
        Value::Object(map) if !map.is_empty() => Some(JsonRecords {
            records: vec![map.clone()],
            path: "$".to_string(),
        }),
        _ => None,
    }
}

fn is_record_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(Value::is_object)
}

fn as_records(value: &Value) -> Option<Vec<Record>> {
    match value {
        Value::Array(items) if is_record_list(items) => {
            Some(items.iter().filter_map(|v| v.as_object().cloned()).collect())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_array_of_objects() {
        let found = find_json_records(&json!([{"a": 1}, {"a": 2}])).unwrap();
        assert_eq!(found.path, "$");
        assert_eq!(found.records.len(), 2);
    }

    #[test]
    fn largest_nested_list_wins() {
        let payload = json!({
            "meta": {"tags": [{"t": 1}]},
            "data": {"items": [{"id": 1}, {"id": 2}, {"id": 3}]}
        });
        let found = find_json_records(&payload).unwrap();
        assert_eq!(found.path, "$.data.items");
        assert_eq!(found.records.len(), 3);
    }

    #[test]
    fn single_object_falls_back_to_root() {
        let payload = json!({"data": {"company": {"name": "Acme"}}});
        let found = find_json_records(&payload).unwrap();
        assert_eq!(found.path, "$");
        assert_eq!(found.records[0]["data"]["company"]["name"], "Acme");
    }

    #[test]
    fn scalars_and_empty_containers_yield_nothing() {
        assert!(find_json_records(&json!(42)).is_none());
        assert!(find_json_records(&json!({})).is_none());
        assert!(find_json_records(&json!([])).is_none());
        assert!(find_json_records(&json!([1, 2])).is_none());
    }
}
