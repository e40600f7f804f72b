use serde_json::Value;

/// Deep-merge `partial` into `target`.
/// Objects merge key by key; any other partial value (arrays, scalars,
/// `null`) replaces the target value wholesale.
/// Complexity: O(p), p = size of `partial`.
pub fn deep_merge(target: &mut Value, partial: &Value) {
    match (target, partial) {
        (Value::Object(target_map), Value::Object(partial_map)) => {
            for (key, incoming) in partial_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => {
                        target_map.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        (target, partial) => *target = partial.clone(),
    }
}

pub fn merged(base: &Value, partial: &Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, partial);
    out
}
