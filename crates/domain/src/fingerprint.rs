use serde_json::Value;
use sha2::{Digest, Sha256};

/// 计算快照的内容指纹
///
/// 对象键按字典序输出后再做 SHA-256，键顺序不同但内容相同的快照得到相同指纹。
pub fn fingerprint(snapshot: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(snapshot, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"table": "orders", "columns": [{"name": "id", "type": "int"}]});
        let b = json!({"columns": [{"type": "int", "name": "id"}], "table": "orders"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_content_change_changes_fingerprint() {
        let a = json!({"columns": ["id", "amount"]});
        let b = json!({"columns": ["amount", "id"]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }
}
