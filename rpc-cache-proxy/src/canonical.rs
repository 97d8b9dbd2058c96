//! Request fingerprinting: `method + canonical(params)`.
//!
//! Resolved per the Open Question in spec.md §9 ("canonical parameter
//! stringification"): this proxy canonicalises with sorted object keys
//! rather than the source's insertion-order JSON, since `serde_json::Value`
//! already stores object members in a `BTreeMap` (no `preserve_order`
//! feature enabled) and so naturally serialises with lexicographically
//! sorted keys. Array order and number/hex-string literals are left
//! untouched, matching the invariant that the upstream and cache must agree
//! byte-for-byte.

use serde_json::Value;

pub fn fingerprint(method: &str, params: Option<&Value>) -> String {
    let empty = Value::Array(Vec::new());
    let params = params.unwrap_or(&empty);
    format!("{method}:{}", canonical_json(params))
}

fn canonical_json(value: &Value) -> String {
    // serde_json::Value already orders object keys via its internal
    // BTreeMap; to_string is the compact form the spec calls "stringify".
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_params_same_fingerprint() {
        let a = fingerprint("eth_blockNumber", Some(&json!([])));
        let b = fingerprint("eth_blockNumber", Some(&json!([])));
        assert_eq!(a, b);
    }

    #[test]
    fn no_params_equals_empty_array() {
        let a = fingerprint("eth_blockNumber", None);
        let b = fingerprint("eth_blockNumber", Some(&json!([])));
        assert_eq!(a, b);
    }

    #[test]
    fn hex_and_decimal_do_not_collide() {
        let hex = fingerprint("eth_getBalance", Some(&json!(["0xabc", "0x10"])));
        let dec = fingerprint("eth_getBalance", Some(&json!(["0xabc", "16"])));
        assert_ne!(hex, dec);
    }

    #[test]
    fn object_key_order_does_not_affect_fingerprint() {
        let a = fingerprint(
            "eth_getLogs",
            Some(&json!([{"fromBlock": "0x1", "toBlock": "0x2"}])),
        );
        let b = fingerprint(
            "eth_getLogs",
            Some(&json!([{"toBlock": "0x2", "fromBlock": "0x1"}])),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn array_order_is_significant() {
        let a = fingerprint("eth_call", Some(&json!([{"to": "0x1"}, "latest"])));
        let b = fingerprint("eth_call", Some(&json!(["latest", {"to": "0x1"}])));
        assert_ne!(a, b);
    }
}
