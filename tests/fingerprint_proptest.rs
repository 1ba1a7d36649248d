//! Property tests for request fingerprints

use proptest::prelude::*;
use serde_json::{Map, Value};

use rpc_shield::fingerprint;

fn object_from(entries: &[(String, i64)]) -> Value {
    let mut map = Map::new();
    for (k, v) in entries {
        map.insert(k.clone(), Value::from(*v));
    }
    Value::Object(map)
}

proptest! {
    #[test]
    fn key_order_does_not_change_fingerprint(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
    ) {
        let forward: Vec<(String, i64)> = entries.clone().into_iter().collect();
        let mut backward = forward.clone();
        backward.reverse();

        let a = Value::Array(vec![Value::from("addr"), object_from(&forward)]);
        let b = Value::Array(vec![Value::from("addr"), object_from(&backward)]);
        prop_assert_eq!(
            fingerprint("ns", "getAccountInfo", &a),
            fingerprint("ns", "getAccountInfo", &b)
        );
    }

    #[test]
    fn namespace_and_method_separate_keys(
        params in prop::collection::vec(any::<u32>(), 0..6),
        method in "[a-zA-Z]{1,16}"
    ) {
        let params = Value::from(params);
        let key = fingerprint("mainnet", &method, &params);

        prop_assert_ne!(key, fingerprint("devnet", &method, &params));
        prop_assert_ne!(key, fingerprint("mainnet", &format!("{}X", method), &params));
        prop_assert_eq!(key.to_string().len(), 32);
    }

    #[test]
    fn different_params_rarely_collide(a in any::<u64>(), b in any::<u64>()) {
        prop_assume!(a != b);
        prop_assert_ne!(
            fingerprint("ns", "getSlot", &Value::from(vec![a])),
            fingerprint("ns", "getSlot", &Value::from(vec![b]))
        );
    }
}
