//! NAT rules for tap devices that are not bridged.

use super::nft::{has_masquerade, meta_match, Rule, RuleRef, FAMILY};
use serde_json::{json, Value};

pub const FILTER_TABLE: &str = "filter";
pub const FORWARD_CHAIN: &str = "FORWARD";
pub const NAT_TABLE: &str = "nat";
pub const NAT_POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Tables, chains and the forward-accept rule for `tap` -> `uplink`.
pub fn forward_batch(tap: &str, uplink: &str) -> Value {
    json!({
        "nftables": [
            {"add": {"table": {"family": FAMILY, "name": NAT_TABLE}}},
            {"add": {"chain": {
                "family": FAMILY, "table": NAT_TABLE, "name": NAT_POSTROUTING_CHAIN,
                "type": "nat", "hook": "postrouting", "prio": 100, "policy": "accept"
            }}},
            {"add": {"table": {"family": FAMILY, "name": FILTER_TABLE}}},
            {"add": {"chain": {
                "family": FAMILY, "table": FILTER_TABLE, "name": FORWARD_CHAIN,
                "type": "filter", "hook": "forward", "prio": 0, "policy": "accept"
            }}},
            {"add": {"rule": {
                "family": FAMILY, "table": FILTER_TABLE, "chain": FORWARD_CHAIN,
                "expr": [
                    {"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": tap}},
                    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": uplink}},
                    {"counter": {"packets": 0, "bytes": 0}},
                    {"accept": null}
                ]
            }}}
        ]
    })
}

/// The shared masquerade rule for an uplink.
pub fn masquerade_batch(uplink: &str) -> Value {
    json!({
        "nftables": [
            {"add": {"rule": {
                "family": FAMILY, "table": NAT_TABLE, "chain": NAT_POSTROUTING_CHAIN,
                "expr": [
                    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": uplink}},
                    {"counter": {"packets": 0, "bytes": 0}},
                    {"masquerade": null}
                ]
            }}}
        ]
    })
}

/// Find the uplink masquerade rule by content.
pub fn find_masquerade(rules: &[Rule], uplink: &str) -> Option<RuleRef> {
    rules
        .iter()
        .filter(|r| r.chain == NAT_POSTROUTING_CHAIN)
        .find(|r| {
            has_masquerade(r)
                && r.expr
                    .iter()
                    .any(|e| meta_match(e, "oifname").and_then(Value::as_str) == Some(uplink))
        })
        .map(RuleRef::from)
}

/// Rules whose input or output interface is exactly `tap`.
pub fn find_tap_rules(rules: &[Rule], tap: &str) -> Vec<RuleRef> {
    rules
        .iter()
        .filter(|r| {
            r.expr.iter().any(|e| {
                ["iifname", "oifname"]
                    .into_iter()
                    .any(|key| meta_match(e, key).and_then(Value::as_str) == Some(tap))
            })
        })
        .map(RuleRef::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(table: &str, chain: &str, handle: u64, expr: Value) -> Rule {
        Rule {
            family: FAMILY.into(),
            table: table.into(),
            chain: chain.into(),
            handle,
            expr: expr.as_array().cloned().unwrap_or_default(),
            comment: None,
        }
    }

    #[test]
    fn test_forward_batch_shape() {
        let batch = forward_batch("tap_abcd1234", "eth0");
        let items = batch["nftables"].as_array().unwrap();
        assert_eq!(items.len(), 5);
        let expr = &items[4]["add"]["rule"]["expr"];
        assert_eq!(expr[0]["match"]["right"], "tap_abcd1234");
        assert_eq!(expr[1]["match"]["right"], "eth0");
    }

    #[test]
    fn test_find_masquerade_by_content() {
        let rules = vec![
            rule(
                NAT_TABLE,
                NAT_POSTROUTING_CHAIN,
                4,
                json!([
                    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": "wlan0"}},
                    {"masquerade": null}
                ]),
            ),
            rule(
                NAT_TABLE,
                NAT_POSTROUTING_CHAIN,
                9,
                json!([
                    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": "eth0"}},
                    {"counter": {"packets": 0, "bytes": 0}},
                    {"masquerade": null}
                ]),
            ),
        ];
        assert_eq!(find_masquerade(&rules, "eth0").map(|r| r.handle), Some(9));
        assert!(find_masquerade(&rules, "enp3s0").is_none());
    }

    #[test]
    fn test_find_tap_rules() {
        let batch = forward_batch("tap_abcd1234", "eth0");
        let expr = batch["nftables"][4]["add"]["rule"]["expr"].clone();
        let rules = vec![
            rule(FILTER_TABLE, FORWARD_CHAIN, 12, expr),
            rule(
                FILTER_TABLE,
                FORWARD_CHAIN,
                13,
                json!([{"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": "tap_zzzz0000"}}]),
            ),
        ];
        let found = find_tap_rules(&rules, "tap_abcd1234");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, 12);
        assert_eq!(found[0].chain, FORWARD_CHAIN);
    }

    #[test]
    fn test_find_tap_rules_ignores_name_prefixes() {
        let rules = vec![
            rule(
                FILTER_TABLE,
                FORWARD_CHAIN,
                3,
                forward_batch("tap_abc", "eth0")["nftables"][4]["add"]["rule"]["expr"].clone(),
            ),
            rule(
                FILTER_TABLE,
                FORWARD_CHAIN,
                4,
                forward_batch("tap_abcd", "eth0")["nftables"][4]["add"]["rule"]["expr"].clone(),
            ),
        ];
        let found = find_tap_rules(&rules, "tap_abc");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, 3);
        assert_eq!(find_tap_rules(&rules, "tap_ab").len(), 0);
    }
}
