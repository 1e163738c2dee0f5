//! Host-port forwarding rule pairs.
//!
//! A mapping installs a DNAT rule in `prerouting` and a return-path
//! masquerade in `postrouting`. Handles are only known to the rule engine,
//! so removal always starts with a content lookup. Several mappings may
//! target the same VM, so both rules carry the mapping's key as their
//! comment and the return rule is only ever matched by that key.

use super::nat::NAT_TABLE;
use super::nft::{has_masquerade, payload_match, Rule, RuleRef, FAMILY};
use serde_json::{json, Value};
use std::fmt;

pub const PREROUTING_CHAIN: &str = "prerouting";
pub const POSTROUTING_CHAIN: &str = "postrouting";

/// Leading word of every mapping key.
pub const KEY_PREFIX: &str = "ember-forward";

/// True if `rule` belongs to any mapping whose destination is `dest_ip`.
pub fn targets(rule: &Rule, dest_ip: &str) -> bool {
    rule.comment
        .as_deref()
        .and_then(|c| c.strip_prefix(KEY_PREFIX))
        .and_then(|rest| rest.split_once("->"))
        .and_then(|(_, dest)| dest.strip_prefix(dest_ip))
        .is_some_and(|port| port.starts_with(':'))
}

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

/// `(host ip, host port) -> (dest ip, dest port)` for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortForward {
    pub host_ip: String,
    pub host_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: Protocol,
}

impl PortForward {
    pub fn tcp(
        host_ip: impl Into<String>,
        host_port: u16,
        dest_ip: impl Into<String>,
        dest_port: u16,
    ) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port,
            dest_ip: dest_ip.into(),
            dest_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Comment identifying this mapping's rules.
    pub fn key(&self) -> String {
        format!(
            "{KEY_PREFIX} {}:{}->{}:{}/{}",
            self.host_ip, self.host_port, self.dest_ip, self.dest_port, self.protocol
        )
    }

    /// Table, both chains and the rule pair.
    pub fn batch(&self) -> Value {
        let proto = self.protocol.to_string();
        let key = self.key();
        json!({
            "nftables": [
                {"add": {"table": {"family": FAMILY, "name": NAT_TABLE}}},
                {"add": {"chain": {
                    "family": FAMILY, "table": NAT_TABLE, "name": PREROUTING_CHAIN,
                    "type": "nat", "hook": "prerouting", "prio": -100, "policy": "accept"
                }}},
                {"add": {"chain": {
                    "family": FAMILY, "table": NAT_TABLE, "name": POSTROUTING_CHAIN,
                    "type": "nat", "hook": "postrouting", "prio": 100, "policy": "accept"
                }}},
                {"add": {"rule": {
                    "family": FAMILY, "table": NAT_TABLE, "chain": PREROUTING_CHAIN,
                    "expr": [
                        {"match": {"op": "==",
                            "left": {"payload": {"protocol": "ip", "field": "daddr"}},
                            "right": self.host_ip}},
                        {"match": {"op": "==",
                            "left": {"payload": {"protocol": proto, "field": "dport"}},
                            "right": self.host_port}},
                        {"dnat": {"addr": self.dest_ip, "port": self.dest_port}}
                    ],
                    "comment": key
                }}},
                {"add": {"rule": {
                    "family": FAMILY, "table": NAT_TABLE, "chain": POSTROUTING_CHAIN,
                    "expr": [
                        {"match": {"op": "==",
                            "left": {"payload": {"protocol": "ip", "field": "saddr"}},
                            "right": {"prefix": {"addr": self.dest_ip, "len": 32}}}},
                        {"match": {"op": "==",
                            "left": {"payload": {"protocol": proto, "field": "sport"}},
                            "right": self.dest_port}},
                        {"masquerade": null}
                    ],
                    "comment": key
                }}}
            ]
        })
    }

    fn is_dnat_rule(&self, rule: &Rule) -> bool {
        let mut daddr = false;
        let mut dport = false;
        let mut dnat = false;
        for e in &rule.expr {
            if payload_match(e, "daddr").and_then(Value::as_str) == Some(self.host_ip.as_str()) {
                daddr = true;
            }
            if payload_match(e, "dport").and_then(Value::as_u64) == Some(u64::from(self.host_port))
            {
                dport = true;
            }
            if let Some(target) = e.get("dnat") {
                dnat = target.get("addr").and_then(Value::as_str) == Some(self.dest_ip.as_str())
                    && target.get("port").and_then(Value::as_u64)
                        == Some(u64::from(self.dest_port));
            }
        }
        daddr && dport && dnat
    }

    fn is_return_rule(&self, rule: &Rule) -> bool {
        if rule.comment.as_deref() != Some(self.key().as_str()) {
            return false;
        }
        let saddr = rule.expr.iter().any(|e| {
            payload_match(e, "saddr").is_some_and(|right| {
                right.as_str() == Some(self.dest_ip.as_str())
                    || right.pointer("/prefix/addr").and_then(Value::as_str)
                        == Some(self.dest_ip.as_str())
            })
        });
        saddr && has_masquerade(rule)
    }

    /// Locate the installed rule pair, in either chain-name case.
    pub fn find(&self, rules: &[Rule]) -> ForwardHandles {
        let mut handles = ForwardHandles::default();
        for rule in rules.iter().filter(|r| r.family == FAMILY && r.table == NAT_TABLE) {
            if rule.chain.eq_ignore_ascii_case(PREROUTING_CHAIN) && self.is_dnat_rule(rule) {
                handles.prerouting = Some(RuleRef::from(rule));
            } else if rule.chain.eq_ignore_ascii_case(POSTROUTING_CHAIN) && self.is_return_rule(rule)
            {
                handles.postrouting = Some(RuleRef::from(rule));
            }
        }
        handles
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}/{}",
            self.host_ip, self.host_port, self.dest_ip, self.dest_port, self.protocol
        )
    }
}

/// Rule handles of an installed mapping, with the chain each was found in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardHandles {
    pub prerouting: Option<RuleRef>,
    pub postrouting: Option<RuleRef>,
}

impl ForwardHandles {
    pub fn is_empty(&self) -> bool {
        self.prerouting.is_none() && self.postrouting.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.prerouting.is_some() && self.postrouting.is_some()
    }
}
