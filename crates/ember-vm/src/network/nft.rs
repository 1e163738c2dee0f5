//! Packet-filter rule engine.
//!
//! Rules are managed through the nftables JSON interface. The engine is
//! chosen once: either `nft` is available, or every operation fails with
//! a network error through [`UnavailableRuleEngine`].

use crate::error::{Result, VmError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Address family every ember table lives in.
pub const FAMILY: &str = "ip";

/// A rule as listed by the engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Rule {
    pub family: String,
    pub table: String,
    pub chain: String,
    pub handle: u64,
    #[serde(default)]
    pub expr: Vec<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Location of a rule, enough to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub table: String,
    pub chain: String,
    pub handle: u64,
}

impl From<&Rule> for RuleRef {
    fn from(rule: &Rule) -> Self {
        Self {
            table: rule.table.clone(),
            chain: rule.chain.clone(),
            handle: rule.handle,
        }
    }
}

/// Capability interface for rule management.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Apply a `{"nftables": [...]}` batch. "Already exists" is success.
    async fn apply(&self, batch: &Value) -> Result<()>;

    /// List the rules of `ip <table>`. A missing table lists as empty.
    async fn list_rules(&self, table: &str) -> Result<Vec<Rule>>;

    async fn delete_rule(&self, rule: &RuleRef) -> Result<()>;
}

/// Pick the rule engine for this host.
pub fn detect_rule_engine() -> Arc<dyn RuleEngine> {
    match which::which("nft") {
        Ok(path) => {
            tracing::debug!(nft = %path.display(), "Using nftables rule engine");
            Arc::new(NftRuleEngine::new(path))
        }
        Err(e) => {
            tracing::warn!(error = %e, "nft not found, packet filtering unavailable");
            Arc::new(UnavailableRuleEngine)
        }
    }
}

/// Rule engine backed by the `nft` binary.
#[derive(Debug, Clone)]
pub struct NftRuleEngine {
    binary: PathBuf,
}

impl NftRuleEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<std::process::Output> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| VmError::Network(format!("failed to run nft: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        Ok(child.wait_with_output().await?)
    }
}

fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("File exists")
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

#[async_trait]
impl RuleEngine for NftRuleEngine {
    async fn apply(&self, batch: &Value) -> Result<()> {
        let input = serde_json::to_vec(batch)?;
        tracing::trace!(batch = %batch, "Applying nftables batch");

        let output = self.run(&["-j", "-f", "-"], Some(&input)).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !is_already_exists(&stderr) {
            return Err(VmError::Network(format!(
                "nft rejected batch: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn list_rules(&self, table: &str) -> Result<Vec<Rule>> {
        let output = self.run(&["-j", "list", "table", FAMILY, table], None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(Vec::new());
            }
            return Err(VmError::Network(format!(
                "failed to list table {table}: {}",
                stderr.trim()
            )));
        }
        parse_ruleset(&output.stdout)
    }

    async fn delete_rule(&self, rule: &RuleRef) -> Result<()> {
        let handle = rule.handle.to_string();
        let output = self
            .run(
                &[
                    "delete", "rule", FAMILY, &rule.table, &rule.chain, "handle", &handle,
                ],
                None,
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::Network(format!(
                "failed to delete rule {} in {}/{}: {}",
                rule.handle,
                rule.table,
                rule.chain,
                stderr.trim()
            )));
        }
        tracing::debug!(table = %rule.table, chain = %rule.chain, handle = rule.handle, "Rule deleted");
        Ok(())
    }
}

/// Sentinel engine for hosts without nftables.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRuleEngine;

fn unavailable() -> VmError {
    VmError::Network("packet-filter rule engine is not available on this host".into())
}

#[async_trait]
impl RuleEngine for UnavailableRuleEngine {
    async fn apply(&self, _batch: &Value) -> Result<()> {
        Err(unavailable())
    }

    async fn list_rules(&self, _table: &str) -> Result<Vec<Rule>> {
        Err(unavailable())
    }

    async fn delete_rule(&self, _rule: &RuleRef) -> Result<()> {
        Err(unavailable())
    }
}

/// Extract the rules from `nft -j list` output.
pub fn parse_ruleset(json: &[u8]) -> Result<Vec<Rule>> {
    let doc: Value = serde_json::from_slice(json)?;
    let items = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| VmError::Network("nft output has no \"nftables\" array".into()))?;

    items
        .iter()
        .filter_map(|item| item.get("rule"))
        .map(|rule| serde_json::from_value(rule.clone()).map_err(VmError::from))
        .collect()
}

/// `left` side of a match expression is `{"meta": {"key": <key>}}`.
pub(crate) fn meta_match<'a>(expr: &'a Value, key: &str) -> Option<&'a Value> {
    let m = expr.get("match")?;
    if m.get("op").and_then(Value::as_str) != Some("==") {
        return None;
    }
    if m.pointer("/left/meta/key").and_then(Value::as_str) != Some(key) {
        return None;
    }
    m.get("right")
}

/// `left` side of a match expression is `{"payload": {"field": <field>}}`.
pub(crate) fn payload_match<'a>(expr: &'a Value, field: &str) -> Option<&'a Value> {
    let m = expr.get("match")?;
    if m.get("op").and_then(Value::as_str) != Some("==") {
        return None;
    }
    if m.pointer("/left/payload/field").and_then(Value::as_str) != Some(field) {
        return None;
    }
    m.get("right")
}

/// True if a rule contains a `masquerade` statement.
pub(crate) fn has_masquerade(rule: &Rule) -> bool {
    rule.expr.iter().any(|e| e.get("masquerade").is_some())
}
