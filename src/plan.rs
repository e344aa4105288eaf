//! Execution plan and capability types.
//!
//! The plan is produced by the trust-policy compiler outside this crate. The
//! core only reads it: a node's `granted_caps` is the full authority a kernel
//! bound to that node may ever exercise.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Isolation level an execution claims to run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fully mediated, self-tested sandbox.
    Strict,
    /// Strict isolation was not achieved.
    Compatible,
    Legacy,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Strict => "strict",
            ExecutionMode::Compatible => "compatible",
            ExecutionMode::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capability asked for by sandboxed code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
    pub cap_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

/// A capability handed to a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityGrant {
    pub cap_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Policy rule or principal that issued the grant.
    pub granted_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Block hash of the code this node binds.
    pub node_id: String,
    pub tier: String,
    pub allow_execute: bool,
    #[serde(default)]
    pub granted_caps: Vec<CapabilityGrant>,
}

impl PlanNode {
    /// Capability ids granted to this node.
    pub fn granted_cap_ids(&self) -> BTreeSet<String> {
        self.granted_caps.iter().map(|g| g.cap_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub plan_digest: String,
    #[serde(default)]
    pub nodes: Vec<PlanNode>,
}

impl ExecutionPlan {
    pub fn node(&self, block_hash: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.node_id == block_hash)
    }
}

/// Capability ids are dotted lowercase identifiers, e.g. `net.fetch`.
pub fn is_valid_cap_id(cap_id: &str) -> bool {
    !cap_id.is_empty()
        && cap_id.len() <= 128
        && cap_id.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_deserializes_camel_case() {
        let plan: ExecutionPlan = serde_json::from_value(json!({
            "planDigest": "plan-1",
            "nodes": [{
                "nodeId": "block-1",
                "tier": "T1",
                "allowExecute": true,
                "grantedCaps": [
                    {"capId": "net.fetch", "grantedBy": "policy:default"},
                    {"capId": "storage.read", "params": {"prefix": "a/"}, "grantedBy": "policy:default"}
                ]
            }]
        }))
        .unwrap();

        let node = plan.node("block-1").unwrap();
        assert!(node.allow_execute);
        assert_eq!(
            node.granted_cap_ids().into_iter().collect::<Vec<_>>(),
            vec!["net.fetch", "storage.read"]
        );
        assert!(plan.node("block-2").is_none());
    }

    #[test]
    fn test_execution_mode_serde() {
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Compatible).unwrap(),
            "\"compatible\""
        );
        let mode: ExecutionMode = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(mode, ExecutionMode::Strict);
    }

    #[test]
    fn test_cap_id_validation() {
        assert!(is_valid_cap_id("net.fetch"));
        assert!(is_valid_cap_id("storage.kv_read"));
        assert!(!is_valid_cap_id(""));
        assert!(!is_valid_cap_id("net..fetch"));
        assert!(!is_valid_cap_id("Net.Fetch"));
        assert!(!is_valid_cap_id("net fetch"));
    }
}
