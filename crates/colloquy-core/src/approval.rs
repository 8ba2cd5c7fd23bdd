//! Approval Gate
//!
//! Static name sets plus a keyword heuristic decide whether a tool call may
//! run unattended. The decision itself is delegated to an [`ApprovalHandler`]
//! supplied by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::registry::ToolSource;
use crate::session::SessionId;
use crate::tool::ToolArguments;

/// Name fragments that mark an external or custom tool as side-effecting
pub const SIDE_EFFECT_KEYWORDS: &[&str] = &[
    "write", "edit", "delete", "remove", "create", "execute", "send", "commit", "push", "update",
    "modify", "move", "upload", "publish", "insert", "drop",
];

/// Classification of one tool invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalClass {
    AutoApproved,
    ApprovalRequired,
    /// Blocked by policy; never executed, never asked
    Denied,
}

/// Static approval sets
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Always require approval (destructive, filesystem, process execution)
    pub dangerous: Vec<String>,

    /// Require approval (content creation, outbound network)
    pub approval_required: Vec<String>,

    /// Never run
    pub blocked: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            dangerous: vec![
                "write_file".into(),
                "delete_file".into(),
                "execute_command".into(),
            ],
            approval_required: vec!["fetch_url".into()],
            blocked: Vec::new(),
        }
    }
}

/// Classifies tool calls as auto-approved, approval-required or denied
#[derive(Clone, Debug)]
pub struct ApprovalGate {
    dangerous: HashSet<String>,
    approval_required: HashSet<String>,
    blocked: HashSet<String>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(&ApprovalConfig::default())
    }
}

impl ApprovalGate {
    pub fn new(config: &ApprovalConfig) -> Self {
        Self {
            dangerous: config.dangerous.iter().cloned().collect(),
            approval_required: config.approval_required.iter().cloned().collect(),
            blocked: config.blocked.iter().cloned().collect(),
        }
    }

    /// Classify an invocation of `tool_name` served by `source`.
    ///
    /// Built-in tools outside the static sets are trusted; external and
    /// custom tools fall back to the keyword heuristic.
    pub fn classify(&self, tool_name: &str, source: Option<ToolSource>) -> ApprovalClass {
        if self.blocked.contains(tool_name) {
            return ApprovalClass::Denied;
        }
        if self.dangerous.contains(tool_name) || self.approval_required.contains(tool_name) {
            return ApprovalClass::ApprovalRequired;
        }
        match source {
            Some(ToolSource::External | ToolSource::Custom) if has_side_effect_keyword(tool_name) => {
                ApprovalClass::ApprovalRequired
            }
            _ => ApprovalClass::AutoApproved,
        }
    }

    pub fn requires_approval(&self, tool_name: &str, source: Option<ToolSource>) -> bool {
        self.classify(tool_name, source) == ApprovalClass::ApprovalRequired
    }

    pub fn is_dangerous(&self, tool_name: &str) -> bool {
        self.dangerous.contains(tool_name)
    }
}

/// Whether a tool name contains any of [`SIDE_EFFECT_KEYWORDS`]
pub fn has_side_effect_keyword(tool_name: &str) -> bool {
    let lower = tool_name.to_lowercase();
    SIDE_EFFECT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Outcome of an approval request
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
    /// Approve, but run with caller-edited arguments
    ApproveWithArguments(ToolArguments),
}

impl From<bool> for ApprovalDecision {
    fn from(approved: bool) -> Self {
        if approved { Self::Approve } else { Self::Deny }
    }
}

/// Caller-supplied approval callback
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> ApprovalDecision;
}

/// What to do with approval-required calls when no handler is configured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattendedApproval {
    Approve,
    #[default]
    Deny,
}

impl UnattendedApproval {
    pub const fn decision(self) -> ApprovalDecision {
        match self {
            Self::Approve => ApprovalDecision::Approve,
            Self::Deny => ApprovalDecision::Deny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_sets() {
        let gate = ApprovalGate::default();
        assert!(gate.requires_approval("delete_file", Some(ToolSource::Builtin)));
        assert!(gate.requires_approval("fetch_url", Some(ToolSource::Builtin)));
        assert!(!gate.requires_approval("read_file", Some(ToolSource::Builtin)));
        assert!(gate.is_dangerous("execute_command"));
    }

    #[test]
    fn test_keyword_heuristic_only_for_external_and_custom() {
        let gate = ApprovalGate::default();
        assert!(gate.requires_approval("github_create_issue", Some(ToolSource::External)));
        assert!(gate.requires_approval("SendEmail", Some(ToolSource::Custom)));
        assert!(!gate.requires_approval("github_list_issues", Some(ToolSource::External)));
        // trusted built-in without a static entry
        assert!(!gate.requires_approval("update_index", Some(ToolSource::Builtin)));
    }

    #[test]
    fn test_blocked_tools_are_denied() {
        let gate = ApprovalGate::new(&ApprovalConfig {
            blocked: vec!["format_disk".into()],
            ..Default::default()
        });
        assert_eq!(gate.classify("format_disk", Some(ToolSource::Custom)), ApprovalClass::Denied);
        assert!(!gate.requires_approval("format_disk", Some(ToolSource::Custom)));
    }

    #[test]
    fn test_requires_approval_is_idempotent() {
        let gate = ApprovalGate::default();
        for name in ["write_file", "remote_push", "read_file", "anything"] {
            for source in [None, Some(ToolSource::External), Some(ToolSource::Builtin)] {
                assert_eq!(
                    gate.requires_approval(name, source),
                    gate.requires_approval(name, source)
                );
            }
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ApprovalConfig =
            serde_json::from_str(r#"{"blocked": ["rm_rf"]}"#).unwrap();
        assert_eq!(config.blocked, vec!["rm_rf"]);
        assert!(config.dangerous.contains(&"delete_file".to_string()));
    }

    #[test]
    fn test_decision_from_bool() {
        assert_eq!(ApprovalDecision::from(true), ApprovalDecision::Approve);
        assert_eq!(ApprovalDecision::from(false), ApprovalDecision::Deny);
        assert_eq!(UnattendedApproval::default(), UnattendedApproval::Deny);
    }
}
