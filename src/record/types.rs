//! Entries of the run record (`record.jsonl`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bug_report::BugReport;
use crate::config::ExploreConfig;
use crate::explore::action::Action;
use crate::explore::effect::VisualEffect;
use crate::explore::tree::{NodeId, NodeStatus};
use crate::llm::{Attempt, Purpose};

/// Result type for run record operations
pub type RecordResult<T> = Result<T, RecordError>;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("run record I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("run record serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// One line of `record.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RecordEntry {
    RunStarted(RunHeader),
    Round(RoundRecord),
    RunFinished(RunTrailer),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub started_at: String,
    pub bug: BugReport,
    pub config: ExploreConfig,
    /// Device implementation, e.g. `adb:emulator-5554`
    pub device: String,
    pub root: NodeRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrailer {
    pub finished_at: String,
    /// `success`, `budget_exhausted`, `fatal` or `cancelled`
    pub outcome: String,
    pub detail: String,
    pub rounds: usize,
    pub transitions: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<NodeId>,
    /// Committed actions of the success node, root first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// Everything that happened in one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    pub frontier_before: Vec<NodeId>,
    pub expansions: Vec<ExpansionRecord>,
    pub created: Vec<NodeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<LlmExchange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<LlmExchange>,
    pub status_changes: Vec<StatusChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
    pub frontier_after: Vec<NodeId>,
    /// Committed actions so far, including this round
    pub transitions: usize,
    /// Set when the round was cut short by success, cancellation or a fatal error
    #[serde(default)]
    pub partial: bool,
}

/// Trial results and first-stage choice for one frontier node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    pub node: NodeId,
    pub candidates: Vec<CandidateRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<LlmExchange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<LlmExchange>,
    /// Candidate indices chosen for commit, best first
    pub chosen: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub index: usize,
    pub action: Action,
    pub description: String,
    pub effect: VisualEffect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub effect: String,
    pub depth: usize,
    pub round: usize,
    pub foreground: String,
    pub digest: String,
    pub snapshot: String,
    /// Screenshot file relative to the run directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
}

/// One judgment: the prompt, every attempt, and what the engine did with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmExchange {
    pub purpose: Purpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    pub prompt: String,
    pub attempts: Vec<Attempt>,
    /// Parsed verdict as applied, or `null` when the fallback was used
    pub verdict: Value,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub node: NodeId,
    pub status: NodeStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub round: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Error class, e.g. `ActionExecutionError`
    pub kind: String,
    pub message: String,
}
