//! Second-stage path evaluator: across every child created in a round, keep
//! the `threshold_k` paths that look closest to reproducing the bug.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use super::tree::{NodeId, SearchTree};
use crate::bug_report::BugReport;
use crate::config::TieBreak;
use crate::llm::judge::index_list;
use crate::llm::prompt::{PromptSet, format_history};
use crate::llm::{JudgeRequest, Judgment, Purpose};

/// Path ids as returned by the model, indices into the evaluated children
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PathVerdict {
    pub promising: Vec<usize>,
    pub completed: Vec<usize>,
}

/// The next frontier and what was dropped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Next frontier, claimed-complete paths first, at most `threshold_k`
    pub frontier: Vec<NodeId>,
    pub pruned: Vec<NodeId>,
    /// Frontier members the model says already reproduce the bug
    pub claimed: Vec<NodeId>,
    pub fallback: bool,
}

pub struct PathEvaluator<'a> {
    prompts: &'a PromptSet,
    report: &'a BugReport,
    threshold_k: usize,
    tie_break: TieBreak,
}

impl<'a> PathEvaluator<'a> {
    pub fn new(prompts: &'a PromptSet, report: &'a BugReport, threshold_k: usize, tie_break: TieBreak) -> Self {
        Self {
            prompts,
            report,
            threshold_k,
            tie_break,
        }
    }

    /// Build the request; path `P<i>` is `children[i]`
    pub fn request(&self, tree: &SearchTree, children: &[NodeId]) -> JudgeRequest {
        let mut paths = String::new();
        for (i, id) in children.iter().enumerate() {
            if i > 0 {
                paths.push_str("\n\n---\n\n");
            }
            let _ = write!(paths, "Path P{}:\n{}", i, format_history(&tree.history(*id)));
        }
        let count = children.len().to_string();
        let limit = self.threshold_k.to_string();
        let mut vars = self.report.prompt_vars().to_vec();
        vars.extend([
            ("paths", paths.as_str()),
            ("count", count.as_str()),
            ("limit", limit.as_str()),
        ]);
        JudgeRequest::new(Purpose::Evaluate, self.prompts.render(Purpose::Evaluate, &vars))
    }

    /// Validate a `{"promising": [...], "completed": [...]}` verdict
    pub fn parse(&self, value: &Value, count: usize) -> Result<PathVerdict, String> {
        if value.get("promising").is_none() && value.get("completed").is_none() {
            return Err("expected \"promising\" and \"completed\" lists".to_string());
        }
        let verdict = PathVerdict {
            promising: index_list(value, "promising")?,
            completed: index_list(value, "completed")?,
        };
        let all = verdict.completed.iter().chain(&verdict.promising);
        if let Some(bad) = all.clone().find(|&&i| i >= count) {
            return Err(format!("path P{} does not exist (0..{})", bad, count));
        }
        if count > self.threshold_k && all.count() == 0 {
            return Err("no path was kept".to_string());
        }
        Ok(verdict)
    }

    /// Turn the judgment into the next frontier
    pub fn decide(&self, tree: &SearchTree, children: &[NodeId], judgment: &Judgment<PathVerdict>) -> Evaluation {
        let Some(verdict) = &judgment.value else {
            return self.fallback(tree, children);
        };

        let completed: Vec<NodeId> = verdict.completed.iter().map(|&i| children[i]).collect();
        let mut order: Vec<NodeId> = completed.clone();
        order.extend(verdict.promising.iter().map(|&i| children[i]));
        if children.len() <= self.threshold_k {
            // Nothing is pruned; unnamed paths follow in creation order
            order.extend(children.iter().copied());
        }

        let mut seen = HashSet::new();
        let frontier: Vec<NodeId> = order
            .into_iter()
            .filter(|id| seen.insert(*id))
            .take(self.threshold_k)
            .collect();
        self.finish(children, frontier, completed, false)
    }

    /// Paths whose latest step changed the screen first, then the rest,
    /// each group in tie-break order
    pub fn fallback(&self, tree: &SearchTree, children: &[NodeId]) -> Evaluation {
        let mut ranked: Vec<NodeId> = children.to_vec();
        let ratio = |id: &NodeId| tree.get(*id).map(|n| n.effect.screen_ratio()).unwrap_or(0.0);
        if self.tie_break == TieBreak::LargestScreenDelta {
            ranked.sort_by(|a, b| ratio(b).total_cmp(&ratio(a)));
        }
        ranked.sort_by_key(|id| tree.get(*id).map(|n| n.effect.is_no_effect()).unwrap_or(true));
        ranked.truncate(self.threshold_k);
        self.finish(children, ranked, Vec::new(), true)
    }

    fn finish(&self, children: &[NodeId], frontier: Vec<NodeId>, completed: Vec<NodeId>, fallback: bool) -> Evaluation {
        let pruned = children.iter().copied().filter(|id| !frontier.contains(id)).collect();
        let claimed = frontier.iter().copied().filter(|id| completed.contains(id)).collect();
        Evaluation {
            frontier,
            pruned,
            claimed,
            fallback,
        }
    }
}
