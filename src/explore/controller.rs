//! Search controller.
//!
//! Drives the beam search over a single device:
//! `Initializing -> Round(expand -> filter -> prune -> advance) -> ...`
//! until success, budget exhaustion, cancellation or a fatal error.
//!
//! Device calls are strictly sequential. LLM judgments run concurrently,
//! but only between device phases, so no judgment is ever in flight while
//! the device is being driven. Cancellation is honored at phase boundaries
//! and never during a commit.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::action::{Action, ActionEnumerator};
use super::backtrack::{Backtracker, Restore};
use super::effect::record_effect;
use super::evaluator::PathEvaluator;
use super::filter::{ActionFilter, Candidate};
use super::input::InputSynthesizer;
use super::success::{SuccessValidator, crashed};
use super::tree::{Frontier, NodeId, NodeStatus, SearchTree, TreeError};
use crate::bug_report::BugReport;
use crate::config::{ConfigError, ExploreConfig};
use crate::device::{Device, DeviceError};
use crate::llm::prompt::PromptSet;
use crate::llm::{Judge, JudgeRequest, Judgment, Purpose, RetryPolicy, judge_all, judge_with_retry};
use crate::record::{
    CandidateRecord, ErrorRecord, ExpansionRecord, LlmExchange, NodeRecord, RecordEntry, RoundRecord, RunHeader,
    RunRecorder, RunTrailer, StatusChange,
};

/// Shared flag that asks a run to stop at the next phase boundary
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which budget ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhausted {
    Rounds,
    Transitions,
    Time,
    /// The frontier emptied out
    SearchSpace,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Exhausted::Rounds => "round budget exhausted",
            Exhausted::Transitions => "action budget exhausted",
            Exhausted::Time => "time budget exhausted",
            Exhausted::SearchSpace => "no active paths left",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { node: NodeId, actions: Vec<Action> },
    BudgetExhausted(Exhausted),
    Fatal(String),
    Cancelled,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::BudgetExhausted(_) => "budget_exhausted",
            Outcome::Fatal(_) => "fatal",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Outcome::Success { node, actions } => format!("{} reproduced the bug after {} action(s)", node, actions.len()),
            Outcome::BudgetExhausted(reason) => reason.to_string(),
            Outcome::Fatal(reason) => reason.clone(),
            Outcome::Cancelled => "cancelled by user".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExploreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("search tree invariant violated: {0}")]
    Tree(#[from] TreeError),
}

/// Result of a finished run
#[derive(Debug)]
pub struct ExploreReport {
    pub outcome: Outcome,
    pub tree: SearchTree,
    pub rounds: usize,
    pub transitions: usize,
    pub elapsed: Duration,
}

/// Mutable state of a run
struct Progress {
    tree: SearchTree,
    frontier: Frontier,
    backtracker: Backtracker,
    rounds: usize,
    transitions: usize,
    started: Instant,
}

impl Progress {
    fn set_status(
        &mut self,
        rec: &mut RoundRecord,
        node: NodeId,
        status: NodeStatus,
        reason: impl Into<String>,
    ) -> Result<(), TreeError> {
        let reason = reason.into();
        self.tree.set_status(node, status)?;
        debug!(%node, %status, %reason, "node status changed");
        rec.status_changes.push(StatusChange { node, status, reason });
        Ok(())
    }

    /// Mark `node` pruned or failed and release its snapshot
    fn retire(
        &mut self,
        device: &mut dyn Device,
        rec: &mut RoundRecord,
        node: NodeId,
        status: NodeStatus,
        reason: impl Into<String>,
    ) -> Result<(), TreeError> {
        self.set_status(rec, node, status, reason)?;
        if let Err(e) = self.backtracker.release(device, &self.tree, node) {
            record_error(rec, Some(node), None, &e);
        }
        Ok(())
    }

    /// Bring `node` back on the device, recording a fallback replay as an error
    fn make_live(
        &mut self,
        device: &mut dyn Device,
        rec: &mut RoundRecord,
        node: NodeId,
        action: Option<&Action>,
    ) -> Result<(), DeviceError> {
        if let Restore::Replayed(cause) = self.backtracker.ensure_live(device, &self.tree, node)? {
            record_error(rec, Some(node), action, &cause);
        }
        Ok(())
    }

    fn all_failed(&self, nodes: &[NodeId]) -> bool {
        !nodes.is_empty() && nodes.iter().all(|id| self.tree.status(*id) == Some(NodeStatus::Failed))
    }
}

/// One frontier node's trial results
struct Expansion {
    node: NodeId,
    candidates: Vec<Candidate>,
    record: ExpansionRecord,
}

fn record_error(rec: &mut RoundRecord, node: Option<NodeId>, action: Option<&Action>, err: &DeviceError) {
    warn!(
        round = rec.round,
        node = ?node,
        action = ?action.map(|a| a.to_string()),
        kind = err.kind(),
        error = %err,
        "device error"
    );
    rec.errors.push(ErrorRecord {
        round: rec.round,
        node,
        action: action.map(|a| a.to_string()),
        kind: err.kind().to_string(),
        message: err.to_string(),
    });
}

fn exchange<V: Serialize>(
    node: Option<NodeId>,
    request: &JudgeRequest,
    judgment: &Judgment<V>,
    applied: Option<Value>,
) -> LlmExchange {
    let verdict = applied
        .or_else(|| judgment.value.as_ref().and_then(|v| serde_json::to_value(v).ok()))
        .unwrap_or(Value::Null);
    LlmExchange {
        purpose: request.purpose,
        node,
        prompt: request.prompt.clone(),
        attempts: judgment.attempts.clone(),
        verdict,
        fallback: judgment.value.is_none(),
    }
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Beam search over one device, guided by a judge
pub struct Explorer<'a> {
    device: &'a mut dyn Device,
    judge: &'a dyn Judge,
    report: &'a BugReport,
    config: ExploreConfig,
    prompts: PromptSet,
    recorder: Option<&'a mut RunRecorder>,
    cancel: CancelToken,
}

impl<'a> Explorer<'a> {
    pub fn new(device: &'a mut dyn Device, judge: &'a dyn Judge, report: &'a BugReport, config: ExploreConfig) -> Self {
        Self {
            device,
            judge,
            report,
            config,
            prompts: PromptSet::default(),
            recorder: None,
            cancel: CancelToken::default(),
        }
    }

    pub fn prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn recorder(mut self, recorder: &'a mut RunRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run the search to a terminal outcome
    pub fn run(mut self) -> Result<ExploreReport, ExploreError> {
        self.config.validate()?;
        info!(
            package = %self.report.package,
            device = %self.device.source_type(),
            threshold_a = self.config.threshold_a,
            threshold_k = self.config.threshold_k,
            max_step = self.config.max_step,
            max_transition = self.config.max_transition,
            "starting exploration"
        );

        let mut p = Progress {
            tree: SearchTree::new(),
            frontier: Frontier::new(self.config.threshold_k),
            backtracker: Backtracker::new(self.config.restore_tolerance, self.config.restore_attempts),
            rounds: 0,
            transitions: 0,
            started: Instant::now(),
        };

        let outcome = match self.initialize(&mut p) {
            Ok(()) => self.search(&mut p)?,
            Err(e) => {
                warn!(error = %e, "could not capture the initial state");
                Outcome::Fatal(format!("initial state: {}", e))
            }
        };
        self.finish(&mut p, &outcome);

        Ok(ExploreReport {
            outcome,
            tree: p.tree,
            rounds: p.rounds,
            transitions: p.transitions,
            elapsed: p.started.elapsed(),
        })
    }

    fn initialize(&mut self, p: &mut Progress) -> Result<(), DeviceError> {
        self.set_state("initializing");
        let state = self.device.capture()?;
        let handle = self.device.snapshot()?;
        let root = p.tree.add_root(state, handle).map_err(|e| DeviceError::Emulator(e.to_string()))?;
        p.backtracker.mark_live(root);
        p.frontier.replace([root]);
        info!(%root, screen = %p.tree.get(root).map(|n| n.state.foreground()).unwrap_or_default(), "root captured");

        let header = RunHeader {
            started_at: now(),
            bug: self.report.clone(),
            config: self.config.clone(),
            device: self.device.source_type(),
            root: self.node_record(&p.tree, root),
        };
        self.append(RecordEntry::RunStarted(header));
        Ok(())
    }

    fn exhausted(&self, p: &Progress) -> Option<Exhausted> {
        if p.transitions >= self.config.max_transition {
            return Some(Exhausted::Transitions);
        }
        if p.rounds >= self.config.max_step {
            return Some(Exhausted::Rounds);
        }
        if self.config.max_duration.is_some_and(|limit| p.started.elapsed() >= limit) {
            return Some(Exhausted::Time);
        }
        if p.frontier.is_empty() {
            return Some(Exhausted::SearchSpace);
        }
        None
    }

    fn search(&mut self, p: &mut Progress) -> Result<Outcome, ExploreError> {
        loop {
            if let Some(reason) = self.exhausted(p) {
                info!(rounds = p.rounds, transitions = p.transitions, %reason, "stopping");
                return Ok(Outcome::BudgetExhausted(reason));
            }
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            p.rounds += 1;
            let mut rec = RoundRecord {
                round: p.rounds,
                frontier_before: p.frontier.ids().to_vec(),
                ..Default::default()
            };
            info!(round = p.rounds, frontier = ?p.frontier.ids(), transitions = p.transitions, "round started");

            let stop = self.round(p, &mut rec)?;
            rec.frontier_after = p.frontier.ids().to_vec();
            rec.transitions = p.transitions;
            self.append(RecordEntry::Round(rec));

            if let Some(outcome) = stop {
                return Ok(outcome);
            }
        }
    }

    /// Run one round; `Some` ends the search. A round that stops before
    /// its advance phase is marked partial.
    fn round(&mut self, p: &mut Progress, rec: &mut RoundRecord) -> Result<Option<Outcome>, ExploreError> {
        rec.partial = true;
        self.set_state(&format!("round {} expand", rec.round));
        let mut expansions = self.expand(p, rec)?;
        if p.all_failed(&rec.frontier_before) {
            rec.expansions = expansions.into_iter().map(|x| x.record).collect();
            return Ok(Some(self.all_failed(rec.round)));
        }
        if self.cancel.is_cancelled() {
            rec.expansions = expansions.into_iter().map(|x| x.record).collect();
            return Ok(Some(Outcome::Cancelled));
        }

        self.set_state(&format!("round {} filter", rec.round));
        self.filter(p, &mut expansions);
        let committed = self.commit(p, rec, &expansions);
        rec.expansions = expansions.into_iter().map(|x| x.record).collect();
        let (children, success) = committed?;
        if let Some(outcome) = success {
            return Ok(Some(outcome));
        }
        if p.all_failed(&rec.frontier_before) {
            return Ok(Some(self.all_failed(rec.round)));
        }
        if self.cancel.is_cancelled() {
            return Ok(Some(Outcome::Cancelled));
        }

        self.set_state(&format!("round {} prune", rec.round));
        let claimed = self.prune(p, rec, children)?;
        if self.cancel.is_cancelled() {
            return Ok(Some(Outcome::Cancelled));
        }

        self.set_state(&format!("round {} advance", rec.round));
        rec.partial = false;
        self.advance(p, rec, &claimed)
    }

    fn all_failed(&self, round: usize) -> Outcome {
        warn!(round, "every frontier node failed");
        Outcome::Fatal(format!("every frontier node failed in round {}", round))
    }

    /// Restore each frontier node, enumerate its actions and trial-execute them
    fn expand(&mut self, p: &mut Progress, rec: &mut RoundRecord) -> Result<Vec<Expansion>, ExploreError> {
        let enumerator = ActionEnumerator::new(self.config.global_actions.clone(), self.config.ignored_packages.clone());
        let mut expansions = Vec::new();

        for node in p.frontier.ids().to_vec() {
            if let Err(e) = p.make_live(self.device, rec, node, None) {
                record_error(rec, Some(node), None, &e);
                p.retire(self.device, rec, node, NodeStatus::Failed, "restore failed")?;
                continue;
            }
            let Some(baseline) = p.tree.get(node).map(|n| n.state.clone()) else {
                continue;
            };

            let actions = match enumerator.enumerate(&baseline) {
                Ok(actions) => actions,
                Err(e) => {
                    record_error(rec, Some(node), None, &e);
                    p.retire(self.device, rec, node, NodeStatus::Failed, "enumeration failed")?;
                    continue;
                }
            };
            let mut record = ExpansionRecord {
                node,
                candidates: Vec::new(),
                inputs: Vec::new(),
                filter: None,
                chosen: Vec::new(),
            };
            let actions = self.synthesize_inputs(&p.tree, node, actions, &mut record);
            debug!(%node, actions = actions.len(), "trial executing candidates");

            let mut candidates: Vec<Candidate> = Vec::new();
            let mut failed = false;
            for action in actions {
                if let Err(e) = p.make_live(self.device, rec, node, Some(&action)) {
                    record_error(rec, Some(node), Some(&action), &e);
                    p.retire(self.device, rec, node, NodeStatus::Failed, "restore between trials failed")?;
                    failed = true;
                    break;
                }
                p.backtracker.invalidate();
                match self.device.execute(&action) {
                    Ok(after) => {
                        let effect = record_effect(&baseline, &after);
                        candidates.push(Candidate {
                            index: candidates.len(),
                            action,
                            effect,
                        });
                    }
                    Err(e) => record_error(rec, Some(node), Some(&action), &e),
                }
            }
            if failed {
                continue;
            }

            record.candidates = candidates
                .iter()
                .map(|c| CandidateRecord {
                    index: c.index,
                    action: c.action.clone(),
                    description: c.action.to_string(),
                    effect: c.effect.clone(),
                })
                .collect();
            expansions.push(Expansion { node, candidates, record });
        }
        Ok(expansions)
    }

    /// Fill in values for text-input actions
    fn synthesize_inputs(
        &self,
        tree: &SearchTree,
        node: NodeId,
        mut actions: Vec<Action>,
        record: &mut ExpansionRecord,
    ) -> Vec<Action> {
        let pending: Vec<usize> = (0..actions.len()).filter(|&i| actions[i].needs_input()).collect();
        if pending.is_empty() {
            return actions;
        }

        let synth = InputSynthesizer::new(&self.prompts, self.report, &self.config.default_input_text);
        let requests: Vec<JudgeRequest> = pending.iter().map(|&i| synth.request(tree, node, &actions[i])).collect();
        let judgments = judge_all(
            self.judge,
            &requests,
            &self.policy(),
            &self.prompts.strict_suffix(Purpose::Input),
            self.config.llm_concurrency,
            |_, value| InputSynthesizer::parse(value),
        );

        for ((&i, request), judgment) in pending.iter().zip(&requests).zip(&judgments) {
            let (text, fallback) = synth.resolve(judgment);
            if fallback {
                warn!(%node, action = %actions[i], "no input suggestion, using the default text");
            }
            actions[i] = actions[i].with_input(text.clone());
            record.inputs.push(exchange(Some(node), request, judgment, Some(Value::String(text))));
        }
        actions
    }

    /// First-stage filter for every expanded node, judged concurrently
    fn filter(&self, p: &Progress, expansions: &mut [Expansion]) {
        let filter = ActionFilter::new(&self.prompts, self.report, self.config.threshold_a, self.config.tie_break);
        let judged: Vec<usize> = (0..expansions.len()).filter(|&i| !expansions[i].candidates.is_empty()).collect();
        let requests: Vec<JudgeRequest> = judged
            .iter()
            .map(|&i| filter.request(&p.tree, expansions[i].node, &expansions[i].candidates))
            .collect();
        let counts: Vec<usize> = judged.iter().map(|&i| expansions[i].candidates.len()).collect();

        let judgments = judge_all(
            self.judge,
            &requests,
            &self.policy(),
            &self.prompts.strict_suffix(Purpose::Filter),
            self.config.llm_concurrency,
            |i, value| filter.parse(value, counts[i]),
        );

        for ((&i, request), judgment) in judged.iter().zip(&requests).zip(&judgments) {
            let x = &mut expansions[i];
            let selection = filter.select(&x.candidates, judgment);
            if selection.fallback {
                warn!(node = %x.node, "filter judgment unusable, using the fallback ordering");
            }
            info!(node = %x.node, candidates = x.candidates.len(), chosen = ?selection.chosen, "filtered");
            x.record.filter = Some(exchange(Some(x.node), request, judgment, Some(serde_json::json!(selection.chosen))));
            x.record.chosen = selection.chosen;
        }
    }

    /// Commit the chosen actions for real, one child per success
    fn commit(
        &mut self,
        p: &mut Progress,
        rec: &mut RoundRecord,
        expansions: &[Expansion],
    ) -> Result<(Vec<NodeId>, Option<Outcome>), ExploreError> {
        let mut children = Vec::new();

        'nodes: for x in expansions {
            for &index in &x.record.chosen {
                if p.transitions >= self.config.max_transition {
                    info!(transitions = p.transitions, "action budget reached during commit");
                    break 'nodes;
                }
                let Some(candidate) = x.candidates.get(index) else {
                    continue;
                };
                let action = candidate.action.clone();

                if let Err(e) = p.make_live(self.device, rec, x.node, Some(&action)) {
                    record_error(rec, Some(x.node), Some(&action), &e);
                    p.retire(self.device, rec, x.node, NodeStatus::Failed, "restore before commit failed")?;
                    continue 'nodes;
                }

                p.transitions += 1;
                p.backtracker.invalidate();
                let state = match self.device.execute(&action) {
                    Ok(state) => state,
                    Err(e) => {
                        record_error(rec, Some(x.node), Some(&action), &e);
                        continue;
                    }
                };
                let handle = match self.device.snapshot() {
                    Ok(handle) => handle,
                    Err(e) => {
                        record_error(rec, Some(x.node), Some(&action), &e);
                        continue;
                    }
                };

                let effect = match p.tree.get(x.node) {
                    Some(parent) => record_effect(&parent.state, &state),
                    None => continue,
                };
                let child = p.tree.add_child(x.node, action, effect, state, handle, rec.round)?;
                p.backtracker.mark_live(child);
                rec.created.push(self.node_record(&p.tree, child));
                info!(parent = %x.node, %child, action = %candidate.action, "committed");
                children.push(child);

                let crash = p.tree.get(child).filter(|n| crashed(&n.state)).and_then(|n| n.state.crash.clone());
                if let Some(signature) = crash {
                    p.set_status(rec, child, NodeStatus::Success, format!("app crashed: {}", signature))?;
                    info!(%child, %signature, "crash observed, bug reproduced");
                    return Ok((
                        children,
                        Some(Outcome::Success {
                            node: child,
                            actions: p.tree.actions(child),
                        }),
                    ));
                }
            }
        }
        Ok((children, None))
    }

    /// Drop revisits and duplicates, evaluate the rest, and install the next
    /// frontier. Returns the frontier members claimed complete.
    fn prune(&mut self, p: &mut Progress, rec: &mut RoundRecord, children: Vec<NodeId>) -> Result<Vec<NodeId>, ExploreError> {
        let mut survivors = Vec::new();
        for child in children {
            let reason = match (p.tree.revisits_ancestor(child), p.tree.duplicate_of(child)) {
                (Some(ancestor), _) => format!("revisits {}", ancestor),
                (None, Some(original)) => format!("duplicates {}", original),
                (None, None) => {
                    survivors.push(child);
                    continue;
                }
            };
            p.retire(self.device, rec, child, NodeStatus::Pruned, reason)?;
        }
        if survivors.is_empty() {
            p.frontier.replace(std::iter::empty());
            return Ok(Vec::new());
        }

        let evaluator = PathEvaluator::new(&self.prompts, self.report, self.config.threshold_k, self.config.tie_break);
        let request = evaluator.request(&p.tree, &survivors);
        let judgment = judge_with_retry(
            self.judge,
            &request,
            &self.policy(),
            &self.prompts.strict_suffix(Purpose::Evaluate),
            |value| evaluator.parse(value, survivors.len()),
        );
        let evaluation = evaluator.decide(&p.tree, &survivors, &judgment);
        if evaluation.fallback {
            warn!(round = rec.round, "evaluation judgment unusable, using the fallback ordering");
        }
        rec.evaluation = Some(exchange(None, &request, &judgment, None));

        for id in &evaluation.pruned {
            p.retire(self.device, rec, *id, NodeStatus::Pruned, "not selected by the evaluator")?;
        }
        p.frontier.replace(evaluation.frontier.iter().copied());
        info!(
            round = rec.round,
            frontier = ?p.frontier.ids(),
            pruned = evaluation.pruned.len(),
            claimed = ?evaluation.claimed,
            "frontier updated"
        );
        Ok(evaluation.claimed)
    }

    /// Validate claimed paths; the first confirmed one in frontier order wins
    fn advance(&mut self, p: &mut Progress, rec: &mut RoundRecord, claimed: &[NodeId]) -> Result<Option<Outcome>, ExploreError> {
        if claimed.is_empty() {
            return Ok(None);
        }
        let validator = SuccessValidator::new(&self.prompts, self.report);
        let requests: Vec<JudgeRequest> = claimed.iter().map(|id| validator.request(&p.tree, *id)).collect();
        let judgments = judge_all(
            self.judge,
            &requests,
            &self.policy(),
            &self.prompts.strict_suffix(Purpose::Validate),
            self.config.llm_concurrency,
            |_, value| SuccessValidator::parse(value),
        );

        let mut confirmed = None;
        for ((id, request), judgment) in claimed.iter().zip(&requests).zip(&judgments) {
            rec.validations.push(exchange(Some(*id), request, judgment, None));
            if confirmed.is_none() && judgment.value == Some(true) {
                confirmed = Some(*id);
            }
        }

        let Some(node) = confirmed else {
            debug!(claimed = claimed.len(), "no claimed path was confirmed");
            return Ok(None);
        };
        p.set_status(rec, node, NodeStatus::Success, "validated as reproducing the bug")?;
        info!(%node, "bug reproduced");
        Ok(Some(Outcome::Success {
            node,
            actions: p.tree.actions(node),
        }))
    }

    /// Release handles, write reports, and close the record
    fn finish(&mut self, p: &mut Progress, outcome: &Outcome) {
        let keep = match outcome {
            Outcome::Success { node, .. } => Some(*node),
            _ => None,
        };
        for (node, e) in p.backtracker.release_all_except(self.device, &p.tree, keep) {
            warn!(%node, error = %e, "could not release snapshot");
        }

        if let (Some(node), Some(recorder)) = (keep, self.recorder.as_deref()) {
            if let Err(e) = recorder.write_reproduction(self.report, &p.tree, node) {
                warn!(error = %e, "could not write the reproduction report");
            }
        }

        let trailer = RunTrailer {
            finished_at: now(),
            outcome: outcome.name().to_string(),
            detail: outcome.detail(),
            rounds: p.rounds,
            transitions: p.transitions,
            elapsed_ms: p.started.elapsed().as_millis() as u64,
            success: keep,
            actions: keep.map(|node| p.tree.actions(node)).unwrap_or_default(),
        };
        self.append(RecordEntry::RunFinished(trailer));
        self.set_state(outcome.name());
        info!(outcome = outcome.name(), detail = %outcome.detail(), rounds = p.rounds, transitions = p.transitions, "exploration finished");
    }

    fn policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    fn node_record(&self, tree: &SearchTree, id: NodeId) -> NodeRecord {
        let Some(node) = tree.get(id) else {
            return NodeRecord {
                id,
                parent: None,
                action: None,
                effect: String::new(),
                depth: 0,
                round: 0,
                foreground: String::new(),
                digest: String::new(),
                snapshot: String::new(),
                screen: None,
            };
        };
        let screen = self.recorder.as_deref().and_then(|r| match r.save_screen(id, &node.state.screenshot.png) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(%id, error = %e, "could not save screenshot");
                None
            }
        });
        NodeRecord {
            id,
            parent: node.parent,
            action: node.action.clone(),
            effect: node.effect.summary(),
            depth: node.depth,
            round: node.round,
            foreground: node.state.foreground(),
            digest: node.state.screenshot.digest.clone(),
            snapshot: node.snapshot.to_string(),
            screen,
        }
    }

    fn append(&mut self, entry: RecordEntry) {
        if let Some(recorder) = self.recorder.as_deref_mut() {
            if let Err(e) = recorder.append(&entry) {
                warn!(error = %e, "could not append to the run record");
            }
        }
    }

    fn set_state(&self, state: &str) {
        if let Some(recorder) = self.recorder.as_deref() {
            if let Err(e) = recorder.set_state(state) {
                warn!(error = %e, "could not update the run state file");
            }
        }
    }
}
