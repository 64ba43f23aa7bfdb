//! Running one exploration end to end and summarizing its result.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bug_report::BugReport;
use crate::config::ExploreConfig;
use crate::device::Device;
use crate::explore::{CancelToken, ExploreError, ExploreReport, Explorer, NodeId, Outcome};
use crate::llm::prompt::PromptSet;
use crate::llm::{ChatClient, Judge};
use crate::record::recorder::TOKEN_USAGE_FILE;
use crate::record::{RecordError, RunRecorder};
use crate::session::RunDir;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_BUDGET_EXHAUSTED: i32 = 2;
/// Bug report or configuration rejected before the search started
pub const EXIT_PREFLIGHT: i32 = 3;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to create run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Explore(#[from] ExploreError),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Explore(ExploreError::Config(_)) => EXIT_PREFLIGHT,
            _ => EXIT_FATAL,
        }
    }
}

/// Result of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// `success`, `budget_exhausted`, `fatal` or `cancelled`
    pub outcome: String,
    pub detail: String,
    pub rounds: usize,
    pub transitions: usize,
    pub nodes: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<NodeId>,
    /// Committed actions of the success path, in order
    pub actions: Vec<String>,
    pub run_dir: PathBuf,
    pub exit_code: i32,
}

impl RunSummary {
    pub fn new(report: &ExploreReport, run_dir: PathBuf) -> Self {
        let (success, actions) = match &report.outcome {
            Outcome::Success { node, actions } => (Some(*node), actions.iter().map(|a| a.to_string()).collect()),
            _ => (None, Vec::new()),
        };
        Self {
            outcome: report.outcome.name().to_string(),
            detail: report.outcome.detail(),
            rounds: report.rounds,
            transitions: report.transitions,
            nodes: report.tree.len(),
            elapsed_ms: report.elapsed.as_millis() as u64,
            success,
            actions,
            run_dir,
            exit_code: exit_code(&report.outcome),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }
}

pub fn exit_code(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Success { .. } => EXIT_SUCCESS,
        Outcome::BudgetExhausted(_) => EXIT_BUDGET_EXHAUSTED,
        Outcome::Fatal(_) => EXIT_FATAL,
        Outcome::Cancelled => EXIT_CANCELLED,
    }
}

/// Everything a run needs besides the device and the judge
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub report: BugReport,
    pub config: ExploreConfig,
    pub prompts: PromptSet,
    pub run_dir: RunDir,
    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn new(report: BugReport, config: ExploreConfig, run_dir: RunDir) -> Self {
        Self {
            report,
            config,
            prompts: PromptSet::default(),
            run_dir,
            cancel: CancelToken::default(),
        }
    }

    pub fn prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Explore with `judge` and record everything under the run directory.
///
/// When `usage` is given its token accounting is written next to the record.
pub fn run_exploration(
    device: &mut dyn Device,
    judge: &dyn Judge,
    usage: Option<&ChatClient>,
    options: &RunOptions,
) -> Result<RunSummary, RunError> {
    options.config.validate().map_err(ExploreError::from)?;

    let dir = &options.run_dir.dir;
    options
        .run_dir
        .init(&options.report, &options.config, &device.source_type())
        .map_err(|source| RunError::RunDir {
            path: dir.clone(),
            source,
        })?;
    let mut recorder = RunRecorder::create(dir)?;
    info!(run = %options.run_dir.id, dir = %dir.display(), "run directory ready");

    let report = Explorer::new(device, judge, &options.report, options.config.clone())
        .prompts(options.prompts.clone())
        .recorder(&mut recorder)
        .cancel_token(options.cancel.clone())
        .run()?;

    if let Some(client) = usage {
        let tokens = client.usage();
        info!(calls = tokens.total.calls, prompt_tokens = tokens.total.prompt_tokens, completion_tokens = tokens.total.completion_tokens, "token usage");
        if let Err(e) = recorder.write_json(TOKEN_USAGE_FILE, &tokens) {
            warn!(error = %e, "could not write token usage");
        }
    }

    Ok(RunSummary::new(&report, dir.clone()))
}
