//! Reader side of a run record. Safe to use while the run is still writing.

use std::fs;
use std::path::Path;

use tracing::warn;

use super::recorder::{RECORD_FILE, STATE_FILE};
use super::types::{RecordEntry, RecordResult, RoundRecord, RunHeader, RunTrailer};

/// Parsed content of a run directory
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    pub header: Option<RunHeader>,
    pub rounds: Vec<RoundRecord>,
    pub trailer: Option<RunTrailer>,
    /// Content of the `state` file, if present
    pub state: Option<String>,
}

/// Read every complete entry of `dir/record.jsonl`.
///
/// A trailing line without a newline is a write in progress and is ignored.
/// Any other unparseable line is skipped with a warning.
pub fn read_run(dir: &Path) -> RecordResult<RunLog> {
    let content = fs::read_to_string(dir.join(RECORD_FILE))?;
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => "",
    };

    let mut log = RunLog {
        state: fs::read_to_string(dir.join(STATE_FILE)).ok().map(|s| s.trim().to_string()),
        ..Default::default()
    };
    for (number, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordEntry>(line) {
            Ok(RecordEntry::RunStarted(header)) => log.header = Some(header),
            Ok(RecordEntry::Round(round)) => log.rounds.push(round),
            Ok(RecordEntry::RunFinished(trailer)) => log.trailer = Some(trailer),
            Err(e) => warn!(line = number + 1, error = %e, "skipping unreadable record line"),
        }
    }
    Ok(log)
}

impl RunLog {
    pub fn is_finished(&self) -> bool {
        self.trailer.is_some()
    }

    /// Human-readable multi-line summary
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if let Some(h) = &self.header {
            lines.push(format!("Bug:        {}", h.bug.title.as_deref().unwrap_or(&h.bug.package)));
            lines.push(format!("Package:    {}", h.bug.package));
            lines.push(format!("Device:     {}", h.device));
            lines.push(format!("Started:    {}", h.started_at));
            lines.push(format!(
                "Parameters: threshold_a={} threshold_k={} max_step={} max_transition={}",
                h.config.threshold_a, h.config.threshold_k, h.config.max_step, h.config.max_transition
            ));
        }
        lines.push(format!("Rounds:     {}", self.rounds.len()));
        for round in &self.rounds {
            lines.push(format!(
                "  round {:>2}: {} expanded, {} created, frontier {:?}, {} error(s){}",
                round.round,
                round.expansions.len(),
                round.created.len(),
                round.frontier_after.iter().map(|n| n.0).collect::<Vec<_>>(),
                round.errors.len(),
                if round.partial { " (partial)" } else { "" }
            ));
        }
        match &self.trailer {
            Some(t) => {
                lines.push(format!("Outcome:    {} ({})", t.outcome, t.detail));
                lines.push(format!("Actions:    {} committed in {} ms", t.transitions, t.elapsed_ms));
                for (i, action) in t.actions.iter().enumerate() {
                    lines.push(format!("  {}. {}", i + 1, action));
                }
            }
            None => lines.push(format!(
                "Outcome:    (in progress{})",
                self.state.as_deref().map(|s| format!(", {}", s)).unwrap_or_default()
            )),
        }
        lines.join("\n")
    }
}
