//! Writer side of a run directory.
//!
//! Layout:
//! - `record.jsonl` - one JSON entry per line, flushed whole
//! - `state` - `"<timestamp> <state>"`, replaced atomically
//! - `screens/node-<id>.png` - node screenshots
//! - `reproduction.md` / `reproduction.json` - the successful action sequence
//! - `token_usage.json` - LLM token accounting

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::types::{RecordEntry, RecordResult};
use crate::bug_report::BugReport;
use crate::explore::tree::{NodeId, SearchTree};

pub const RECORD_FILE: &str = "record.jsonl";
pub const STATE_FILE: &str = "state";
pub const SCREENS_DIR: &str = "screens";
pub const REPRODUCTION_MD: &str = "reproduction.md";
pub const REPRODUCTION_JSON: &str = "reproduction.json";
pub const TOKEN_USAGE_FILE: &str = "token_usage.json";

#[derive(Debug)]
pub struct RunRecorder {
    dir: PathBuf,
    record: File,
}

impl RunRecorder {
    /// Open (or continue) the record in `dir`
    pub fn create(dir: impl Into<PathBuf>) -> RecordResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SCREENS_DIR))?;
        let record = OpenOptions::new().create(true).append(true).open(dir.join(RECORD_FILE))?;
        Ok(Self { dir, record })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one entry as a single line and flush it
    pub fn append(&mut self, entry: &RecordEntry) -> RecordResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.record.write_all(line.as_bytes())?;
        self.record.flush()?;
        Ok(())
    }

    /// Replace the state file through a temporary file and rename
    pub fn set_state(&self, state: &str) -> RecordResult<()> {
        let tmp = self.dir.join(format!(".{}.tmp", STATE_FILE));
        fs::write(&tmp, format!("{} {}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), state))?;
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        debug!(state, "run state updated");
        Ok(())
    }

    /// Store a node screenshot; returns its path relative to the run directory
    pub fn save_screen(&self, node: NodeId, png: &[u8]) -> RecordResult<String> {
        let relative = format!("{}/node-{}.png", SCREENS_DIR, node.0);
        fs::write(self.dir.join(&relative), png)?;
        Ok(relative)
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> RecordResult<()> {
        fs::write(self.dir.join(name), serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Write the reproduction report for the success node
    pub fn write_reproduction(&self, report: &BugReport, tree: &SearchTree, node: NodeId) -> RecordResult<()> {
        let path = tree.path(node);
        let mut steps = Vec::new();
        let mut md = String::new();

        md.push_str(&format!(
            "# Reproduction: {}\n\n",
            report.title.as_deref().unwrap_or(report.package.as_str())
        ));
        md.push_str(&format!("**Package:** {}\n\n", report.package));
        md.push_str("## Steps to reproduce\n\n");
        md.push_str(report.steps.trim());
        md.push_str("\n\n## Expected symptom\n\n");
        md.push_str(report.symptom.trim());
        md.push_str(&format!("\n\n## Explored path ({} steps)\n", path.len().saturating_sub(1)));

        for (index, id) in path.iter().enumerate() {
            let Some(n) = tree.get(*id) else { continue };
            let Some(action) = &n.action else { continue };
            md.push_str(&format!(
                "\n### Step {}\n\n- **Action:** {}\n- **Effect:** {}\n\n![step {}]({}/node-{}.png)\n",
                index,
                action,
                n.effect.summary(),
                index,
                SCREENS_DIR,
                id.0
            ));
            steps.push(serde_json::json!({
                "step": index,
                "node": id,
                "action": action,
                "description": action.to_string(),
                "effect": n.effect.summary(),
            }));
        }

        if let Some(last) = tree.get(node) {
            if let Some(crash) = &last.state.crash {
                md.push_str(&format!("\n## Crash\n\n```\n{}\n```\n", crash));
            }
        }

        fs::write(self.dir.join(REPRODUCTION_MD), md)?;
        self.write_json(
            REPRODUCTION_JSON,
            &serde_json::json!({
                "package": report.package,
                "success_node": node,
                "steps": steps,
            }),
        )
    }
}
