//! droid-repro - reproduce reported Android app bugs by LLM-guided search.
//!
//! This crate provides:
//! - A device abstraction over a running emulator, with snapshot/restore
//! - Visual effect recording between UI states
//! - A beam search whose two pruning stages are judged by an LLM
//! - Run records that can be read back and summarized
//!
//! # Example
//!
//! ```rust,no_run
//! use droid_repro::bug_report::BugReportReader;
//! use droid_repro::config::{self, ExploreConfig};
//! use droid_repro::device::AdbDevice;
//! use droid_repro::explore::Explorer;
//! use droid_repro::llm::{ChatClient, ChatConfig};
//!
//! let report = BugReportReader::new("bugs").read("notes-42").unwrap();
//! let mut device = AdbDevice::new(config::get().device.clone(), report.package.clone());
//! device.connect().unwrap();
//! device.launch(report.activity.as_deref()).unwrap();
//!
//! let judge = ChatClient::new(ChatConfig::default());
//! let result = Explorer::new(&mut device, &judge, &report, ExploreConfig::default()).run().unwrap();
//! println!("{}", result.outcome.detail());
//! ```

pub mod bug_report;
pub mod config;
pub mod device;
pub mod explore;
pub mod llm;
pub mod record;
pub mod runner;
pub mod session;

// Re-export the types most callers need
pub use bug_report::{BugReport, BugReportError, BugReportReader};
pub use config::{ConfigError, ExploreConfig, TieBreak};
pub use device::{AdbDevice, Device, DeviceError, DeviceResult, SimulatedDevice, UiState};
pub use explore::{CancelToken, ExploreError, ExploreReport, Explorer, Outcome};
pub use llm::{ChatClient, ChatConfig, Judge, LlmError, PromptSet, ScriptedJudge};
pub use record::{RunLog, RunRecorder, read_run};
pub use runner::{RunError, RunOptions, RunSummary, run_exploration};
pub use session::{RunDir, list_runs};
