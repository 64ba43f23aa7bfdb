//! Run directory management.
//!
//! Every exploration gets its own directory:
//! `<result_dir>/<package>/<YYYYmmdd_HHMMSS>/`, holding the run record,
//! screenshots, reports and a `.run.json` metadata file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::bug_report::BugReport;
use crate::config::ExploreConfig;

/// Metadata file written when a run directory is initialized
pub const RUN_METADATA_FILE: &str = ".run.json";

/// Directory holding one run's outputs
#[derive(Debug, Clone)]
pub struct RunDir {
    /// `<package>/<timestamp>`, unique within the result directory
    pub id: String,
    pub dir: PathBuf,
}

impl RunDir {
    /// Allocate a new directory for `package` under `base`.
    ///
    /// Two runs started within the same second get a numeric suffix.
    pub fn new(base: impl AsRef<Path>, package: &str) -> Self {
        let package = sanitize_name(package);
        let stamp = generate_timestamp_suffix();
        let parent = base.as_ref().join(&package);

        let mut name = stamp.clone();
        let mut n = 1;
        while parent.join(&name).exists() {
            n += 1;
            name = format!("{}_{}", stamp, n);
        }
        Self {
            id: format!("{}/{}", package, name),
            dir: parent.join(name),
        }
    }

    /// Use an existing directory as-is
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_timestamp_suffix);
        Self { id, dir }
    }

    /// Create the directory and write its metadata
    pub fn init(&self, report: &BugReport, config: &ExploreConfig, device: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
            "host": host,
            "package": report.package,
            "bug": report.title,
            "device": device,
            "config": config,
        });

        let metadata_path = self.dir.join(RUN_METADATA_FILE);
        fs::write(metadata_path, serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    /// Read back `.run.json`, if present
    pub fn metadata(&self) -> Option<Value> {
        let text = fs::read_to_string(self.dir.join(RUN_METADATA_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in paths
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// All run directories under `base`, optionally for one package, oldest first
pub fn list_runs(base: &Path, package: Option<&str>) -> io::Result<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let packages: Vec<PathBuf> = match package {
        Some(p) => vec![base.join(sanitize_name(p))],
        None => fs::read_dir(base)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
    };

    let mut runs = Vec::new();
    for dir in packages.into_iter().filter(|p| p.is_dir()) {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                runs.push(path);
            }
        }
    }
    runs.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("com.example.notes"), "com.example.notes");
        assert_eq!(sanitize_name("a/b\\c d"), "a_b_c_d");
    }

    #[test]
    fn test_run_dir_layout_and_metadata() {
        let base = tempfile::tempdir().unwrap();
        let run = RunDir::new(base.path(), "com.example.notes");
        assert!(run.id.starts_with("com.example.notes/"));
        assert!(run.dir.starts_with(base.path().join("com.example.notes")));

        let report = BugReport::new("com.example.notes", "1. open", "crash");
        run.init(&report, &ExploreConfig::default(), "sim").unwrap();
        let meta = run.metadata().unwrap();
        assert_eq!(meta["package"], "com.example.notes");
        assert_eq!(meta["device"], "sim");
        assert_eq!(meta["config"]["threshold_k"], 3);

        let again = RunDir::new(base.path(), "com.example.notes");
        assert_ne!(again.dir, run.dir);
    }

    #[test]
    fn test_list_runs_filters_by_package() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir_all(base.path().join("a.app/20260101_000000")).unwrap();
        fs::create_dir_all(base.path().join("a.app/20260102_000000")).unwrap();
        fs::create_dir_all(base.path().join("b.app/20260101_120000")).unwrap();

        assert_eq!(list_runs(base.path(), None).unwrap().len(), 3);
        let a = list_runs(base.path(), Some("a.app")).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a[0].ends_with("20260101_000000"));
        assert!(list_runs(&base.path().join("missing"), None).unwrap().is_empty());
    }
}
