//! Bug report input: the target app, reproduction steps and expected symptom.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BugReportError {
    #[error("bug report {0} not found")]
    NotFound(PathBuf),
    #[error("failed to read bug report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bug report {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bug report {path} has an empty \"{field}\" field")]
    MissingField { path: PathBuf, field: &'static str },
}

/// Immutable description of the bug to reproduce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    /// Package id of the app under test
    pub package: String,
    /// Free-text steps to reproduce
    pub steps: String,
    /// Free-text description of what the bug looks like
    pub symptom: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Activity to launch instead of the default launcher activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

impl BugReport {
    pub fn new(package: impl Into<String>, steps: impl Into<String>, symptom: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            steps: steps.into(),
            symptom: symptom.into(),
            title: None,
            activity: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Placeholder values shared by every prompt
    pub fn prompt_vars(&self) -> [(&'static str, &str); 3] {
        [
            ("package", self.package.as_str()),
            ("steps", self.steps.as_str()),
            ("symptom", self.symptom.as_str()),
        ]
    }
}

/// Loads bug reports by id from a directory of `<id>.json` files
#[derive(Debug, Clone)]
pub struct BugReportReader {
    dir: PathBuf,
}

impl BugReportReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read `id`, which is either a path to a JSON file or an id under the directory
    pub fn read(&self, id: &str) -> Result<BugReport, BugReportError> {
        let direct = Path::new(id);
        let path = if direct.is_file() {
            direct.to_path_buf()
        } else {
            self.dir.join(format!("{}.json", id))
        };
        if !path.is_file() {
            return Err(BugReportError::NotFound(path));
        }

        let content = fs::read_to_string(&path).map_err(|source| BugReportError::Read {
            path: path.clone(),
            source,
        })?;
        let report: BugReport = serde_json::from_str(&content).map_err(|source| BugReportError::Parse {
            path: path.clone(),
            source,
        })?;

        for (field, value) in [
            ("package", &report.package),
            ("steps", &report.steps),
            ("symptom", &report.symptom),
        ] {
            if value.trim().is_empty() {
                return Err(BugReportError::MissingField { path, field });
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_by_id_and_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "notes-12.json",
            r#"{"package": "org.notes", "steps": "1. add a note\n2. rotate", "symptom": "crash", "title": "Rotate crash"}"#,
        );
        let reader = BugReportReader::new(dir.path());

        let by_id = reader.read("notes-12").unwrap();
        assert_eq!(by_id.package, "org.notes");
        assert_eq!(by_id.title.as_deref(), Some("Rotate crash"));
        assert_eq!(by_id.activity, None);

        let by_path = BugReportReader::new("/nonexistent").read(path.to_str().unwrap()).unwrap();
        assert_eq!(by_path, by_id);
    }

    #[test]
    fn test_missing_file_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.json", "{\"package\": ");
        let reader = BugReportReader::new(dir.path());

        assert!(matches!(reader.read("absent"), Err(BugReportError::NotFound(_))));
        assert!(matches!(reader.read("broken"), Err(BugReportError::Parse { .. })));
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.json", r#"{"package": "org.x", "steps": "  ", "symptom": "crash"}"#);
        let err = BugReportReader::new(dir.path()).read("b").unwrap_err();
        assert!(matches!(err, BugReportError::MissingField { field: "steps", .. }));
    }
}
