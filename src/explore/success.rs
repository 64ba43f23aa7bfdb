//! Success detection: a crash is success by rule; paths the evaluator claims
//! complete are confirmed by a separate validation judgment.

use serde_json::Value;

use super::tree::{NodeId, SearchTree};
use crate::bug_report::BugReport;
use crate::device::UiState;
use crate::llm::judge::flag;
use crate::llm::prompt::{PromptSet, format_history};
use crate::llm::{JudgeRequest, Purpose, annotated_screenshot};

/// Whether `state` shows the app crashing
pub fn crashed(state: &UiState) -> bool {
    state.is_crashed()
}

pub struct SuccessValidator<'a> {
    prompts: &'a PromptSet,
    report: &'a BugReport,
}

impl<'a> SuccessValidator<'a> {
    pub fn new(prompts: &'a PromptSet, report: &'a BugReport) -> Self {
        Self { prompts, report }
    }

    /// Validation request for `node`, with its final screenshot attached
    pub fn request(&self, tree: &SearchTree, node: NodeId) -> JudgeRequest {
        let history = format_history(&tree.history(node));
        let mut vars = self.report.prompt_vars().to_vec();
        vars.push(("history", history.as_str()));
        let request = JudgeRequest::new(Purpose::Validate, self.prompts.render(Purpose::Validate, &vars));
        match tree.get(node).and_then(|n| annotated_screenshot(&n.state, &[])) {
            Some(image) => request.with_image(image),
            None => request,
        }
    }

    /// Read `{"reproduced": ...}`
    pub fn parse(value: &Value) -> Result<bool, String> {
        flag(value, "reproduced")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Canvas, Screenshot, SnapshotHandle};
    use serde_json::json;

    #[test]
    fn test_parse_accepts_yes_and_booleans() {
        assert_eq!(SuccessValidator::parse(&json!({"reproduced": "yes"})), Ok(true));
        assert_eq!(SuccessValidator::parse(&json!({"reproduced": false})), Ok(false));
        assert!(SuccessValidator::parse(&json!({"task_achieved": true})).is_err());
    }

    #[test]
    fn test_request_carries_history_and_screenshot() {
        let png = Canvas::with_color(90, 160, [1, 2, 3]).to_png().unwrap();
        let mut state = UiState {
            elements: Vec::new(),
            screenshot: Screenshot::from_png(png).unwrap(),
            package: "org.notes".into(),
            activity: None,
            crash: None,
        };
        assert!(!crashed(&state));
        state.crash = Some("java.lang.NullPointerException".into());
        assert!(crashed(&state));

        let mut tree = SearchTree::new();
        let root = tree.add_root(state, SnapshotHandle("s".into())).unwrap();
        let prompts = PromptSet::default();
        let report = BugReport::new("org.notes", "1. open the note", "the note is blank");
        let request = SuccessValidator::new(&prompts, &report).request(&tree, root);

        assert_eq!(request.purpose, Purpose::Validate);
        assert!(request.prompt.contains("the note is blank"));
        assert!(request.prompt.contains("no actions yet"));
        assert_eq!(request.images.len(), 1);
    }
}
