//! Text values for input fields, suggested by the model with a fixed fallback.

use serde_json::Value;

use super::action::Action;
use super::tree::{NodeId, SearchTree};
use crate::bug_report::BugReport;
use crate::llm::prompt::{PromptSet, format_history};
use crate::llm::{JudgeRequest, Judgment, Purpose, annotated_screenshot};

pub struct InputSynthesizer<'a> {
    prompts: &'a PromptSet,
    report: &'a BugReport,
    default_text: &'a str,
}

impl<'a> InputSynthesizer<'a> {
    pub fn new(prompts: &'a PromptSet, report: &'a BugReport, default_text: &'a str) -> Self {
        Self {
            prompts,
            report,
            default_text,
        }
    }

    /// Ask for a value for `action`'s field on `node`'s screen
    pub fn request(&self, tree: &SearchTree, node: NodeId, action: &Action) -> JudgeRequest {
        let history = format_history(&tree.history(node));
        let state = tree.get(node).map(|n| &n.state);
        let element = action
            .target
            .as_ref()
            .and_then(|key| state.and_then(|s| s.element(key)));

        let mut field = format!("<{}", element.map(|e| e.kind.as_str()).unwrap_or("EditText"));
        if let Some(e) = element {
            for (name, value) in [("resource-id", &e.resource_id), ("hint", &e.hint), ("old-text", &e.text)] {
                if !value.is_empty() {
                    field.push_str(&format!(" {}=\"{}\"", name, value));
                }
            }
        }
        field.push_str(" />");

        let mut vars = self.report.prompt_vars().to_vec();
        vars.extend([("history", history.as_str()), ("field", field.as_str())]);
        let request = JudgeRequest::new(Purpose::Input, self.prompts.render(Purpose::Input, &vars));

        let marks: Vec<_> = action.target.iter().map(|k| (0, k.bounds)).collect();
        match state.and_then(|s| annotated_screenshot(s, &marks)) {
            Some(image) => request.with_image(image),
            None => request,
        }
    }

    /// Read `{"input": ...}`; numbers are accepted as text
    pub fn parse(value: &Value) -> Result<String, String> {
        let text = match value.get("input") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err("missing string field \"input\"".to_string()),
        };
        if text.trim().is_empty() {
            return Err("\"input\" is empty".to_string());
        }
        Ok(text)
    }

    /// The suggested value, or the default text when no attempt produced one
    pub fn resolve(&self, judgment: &Judgment<String>) -> (String, bool) {
        match &judgment.value {
            Some(text) => (text.clone(), false),
            None => (self.default_text.to_string(), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, Canvas, Screenshot, SnapshotHandle, UiElement, UiState};
    use crate::explore::action::ActionKind;
    use serde_json::json;

    #[test]
    fn test_parse_input() {
        assert_eq!(InputSynthesizer::parse(&json!({"input": "Groceries"})).unwrap(), "Groceries");
        assert_eq!(InputSynthesizer::parse(&json!({"input": 42})).unwrap(), "42");
        assert!(InputSynthesizer::parse(&json!({"input": "  "})).is_err());
        assert!(InputSynthesizer::parse(&json!({"text": "x"})).is_err());
    }

    #[test]
    fn test_request_describes_the_field_and_falls_back() {
        let field = UiElement::new("EditText", Bounds::new(10, 40, 170, 64))
            .resource_id("com.example:id/title")
            .hint("Title")
            .editable();
        let state = UiState {
            elements: vec![field],
            screenshot: Screenshot::from_png(Canvas::with_color(180, 320, [250, 250, 250]).to_png().unwrap()).unwrap(),
            package: "com.example".into(),
            activity: None,
            crash: None,
        };
        let key = state.keys()[0].clone();
        let mut tree = SearchTree::new();
        let root = tree.add_root(state, SnapshotHandle("s".into())).unwrap();

        let prompts = PromptSet::default();
        let report = BugReport::new("com.example", "1. create a note titled Groceries", "crash");
        let synth = InputSynthesizer::new(&prompts, &report, "test");
        let action = Action::on(ActionKind::TextInput(None), key, "Title");
        let request = synth.request(&tree, root, &action);
        assert!(request.prompt.contains("<EditText resource-id=\"com.example:id/title\" hint=\"Title\" />"));
        assert_eq!(request.images.len(), 1);

        let none = Judgment::<String> {
            value: None,
            attempts: Vec::new(),
        };
        assert_eq!(synth.resolve(&none), ("test".to_string(), true));
    }
}
