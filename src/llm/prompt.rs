//! Prompt templates for each judgment purpose.
//!
//! Templates use `{name}` placeholders. Any template can be replaced by a
//! file of the same name (`filter.txt`, `evaluate.txt`, `validate.txt`,
//! `input.txt`, `strict.txt`) in a prompt directory.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::info;

use super::judge::Purpose;
use crate::config::ConfigError;
use crate::explore::action::Action;
use crate::explore::effect::VisualEffect;

/// Number of newest history steps described in full
pub const DETAILED_STEPS: usize = 3;
/// Element labels listed per change kind in a detailed step
const DETAIL_ITEMS: usize = 5;

const GUIDANCE: &str = "Extra guidance:
1. App installation and the first launch are not part of the history.
2. Initialization steps are often needed first: granting permissions, closing update dialogs, skipping onboarding, consenting to data collection.
3. A freshly installed app has no data, so data named in the steps usually has to be created.
4. If the last reproduction step does not show the bug, pressing back may be required.";

const FILTER_TEMPLATE: &str = "We are exploring paths that reproduce a bug in the Android app {package}.

Steps to reproduce:
{steps}

Expected symptom:
{symptom}

Path so far:
{history}

Each candidate below was tried from the current screen and rolled back. Candidates that target a widget are boxed in red in the attached screenshot and labelled with their number.

{candidates}

{guidance}

Rank the candidates that most plausibly move the app toward the bug, best first. Include at most {limit}. If none look useful, still name the single most plausible one.
Answer with a JSON object: {schema}";

const EVALUATE_TEMPLATE: &str = "We are exploring paths that reproduce a bug in the Android app {package}.

Steps to reproduce:
{steps}

Expected symptom:
{symptom}

There are {count} exploration paths in progress:

{paths}

{guidance}
5. Paths that loop back to an earlier screen are not worth continuing.

For each path decide whether it is worth continuing and whether it has already completed the steps to reproduce. If several paths behave the same, keep only the most promising one. Keep at most {limit} promising paths.
Answer with a JSON object: {schema}";

const VALIDATE_TEMPLATE: &str = "Decide whether this path in the Android app {package} has definitively reproduced the bug.

Steps to reproduce:
{steps}

Expected symptom:
{symptom}

Path:
{history}

The attached screenshot shows the screen reached at the end of the path. Confirm only if every step was performed and the screen shows the expected symptom.
Answer with a JSON object: {schema}";

const INPUT_TEMPLATE: &str = "We are reproducing a bug in the Android app {package}.

Steps to reproduce:
{steps}

Path so far:
{history}

The text field boxed in red in the attached screenshot is about to receive input:
{field}

Suggest the text to type so that the reproduction can continue. Prefer values named in the steps.
Answer with a JSON object: {schema}";

const STRICT_TEMPLATE: &str = "IMPORTANT: your previous answer could not be used. Reply with exactly one JSON object matching {schema} and nothing else: no prose, no markdown.";

/// Response shape expected for `purpose`
pub fn schema(purpose: Purpose) -> &'static str {
    match purpose {
        Purpose::Filter => r#"{"ranked": [candidate numbers, best first]}"#,
        Purpose::Evaluate => r#"{"promising": [path ids], "completed": [path ids]}"#,
        Purpose::Validate => r#"{"reproduced": true | false}"#,
        Purpose::Input => r#"{"input": "text to type"}"#,
    }
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub filter: String,
    pub evaluate: String,
    pub validate: String,
    pub input: String,
    pub strict: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            filter: FILTER_TEMPLATE.to_string(),
            evaluate: EVALUATE_TEMPLATE.to_string(),
            validate: VALIDATE_TEMPLATE.to_string(),
            input: INPUT_TEMPLATE.to_string(),
            strict: STRICT_TEMPLATE.to_string(),
        }
    }
}

impl PromptSet {
    /// Defaults overridden by whichever template files exist in `dir`
    pub fn from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for (name, slot) in [
            ("filter.txt", &mut set.filter),
            ("evaluate.txt", &mut set.evaluate),
            ("validate.txt", &mut set.validate),
            ("input.txt", &mut set.input),
            ("strict.txt", &mut set.strict),
        ] {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            *slot = fs::read_to_string(&path).map_err(|source| ConfigError::Prompt {
                path: path.clone(),
                source,
            })?;
            info!(template = %path.display(), "loaded prompt override");
        }
        Ok(set)
    }

    pub fn template(&self, purpose: Purpose) -> &str {
        match purpose {
            Purpose::Filter => &self.filter,
            Purpose::Evaluate => &self.evaluate,
            Purpose::Validate => &self.validate,
            Purpose::Input => &self.input,
        }
    }

    /// Render the template for `purpose`; `{schema}` and `{guidance}` are always available
    pub fn render(&self, purpose: Purpose, vars: &[(&str, &str)]) -> String {
        let mut all: Vec<(&str, &str)> = vec![("schema", schema(purpose)), ("guidance", GUIDANCE)];
        all.extend_from_slice(vars);
        render(self.template(purpose), &all)
    }

    /// Stricter format instruction appended on retries
    pub fn strict_suffix(&self, purpose: Purpose) -> String {
        render(&self.strict, &[("schema", schema(purpose))])
    }
}

/// Replace `{name}` placeholders; unknown placeholders are left as is
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let replaced = tail.find('}').and_then(|end| {
            let name = &tail[1..end];
            vars.iter().find(|(k, _)| *k == name).map(|(_, v)| (end, *v))
        });
        match replaced {
            Some((end, value)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Describe a path: the newest steps in detail, earlier ones as one-liners
pub fn format_history(history: &[(&Action, &VisualEffect)]) -> String {
    if history.is_empty() {
        return "(no actions yet, the app was just launched)".to_string();
    }
    let detailed_from = history.len().saturating_sub(DETAILED_STEPS);
    let mut out = String::new();
    for (i, (action, effect)) in history.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let description = if i >= detailed_from {
            effect.detail(DETAIL_ITEMS)
        } else {
            effect.summary()
        };
        let _ = write!(out, "Step {}: {}\n  -> {}", i + 1, action, description);
    }
    out
}
