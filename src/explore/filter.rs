//! First-stage action filter: per node, keep the `threshold_a` trial
//! candidates most likely to move toward the bug.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde_json::Value;

use super::action::Action;
use super::effect::VisualEffect;
use super::tree::{NodeId, SearchTree};
use crate::bug_report::BugReport;
use crate::config::TieBreak;
use crate::llm::judge::index_list;
use crate::llm::prompt::{PromptSet, format_history};
use crate::llm::{JudgeRequest, Judgment, Purpose, annotated_screenshot};

/// Element labels listed per change kind in a candidate description
const CANDIDATE_DETAIL_ITEMS: usize = 4;

/// A trial-executed action and what it did
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub action: Action,
    pub effect: VisualEffect,
}

/// The filter's choice for one node
#[derive(Debug, Clone)]
pub struct Selection {
    /// Candidate indices to commit, best first, at most `threshold_a`
    pub chosen: Vec<usize>,
    pub fallback: bool,
}

pub struct ActionFilter<'a> {
    prompts: &'a PromptSet,
    report: &'a BugReport,
    threshold_a: usize,
    tie_break: TieBreak,
}

impl<'a> ActionFilter<'a> {
    pub fn new(prompts: &'a PromptSet, report: &'a BugReport, threshold_a: usize, tie_break: TieBreak) -> Self {
        Self {
            prompts,
            report,
            threshold_a,
            tie_break,
        }
    }

    /// Build the ranking request for `node`'s candidates
    pub fn request(&self, tree: &SearchTree, node: NodeId, candidates: &[Candidate]) -> JudgeRequest {
        let history = format_history(&tree.history(node));
        let mut listing = String::new();
        for c in candidates {
            let _ = write!(
                listing,
                "#{}: {}\n    effect: {}\n",
                c.index,
                c.action,
                c.effect.detail(CANDIDATE_DETAIL_ITEMS).replace('\n', "\n    ")
            );
        }
        let limit = self.threshold_a.to_string();
        let mut vars = self.report.prompt_vars().to_vec();
        vars.extend([
            ("history", history.as_str()),
            ("candidates", listing.trim_end()),
            ("limit", limit.as_str()),
        ]);
        let request = JudgeRequest::new(Purpose::Filter, self.prompts.render(Purpose::Filter, &vars));

        let marks: Vec<_> = candidates
            .iter()
            .filter_map(|c| c.action.target.as_ref().map(|k| (c.index, k.bounds)))
            .collect();
        match tree.get(node).and_then(|n| annotated_screenshot(&n.state, &marks)) {
            Some(image) => request.with_image(image),
            None => request,
        }
    }

    /// Validate a `{"ranked": [...]}` verdict against `count` candidates
    pub fn parse(&self, value: &Value, count: usize) -> Result<Vec<usize>, String> {
        let ranked = index_list(value, "ranked")?;
        if ranked.is_empty() {
            return Err("\"ranked\" is empty".to_string());
        }
        if let Some(bad) = ranked.iter().find(|&&i| i >= count) {
            return Err(format!("candidate #{} does not exist (0..{})", bad, count));
        }
        let mut seen = HashSet::new();
        Ok(ranked
            .into_iter()
            .filter(|i| seen.insert(*i))
            .take(self.threshold_a)
            .collect())
    }

    /// Apply the judgment, falling back to the deterministic ordering
    pub fn select(&self, candidates: &[Candidate], judgment: &Judgment<Vec<usize>>) -> Selection {
        match &judgment.value {
            Some(ranked) => Selection {
                chosen: ranked.iter().copied().take(self.threshold_a).collect(),
                fallback: false,
            },
            None => Selection {
                chosen: self.fallback(candidates),
                fallback: true,
            },
        }
    }

    /// Candidates that changed the screen, crashing ones first, in tie-break order
    pub fn fallback(&self, candidates: &[Candidate]) -> Vec<usize> {
        let mut useful: Vec<&Candidate> = candidates.iter().filter(|c| !c.effect.is_no_effect()).collect();
        if self.tie_break == TieBreak::LargestScreenDelta {
            useful.sort_by(|a, b| b.effect.screen_ratio().total_cmp(&a.effect.screen_ratio()));
        }
        // Stable: crash first, tie-break order within each group
        useful.sort_by_key(|c| !c.effect.crashed());
        useful.into_iter().take(self.threshold_a).map(|c| c.index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, Canvas, ElementKey, Screenshot, UiState};
    use crate::explore::action::{ActionKind, GlobalAction};
    use crate::explore::effect::{EffectDiff, ScreenDelta};
    use crate::llm::Attempt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn changed(cells: usize, crashed: bool) -> VisualEffect {
        VisualEffect::Changed(EffectDiff {
            screen: ScreenDelta {
                changed_cells: cells,
                total_cells: 100,
                region: None,
            },
            crashed,
            crash: crashed.then(|| "java.lang.IllegalStateException".to_string()),
            ..Default::default()
        })
    }

    fn candidates() -> Vec<Candidate> {
        let key = |i: i32| ElementKey {
            kind: "Button".into(),
            resource_id: format!("id/b{}", i),
            bounds: Bounds::new(0, i * 30, 100, i * 30 + 20),
            ordinal: 0,
        };
        let effects = [
            VisualEffect::NoEffect,
            changed(5, false),
            changed(40, false),
            changed(10, true),
            changed(40, false),
        ];
        effects
            .into_iter()
            .enumerate()
            .map(|(i, effect)| Candidate {
                index: i,
                action: Action::on(ActionKind::Tap, key(i as i32), format!("B{}", i)),
                effect,
            })
            .collect()
    }

    fn report() -> BugReport {
        BugReport::new("com.example", "1. tap B3", "crash")
    }

    #[test]
    fn test_parse_dedupes_and_truncates() {
        let prompts = PromptSet::default();
        let report = report();
        let filter = ActionFilter::new(&prompts, &report, 2, TieBreak::EnumerationOrder);
        assert_eq!(filter.parse(&json!({"ranked": [3, 3, "1", 4]}), 5).unwrap(), vec![3, 1]);
        assert!(filter.parse(&json!({"ranked": []}), 5).is_err());
        assert!(filter.parse(&json!({"ranked": [7]}), 5).is_err());
        assert!(filter.parse(&json!({"order": [1]}), 5).is_err());
    }

    #[test]
    fn test_fallback_orders() {
        let prompts = PromptSet::default();
        let report = report();
        let by_order = ActionFilter::new(&prompts, &report, 3, TieBreak::EnumerationOrder);
        assert_eq!(by_order.fallback(&candidates()), vec![3, 1, 2]);

        let by_delta = ActionFilter::new(&prompts, &report, 3, TieBreak::LargestScreenDelta);
        assert_eq!(by_delta.fallback(&candidates()), vec![3, 2, 4]);
    }

    #[test]
    fn test_select_uses_fallback_without_value() {
        let prompts = PromptSet::default();
        let report = report();
        let filter = ActionFilter::new(&prompts, &report, 2, TieBreak::EnumerationOrder);
        let failed = Judgment::<Vec<usize>> {
            value: None,
            attempts: vec![Attempt {
                attempt: 1,
                strict: false,
                raw: Some("??".into()),
                error: Some("no JSON".into()),
            }],
        };
        let selection = filter.select(&candidates(), &failed);
        assert!(selection.fallback);
        assert_eq!(selection.chosen, vec![3, 1]);
    }

    #[test]
    fn test_request_lists_every_candidate() {
        let prompts = PromptSet::default();
        let report = report();
        let filter = ActionFilter::new(&prompts, &report, 3, TieBreak::EnumerationOrder);
        let png = Canvas::with_color(180, 320, [90, 90, 90]).to_png().unwrap();
        let state = UiState {
            elements: Vec::new(),
            screenshot: Screenshot::from_png(png).unwrap(),
            package: "com.example".into(),
            activity: None,
            crash: None,
        };
        let mut tree = SearchTree::new();
        let root = tree.add_root(state, crate::device::SnapshotHandle("h".into())).unwrap();

        let mut all = candidates();
        all.push(Candidate {
            index: 5,
            action: Action::global(GlobalAction::Back),
            effect: VisualEffect::NoEffect,
        });
        let request = filter.request(&tree, root, &all);
        assert_eq!(request.purpose, Purpose::Filter);
        assert!(request.prompt.contains("#0: tap \"B0\""));
        assert!(request.prompt.contains("#5: back"));
        assert!(request.prompt.contains("APP CRASHED"));
        assert!(request.prompt.contains("Include at most 3"));
        assert_eq!(request.images.len(), 1);
    }
}
