//! Visual effect recorder: structured diff between two UI states.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::device::{Bounds, ElementKey, Screenshot, UiElement, UiState, normalize_text};

/// How an action changed the screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum VisualEffect {
    NoEffect,
    Changed(EffectDiff),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EffectDiff {
    pub added: Vec<ElementSummary>,
    pub removed: Vec<ElementSummary>,
    pub changed: Vec<ElementChange>,
    pub screen: ScreenDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_change: Option<AppChange>,
    pub crashed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSummary {
    pub key: ElementKey,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementChange {
    pub key: ElementKey,
    /// Human-readable field changes, e.g. `text: "a" -> "b"`
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScreenDelta {
    pub changed_cells: usize,
    pub total_cells: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Bounds>,
}

impl ScreenDelta {
    pub fn ratio(&self) -> f64 {
        if self.total_cells == 0 {
            0.0
        } else {
            self.changed_cells as f64 / self.total_cells as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppChange {
    pub from: String,
    pub to: String,
}

/// Compare two states. `NoEffect` exactly when `before == after`.
pub fn record_effect(before: &UiState, after: &UiState) -> VisualEffect {
    if before == after {
        return VisualEffect::NoEffect;
    }

    let index = |state: &UiState| -> BTreeMap<ElementKey, UiElement> {
        state.keys().into_iter().zip(state.elements.iter().cloned()).collect()
    };
    let old = index(before);
    let new = index(after);

    let summary = |(key, e): (&ElementKey, &UiElement)| ElementSummary {
        key: key.clone(),
        label: e.label(),
    };
    let added = new.iter().filter(|(k, _)| !old.contains_key(*k)).map(summary).collect();
    let removed = old.iter().filter(|(k, _)| !new.contains_key(*k)).map(summary).collect();
    let changed = old
        .iter()
        .filter_map(|(k, a)| {
            let b = new.get(k)?;
            let fields = field_changes(a, b);
            (!fields.is_empty()).then(|| ElementChange { key: k.clone(), fields })
        })
        .collect();

    let (changed_cells, region) = before.screenshot.delta(&after.screenshot);
    let app_change = (before.foreground() != after.foreground()).then(|| AppChange {
        from: before.foreground(),
        to: after.foreground(),
    });

    VisualEffect::Changed(EffectDiff {
        added,
        removed,
        changed,
        screen: ScreenDelta {
            changed_cells,
            total_cells: Screenshot::compared_cells(),
            region,
        },
        app_change,
        crashed: after.is_crashed() && !before.is_crashed(),
        crash: after.crash.clone(),
    })
}

fn field_changes(a: &UiElement, b: &UiElement) -> Vec<String> {
    let mut fields = Vec::new();
    for (name, x, y) in [
        ("text", &a.text, &b.text),
        ("content-desc", &a.content_desc, &b.content_desc),
        ("hint", &a.hint, &b.hint),
    ] {
        if normalize_text(x) != normalize_text(y) {
            fields.push(format!("{}: \"{}\" -> \"{}\"", name, x, y));
        }
    }
    for (name, x, y) in [
        ("checked", a.checked, b.checked),
        ("enabled", a.enabled, b.enabled),
        ("clickable", a.clickable, b.clickable),
        ("scrollable", a.scrollable, b.scrollable),
    ] {
        if x != y {
            fields.push(format!("{}: {} -> {}", name, x, y));
        }
    }
    fields
}

impl VisualEffect {
    pub fn is_no_effect(&self) -> bool {
        matches!(self, VisualEffect::NoEffect)
    }

    pub fn crashed(&self) -> bool {
        matches!(self, VisualEffect::Changed(d) if d.crashed)
    }

    /// Fraction of the screen grid that changed
    pub fn screen_ratio(&self) -> f64 {
        match self {
            VisualEffect::NoEffect => 0.0,
            VisualEffect::Changed(d) => d.screen.ratio(),
        }
    }

    /// One-line description for prompts
    pub fn summary(&self) -> String {
        let diff = match self {
            VisualEffect::NoEffect => return "no visible effect".to_string(),
            VisualEffect::Changed(d) => d,
        };

        let mut parts = Vec::new();
        if let Some(crash) = diff.crash.as_ref().filter(|_| diff.crashed) {
            parts.push(format!("APP CRASHED ({})", crash));
        }
        if let Some(app) = &diff.app_change {
            parts.push(format!("moved to {}", app.to));
        }
        if !diff.added.is_empty() {
            parts.push(format!("{} element(s) appeared", diff.added.len()));
        }
        if !diff.removed.is_empty() {
            parts.push(format!("{} element(s) disappeared", diff.removed.len()));
        }
        if !diff.changed.is_empty() {
            parts.push(format!("{} element(s) changed", diff.changed.len()));
        }
        parts.push(format!("{:.0}% of the screen changed", diff.screen.ratio() * 100.0));
        parts.join(", ")
    }

    /// Multi-line description listing element labels, for the newest steps
    pub fn detail(&self, max_items: usize) -> String {
        let diff = match self {
            VisualEffect::NoEffect => return self.summary(),
            VisualEffect::Changed(d) => d,
        };

        let mut out = self.summary();
        let labels = |items: &[ElementSummary]| {
            items
                .iter()
                .filter(|s| !s.label.is_empty())
                .take(max_items)
                .map(|s| format!("\"{}\"", s.label))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let appeared = labels(&diff.added);
        if !appeared.is_empty() {
            let _ = write!(out, "\n  appeared: {}", appeared);
        }
        let gone = labels(&diff.removed);
        if !gone.is_empty() {
            let _ = write!(out, "\n  disappeared: {}", gone);
        }
        for change in diff.changed.iter().take(max_items) {
            let _ = write!(out, "\n  {}: {}", change.key, change.fields.join("; "));
        }
        out
    }
}
