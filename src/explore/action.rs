//! Actions and the exhaustive per-screen action enumerator.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceError, DeviceResult, ElementKey, UiState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        })
    }
}

/// Actions that do not target an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalAction {
    Back,
    Enter,
    Delete,
    Home,
    Swipe(Direction),
    Rotate(Orientation),
}

impl fmt::Display for GlobalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalAction::Back => f.write_str("back"),
            GlobalAction::Enter => f.write_str("enter"),
            GlobalAction::Delete => f.write_str("delete"),
            GlobalAction::Home => f.write_str("home"),
            GlobalAction::Swipe(d) => write!(f, "swipe-{}", d),
            GlobalAction::Rotate(o) => write!(f, "rotate-{}", o),
        }
    }
}

impl FromStr for GlobalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        let action = match normalized.as_str() {
            "back" => GlobalAction::Back,
            "enter" => GlobalAction::Enter,
            "delete" | "del" => GlobalAction::Delete,
            "home" => GlobalAction::Home,
            "swipe-up" => GlobalAction::Swipe(Direction::Up),
            "swipe-down" => GlobalAction::Swipe(Direction::Down),
            "swipe-left" => GlobalAction::Swipe(Direction::Left),
            "swipe-right" => GlobalAction::Swipe(Direction::Right),
            "rotate-landscape" => GlobalAction::Rotate(Orientation::Landscape),
            "rotate-portrait" => GlobalAction::Rotate(Orientation::Portrait),
            _ => return Err(format!("unknown global action '{}'", s)),
        };
        Ok(action)
    }
}

/// What an action does
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "param", rename_all = "snake_case")]
pub enum ActionKind {
    Tap,
    LongPress,
    Scroll(Direction),
    /// Text to type; `None` until a value has been synthesized
    TextInput(Option<String>),
    Global(GlobalAction),
}

/// A single UI interaction, optionally targeting an element
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: Option<ElementKey>,
    /// Element label at enumeration time, for prompts and reports
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl Action {
    pub fn on(kind: ActionKind, target: ElementKey, label: impl Into<String>) -> Self {
        Self {
            kind,
            target: Some(target),
            label: label.into(),
        }
    }

    pub fn global(action: GlobalAction) -> Self {
        Self {
            kind: ActionKind::Global(action),
            target: None,
            label: String::new(),
        }
    }

    pub fn is_text_input(&self) -> bool {
        matches!(self.kind, ActionKind::TextInput(_))
    }

    /// Text-input action still waiting for a value
    pub fn needs_input(&self) -> bool {
        matches!(self.kind, ActionKind::TextInput(None))
    }

    /// Copy of this action with the text value filled in
    pub fn with_input(&self, value: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::TextInput(Some(value.into())),
            ..self.clone()
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match &self.kind {
            ActionKind::Tap => "tap".to_string(),
            ActionKind::LongPress => "long-press".to_string(),
            ActionKind::Scroll(d) => format!("scroll {}", d),
            ActionKind::TextInput(Some(v)) => format!("type \"{}\" into", v),
            ActionKind::TextInput(None) => "type into".to_string(),
            ActionKind::Global(g) => return write!(f, "{}", g),
        };
        match &self.target {
            Some(key) if !self.label.is_empty() => write!(f, "{} \"{}\" ({})", verb, self.label, key),
            Some(key) => write!(f, "{} {}", verb, key),
            None => f.write_str(&verb),
        }
    }
}

/// Produces the ordered candidate action set for a screen
#[derive(Debug, Clone)]
pub struct ActionEnumerator {
    globals: Vec<GlobalAction>,
    ignored_packages: Vec<String>,
}

impl Default for ActionEnumerator {
    fn default() -> Self {
        Self {
            globals: vec![GlobalAction::Back],
            ignored_packages: Vec::new(),
        }
    }
}

impl ActionEnumerator {
    pub fn new(globals: Vec<GlobalAction>, ignored_packages: Vec<String>) -> Self {
        Self { globals, ignored_packages }
    }

    /// Enumerate every structurally valid action for `state`.
    ///
    /// Element actions come first in screen-position order (top, left,
    /// bottom, right, then key), followed by the configured global actions.
    /// `back` is always present. Identical actions appear once.
    pub fn enumerate(&self, state: &UiState) -> DeviceResult<Vec<Action>> {
        if state.elements.is_empty() {
            return Err(DeviceError::Enumeration("UI hierarchy is empty".to_string()));
        }

        let mut targets: Vec<_> = state
            .keys()
            .into_iter()
            .zip(&state.elements)
            .filter(|(_, e)| e.is_actionable())
            .filter(|(_, e)| !self.ignored_packages.iter().any(|p| p == &e.package))
            .collect();
        targets.sort_by(|(ka, a), (kb, b)| {
            (a.bounds.top, a.bounds.left, a.bounds.bottom, a.bounds.right)
                .cmp(&(b.bounds.top, b.bounds.left, b.bounds.bottom, b.bounds.right))
                .then_with(|| ka.cmp(kb))
        });

        let mut seen = HashSet::new();
        let mut actions = Vec::new();
        let mut push = |action: Action| {
            if seen.insert(action.clone()) {
                actions.push(action);
            }
        };

        for (key, element) in targets {
            let label = element.label();
            if element.editable {
                push(Action::on(ActionKind::TextInput(None), key.clone(), &label));
                push(Action::on(ActionKind::LongPress, key, &label));
                continue;
            }
            if element.clickable {
                push(Action::on(ActionKind::Tap, key.clone(), &label));
            }
            if element.long_clickable {
                push(Action::on(ActionKind::LongPress, key.clone(), &label));
            }
            if element.scrollable {
                push(Action::on(ActionKind::Scroll(Direction::Up), key.clone(), &label));
                push(Action::on(ActionKind::Scroll(Direction::Down), key, &label));
            }
        }

        push(Action::global(GlobalAction::Back));
        for global in &self.globals {
            push(Action::global(*global));
        }

        debug!(count = actions.len(), "enumerated candidate actions");
        Ok(actions)
    }
}
