//! Beam search over app states.
//!
//! Each round expands every frontier node (trial-executing its actions and
//! recording their effects), keeps the best `threshold_a` actions per node,
//! commits them as children, keeps the best `threshold_k` paths overall, and
//! checks whether any of them reproduces the bug.

pub mod action;
pub mod backtrack;
pub mod controller;
pub mod effect;
pub mod evaluator;
pub mod filter;
pub mod input;
pub mod success;
pub mod tree;

pub use action::{Action, ActionEnumerator, ActionKind, Direction, GlobalAction, Orientation};
pub use backtrack::{Backtracker, Restore};
pub use controller::{CancelToken, Exhausted, ExploreError, ExploreReport, Explorer, Outcome};
pub use effect::{VisualEffect, record_effect};
pub use evaluator::{Evaluation, PathEvaluator, PathVerdict};
pub use filter::{ActionFilter, Candidate, Selection};
pub use input::InputSynthesizer;
pub use success::{SuccessValidator, crashed};
pub use tree::{Frontier, NodeId, NodeStatus, SearchNode, SearchTree, TreeError};
