//! End-to-end search scenarios on a simulated device with a scripted judge.

use std::time::Duration;

use droid_repro::bug_report::BugReport;
use droid_repro::config::ExploreConfig;
use droid_repro::device::{DeviceCall, SimScreen, SimulatedDevice, Trigger};
use droid_repro::explore::{
    ActionKind, CancelToken, Exhausted, ExploreError, Explorer, NodeId, NodeStatus, Outcome, SearchTree,
};
use droid_repro::llm::{LlmError, Purpose, ScriptedJudge};
use droid_repro::record::{RunLog, RunRecorder, read_run};
use pretty_assertions::assert_eq;

fn screen(name: &str, buttons: usize) -> SimScreen {
    (0..buttons).fold(SimScreen::new(name).label(name), |s, i| {
        s.button(&format!("{}_{}", name, i), &format!("{}-{}", name, i))
    })
}

/// Every button `<screen>_<i>` opens screen `<screen><i>`, `depth` levels deep.
/// Leaf buttons and `back` do nothing.
fn tree_app(width: usize, depth: usize) -> SimulatedDevice {
    let mut device = SimulatedDevice::new(screen("home", width));
    let mut level = vec!["home".to_string()];
    for _ in 0..depth {
        let mut next = Vec::new();
        for parent in &level {
            for i in 0..width {
                let child = format!("{}{}", parent, i);
                device = device
                    .with_screen(screen(&child, width))
                    .with_edge(parent, Trigger::tap(&format!("{}_{}", parent, i)), &child);
                next.push(child);
            }
        }
        level = next;
    }
    device
}

fn config(threshold_a: usize, threshold_k: usize, max_step: usize) -> ExploreConfig {
    ExploreConfig {
        threshold_a,
        threshold_k,
        max_step,
        llm_concurrency: 2,
        rate_limit_backoff_ms: 1,
        ..ExploreConfig::default()
    }
}

fn report() -> BugReport {
    BugReport::new(
        "com.example.app",
        "1. Open the app\n2. Open the first item",
        "The app crashes",
    )
}

/// Labels of the committed actions on `node`'s children, in creation order
fn child_labels(tree: &SearchTree, node: NodeId) -> Vec<String> {
    tree.children(node)
        .into_iter()
        .filter_map(|id| tree.get(id).and_then(|n| n.action.as_ref()).map(|a| a.label.clone()))
        .collect()
}

fn times_executed(device: &SimulatedDevice, label: &str) -> usize {
    let quoted = format!("\"{}\"", label);
    device.executed().iter().filter(|a| a.contains(&quoted)).count()
}

fn assert_children_within(tree: &SearchTree, threshold_a: usize) {
    for node in tree.nodes() {
        assert!(tree.children(node.id).len() <= threshold_a, "{} has too many children", node.id);
    }
}

fn recorded_run<F>(explore: F) -> RunLog
where
    F: FnOnce(&mut RunRecorder),
{
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = RunRecorder::create(dir.path()).unwrap();
    explore(&mut recorder);
    read_run(dir.path()).unwrap()
}

#[test]
fn test_five_candidates_commit_exactly_threshold_a() {
    // 4 buttons + back = 5 candidates
    let mut device = tree_app(4, 1);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [3, 1, 0]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1, 2], "completed": []}"#);
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(3, 3, 1))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(result.transitions, 3);
    let root = NodeId(0);
    assert_eq!(child_labels(&result.tree, root), vec!["home-3", "home-1", "home-0"]);

    // Committed actions run twice (trial + commit), the others only as trials
    assert_eq!(times_executed(&device, "home-3"), 2);
    assert_eq!(times_executed(&device, "home-1"), 2);
    assert_eq!(times_executed(&device, "home-0"), 2);
    assert_eq!(times_executed(&device, "home-2"), 1);
    assert_eq!(device.executed().iter().filter(|a| a.as_str() == "back").count(), 1);

    let round = &log.rounds[0];
    let expansion = &round.expansions[0];
    assert_eq!(expansion.candidates.len(), 5);
    assert_eq!(expansion.chosen, vec![3, 1, 0]);
    for candidate in &expansion.candidates {
        let is_back = matches!(candidate.action.kind, ActionKind::Global(_));
        assert_eq!(candidate.effect.is_no_effect(), is_back, "{}", candidate.description);
    }
    assert!(round.errors.is_empty());
    assert!(!round.partial);
}

#[test]
fn test_prune_keeps_threshold_k_and_releases_the_rest() {
    let mut device = tree_app(3, 2);
    let judge = ScriptedJudge::new()
        .with_responder(Purpose::Filter, |request| {
            // Two children for the root, three for everything else
            if request.prompt.contains("no actions yet") {
                Ok(r#"{"ranked": [0, 1]}"#.to_string())
            } else {
                Ok(r#"{"ranked": [0, 1, 2]}"#.to_string())
            }
        })
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 2, 3, 5], "completed": []}"#);
    judge.push(Purpose::Evaluate, Ok(r#"{"promising": [0, 1], "completed": []}"#.to_string()));
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(3, 4, 2)).run().unwrap();
    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(result.transitions, 8);

    let tree = &result.tree;
    let grandchildren: Vec<NodeId> = tree.nodes().filter(|n| n.depth == 2).map(|n| n.id).collect();
    assert_eq!(grandchildren.len(), 6);

    let active: Vec<NodeId> = grandchildren
        .iter()
        .copied()
        .filter(|id| tree.status(*id) == Some(NodeStatus::Active))
        .collect();
    assert_eq!(active, vec![grandchildren[0], grandchildren[2], grandchildren[3], grandchildren[5]]);

    let root_release = device
        .calls()
        .iter()
        .position(|c| *c == DeviceCall::Release(tree.get(NodeId(0)).unwrap().snapshot.0.clone()))
        .unwrap();
    for pruned in [grandchildren[1], grandchildren[4]] {
        assert_eq!(tree.status(pruned), Some(NodeStatus::Pruned));
        let handle = tree.get(pruned).unwrap().snapshot.clone();
        assert!(device.released().contains(&handle));
        // Released during the prune step, before the end-of-run cleanup
        let released_at = device.calls().iter().position(|c| *c == DeviceCall::Release(handle.0.clone())).unwrap();
        assert!(released_at < root_release);
    }
    assert_children_within(tree, 3);
}

#[test]
fn test_filter_timeouts_then_success_uses_llm_order() {
    let mut device = tree_app(2, 1);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [1, 0]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1], "completed": []}"#);
    judge.push(Purpose::Filter, Err(LlmError::Timeout(Duration::from_secs(90))));
    judge.push(Purpose::Filter, Err(LlmError::Timeout(Duration::from_secs(90))));
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(2, 2, 1))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(child_labels(&result.tree, NodeId(0)), vec!["home-1", "home-0"]);

    let filter = log.rounds[0].expansions[0].filter.as_ref().unwrap();
    assert!(!filter.fallback);
    assert_eq!(filter.attempts.len(), 3);
    assert!(filter.attempts[0].error.as_deref().unwrap().contains("timed out"));
    assert!(filter.attempts[1].strict);
    assert_eq!(filter.attempts[2].error, None);
    assert!(!log.rounds[0].partial);
}

#[test]
fn test_malformed_responses_fall_back_and_round_completes() {
    let mut device = tree_app(3, 1);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, "Sure! The first button looks most relevant.")
        .with_default(Purpose::Evaluate, "```json\n{\"promising\": \n```");
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(2, 1, 1))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(judge.calls(Purpose::Filter), 3);
    assert_eq!(judge.calls(Purpose::Evaluate), 3);

    let round = &log.rounds[0];
    let expansion = &round.expansions[0];
    let filter = expansion.filter.as_ref().unwrap();
    assert!(filter.fallback);
    assert_eq!(filter.attempts.len(), 3);
    // Fallback keeps candidates that changed the screen, in enumeration order
    assert_eq!(expansion.chosen, vec![0, 1]);
    assert!(round.evaluation.as_ref().unwrap().fallback);
    assert_eq!(round.frontier_after.len(), 1);
    assert!(!round.partial);
}

#[test]
fn test_action_budget_is_never_exceeded() {
    let mut device = tree_app(3, 3);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1, 2]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1, 2], "completed": []}"#);
    let report = report();
    let config = ExploreConfig {
        max_transition: 5,
        ..config(3, 3, 10)
    };

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(Explorer::new(&mut device, &judge, &report, config).recorder(recorder).run().unwrap());
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Transitions));
    assert_eq!(result.transitions, 5);
    assert_eq!(result.tree.len() - 1, 5);
    assert_eq!(result.rounds, 2);
    for round in &log.rounds {
        assert!(round.frontier_after.len() <= 3);
        assert!(round.transitions <= 5);
    }
    assert_children_within(&result.tree, 3);
    assert_eq!(log.trailer.unwrap().transitions, 5);
}

#[test]
fn test_round_and_time_budgets() {
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1], "completed": []}"#);
    let report = report();

    let mut device = tree_app(2, 3);
    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 2)).run().unwrap();
    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(result.rounds, 2);

    let mut device = tree_app(2, 3);
    let config = ExploreConfig {
        max_duration: Some(Duration::ZERO),
        ..config(2, 2, 5)
    };
    let result = Explorer::new(&mut device, &judge, &report, config).run().unwrap();
    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Time));
    assert_eq!(result.rounds, 0);
    assert!(device.executed().is_empty());
}

#[test]
fn test_crash_is_success_and_freezes_tree() {
    let mut device = SimulatedDevice::new(
        SimScreen::new("home")
            .label("Notes")
            .button("com.example.app:id/delete", "Delete all")
            .button("com.example.app:id/open", "Open")
            .with_clock(),
    )
    .with_screen(SimScreen::new("crashed").crash("java.lang.IllegalStateException: empty list"))
    .with_screen(SimScreen::new("note").label("Note"))
    .with_edge("home", Trigger::tap("com.example.app:id/delete"), "crashed")
    .with_edge("home", Trigger::tap("com.example.app:id/open"), "note");
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1], "completed": []}"#);
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 5)).run().unwrap();
    let Outcome::Success { node, actions } = &result.outcome else {
        panic!("expected success, got {:?}", result.outcome);
    };
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].label, "Delete all");
    assert_eq!(result.transitions, 1);
    assert_eq!(judge.calls(Purpose::Evaluate), 0);

    let mut tree = result.tree;
    assert_eq!(tree.success(), Some(*node));
    assert_eq!(tree.nodes().filter(|n| n.status == NodeStatus::Success).count(), 1);
    assert!(tree.is_frozen());
    assert!(tree.set_status(NodeId(0), NodeStatus::Pruned).is_err());

    // Only the success node keeps its snapshot
    assert_eq!(device.live_snapshots(), 1);
}

#[test]
fn test_validated_claim_is_success() {
    let mut device = tree_app(2, 1);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": ["P0"], "completed": ["P1"]}"#)
        .with_default(Purpose::Validate, r#"{"reproduced": "yes"}"#);
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 5)).run().unwrap();
    let Outcome::Success { node, actions } = &result.outcome else {
        panic!("expected success, got {:?}", result.outcome);
    };
    assert_eq!(result.rounds, 1);
    assert_eq!(actions[0].label, "home-1");
    assert_eq!(judge.calls(Purpose::Validate), 1);
    assert_eq!(result.tree.status(*node), Some(NodeStatus::Success));
}

#[test]
fn test_rejected_claim_keeps_searching() {
    let mut device = tree_app(2, 1);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0], "completed": [1]}"#)
        .with_default(Purpose::Validate, r#"{"reproduced": false}"#);
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 1)).run().unwrap();
    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(result.tree.success(), None);
    assert!(!result.tree.is_frozen());
}

#[test]
fn test_cancel_before_first_round() {
    let mut device = tree_app(2, 1);
    let judge = ScriptedJudge::new();
    let report = report();
    let token = CancelToken::new();
    token.cancel();

    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 5))
        .cancel_token(token)
        .run()
        .unwrap();
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(result.rounds, 0);
    assert!(device.executed().is_empty());
}

#[test]
fn test_cancel_waits_for_commit_to_finish() {
    let mut device = tree_app(3, 2);
    let token = CancelToken::new();
    let trigger = token.clone();
    let judge = ScriptedJudge::new().with_responder(Purpose::Filter, move |_| {
        trigger.cancel();
        Ok(r#"{"ranked": [2, 0]}"#.to_string())
    });
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(2, 2, 5))
                .recorder(recorder)
                .cancel_token(token)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(result.transitions, 2);
    assert_eq!(child_labels(&result.tree, NodeId(0)), vec!["home-2", "home-0"]);
    assert!(log.rounds[0].partial);
    assert_eq!(log.trailer.unwrap().outcome, "cancelled");
    assert_eq!(device.live_snapshots(), 0);
}

#[test]
fn test_empty_hierarchy_fails_the_whole_frontier() {
    let mut device = SimulatedDevice::new(SimScreen::new("blank"));
    let judge = ScriptedJudge::new();
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(2, 2, 5))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert!(matches!(result.outcome, Outcome::Fatal(_)), "{:?}", result.outcome);
    assert_eq!(result.tree.status(NodeId(0)), Some(NodeStatus::Failed));
    let errors = &log.rounds[0].errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, "EnumerationError");
    assert_eq!(errors[0].node, Some(NodeId(0)));
}

#[test]
fn test_initial_capture_failure_is_fatal() {
    let mut device = tree_app(2, 1);
    device.fail_next_captures(1);
    let judge = ScriptedJudge::new();
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(2, 2, 5)).run().unwrap();
    assert!(matches!(&result.outcome, Outcome::Fatal(reason) if reason.contains("initial state")));
    assert!(result.tree.is_empty());
    assert_eq!(result.rounds, 0);
}

#[test]
fn test_failed_trial_skips_the_candidate() {
    let mut device = tree_app(2, 1);
    device.fail_action(Trigger::tap("home_0"));
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0], "completed": []}"#);
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(1, 1, 1))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(child_labels(&result.tree, NodeId(0)), vec!["home-1"]);
    let round = &log.rounds[0];
    let indices: Vec<usize> = round.expansions[0].candidates.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(round.errors.len(), 1);
    assert_eq!(round.errors[0].kind, "ActionExecutionError");
    assert!(round.errors[0].action.as_deref().unwrap().contains("home-0"));
}

#[test]
fn test_same_screen_from_two_buttons_keeps_one_path() {
    let mut device = SimulatedDevice::new(
        SimScreen::new("home")
            .label("Home")
            .button("com.example.app:id/gear", "Gear")
            .button("com.example.app:id/menu_settings", "Settings"),
    )
    .with_screen(SimScreen::new("settings").label("Settings").button("com.example.app:id/save", "Save"))
    .with_edge("home", Trigger::tap("com.example.app:id/gear"), "settings")
    .with_edge("home", Trigger::tap("com.example.app:id/menu_settings"), "settings");
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0], "completed": []}"#);
    let report = report();

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(
            Explorer::new(&mut device, &judge, &report, config(2, 2, 1))
                .recorder(recorder)
                .run()
                .unwrap(),
        );
    });
    let result = result.unwrap();

    let children = result.tree.children(NodeId(0));
    assert_eq!(children.len(), 2);
    let (first, second) = (children[0], children[1]);
    assert_eq!(result.tree.get(first).unwrap().state, result.tree.get(second).unwrap().state);
    assert_eq!(result.tree.status(first), Some(NodeStatus::Active));
    assert_eq!(result.tree.status(second), Some(NodeStatus::Pruned));

    let round = &log.rounds[0];
    assert_eq!(round.frontier_after, vec![first]);
    let change = round.status_changes.iter().find(|c| c.node == second).unwrap();
    assert_eq!(change.reason, format!("duplicates {}", first));
    let handle = &result.tree.get(second).unwrap().snapshot;
    assert!(device.released().contains(handle));

    // Only the surviving path reaches the evaluator
    let prompt = &judge.prompts(Purpose::Evaluate)[0];
    assert!(prompt.contains("Path P0:"));
    assert!(!prompt.contains("Path P1:"));
}

#[test]
fn test_failed_restore_is_recovered_by_replay() {
    let mut device = tree_app(2, 1);
    // Both snapshot reloads before the second trial fail
    device.fail_next_restores(2);
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Filter, r#"{"ranked": [0, 1]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0, 1], "completed": []}"#);
    let report = report();
    let config = ExploreConfig {
        restore_attempts: 2,
        ..config(2, 2, 1)
    };

    let mut result = None;
    let log = recorded_run(|recorder| {
        result = Some(Explorer::new(&mut device, &judge, &report, config).recorder(recorder).run().unwrap());
    });
    let result = result.unwrap();

    assert_eq!(result.outcome, Outcome::BudgetExhausted(Exhausted::Rounds));
    assert_eq!(result.tree.status(NodeId(0)), Some(NodeStatus::Active));
    assert_eq!(child_labels(&result.tree, NodeId(0)), vec!["home-0", "home-1"]);
    assert_eq!(device.calls().iter().filter(|c| **c == DeviceCall::Relaunch).count(), 1);

    let round = &log.rounds[0];
    assert_eq!(round.expansions[0].candidates.len(), 3);
    assert_eq!(round.errors.len(), 1);
    assert_eq!(round.errors[0].node, Some(NodeId(0)));
    assert_eq!(round.errors[0].kind, "EmulatorError");
    assert!(round.errors[0].message.contains("injected restore failure"));
    assert!(round.status_changes.iter().all(|c| c.status != NodeStatus::Failed));
}

#[test]
fn test_text_input_values_are_synthesized() {
    let mut device = SimulatedDevice::new(
        SimScreen::new("editor")
            .label("New note")
            .input("com.example.app:id/title", "Title"),
    )
    .with_screen(SimScreen::new("typed").label("Groceries"))
    .with_edge("editor", Trigger::input("com.example.app:id/title"), "typed");
    let judge = ScriptedJudge::new()
        .with_default(Purpose::Input, r#"{"input": "Groceries"}"#)
        .with_default(Purpose::Filter, r#"{"ranked": [0]}"#)
        .with_default(Purpose::Evaluate, r#"{"promising": [0], "completed": []}"#);
    let report = report();

    let result = Explorer::new(&mut device, &judge, &report, config(1, 1, 1)).run().unwrap();
    assert_eq!(judge.calls(Purpose::Input), 1);
    assert!(judge.prompts(Purpose::Input)[0].contains("hint=\"Title\""));

    let child = result.tree.children(NodeId(0))[0];
    let action = result.tree.get(child).unwrap().action.clone().unwrap();
    assert_eq!(action.kind, ActionKind::TextInput(Some("Groceries".to_string())));
    assert!(device.executed().iter().any(|a| a.starts_with("type \"Groceries\" into")));
}

#[test]
fn test_invalid_parameters_are_rejected() {
    let mut device = tree_app(2, 1);
    let judge = ScriptedJudge::new();
    let report = report();

    let err = Explorer::new(&mut device, &judge, &report, config(2, 0, 5)).run().unwrap_err();
    assert!(matches!(err, ExploreError::Config(_)));
    assert!(device.calls().is_empty());
}
