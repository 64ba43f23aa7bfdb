//! Backtracking manager: keeps track of which node is live on the device and
//! restores (and verifies) snapshots when the search switches paths.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::tree::{NodeId, SearchTree};
use crate::device::{Device, DeviceError, DeviceResult, UiState};

/// How `ensure_live` brought a node back
#[derive(Debug)]
pub enum Restore {
    AlreadyLive,
    Restored,
    /// Snapshot restores failed with the given error; the path was replayed
    Replayed(DeviceError),
}

#[derive(Debug)]
pub struct Backtracker {
    live: Option<NodeId>,
    tolerance: f64,
    attempts: usize,
    released: HashSet<NodeId>,
}

impl Backtracker {
    pub fn new(tolerance: f64, attempts: usize) -> Self {
        Self {
            live: None,
            tolerance,
            attempts: attempts.max(1),
            released: HashSet::new(),
        }
    }

    /// Node whose state the device currently shows, if known
    pub fn live(&self) -> Option<NodeId> {
        self.live
    }

    /// Record that the device now shows `node` (after a snapshot was taken)
    pub fn mark_live(&mut self, node: NodeId) {
        self.live = Some(node);
    }

    /// The device moved away from every recorded node
    pub fn invalidate(&mut self) {
        self.live = None;
    }

    /// Whether a restored state is close enough to the recording
    pub fn verify(&self, expected: &UiState, actual: &UiState) -> bool {
        if expected == actual {
            return true;
        }
        self.tolerance < 1.0 && expected.similarity(actual) >= self.tolerance
    }

    /// Make `node` live. No device call happens when it already is.
    ///
    /// Restores are retried. When none verifies, the app is relaunched and
    /// the node's committed actions are replayed; a replayed state that
    /// still does not verify is an `EmulatorError` and the caller marks the
    /// node failed.
    pub fn ensure_live(&mut self, device: &mut dyn Device, tree: &SearchTree, node: NodeId) -> DeviceResult<Restore> {
        if self.live == Some(node) {
            return Ok(Restore::AlreadyLive);
        }
        self.live = None;
        let target = tree
            .get(node)
            .ok_or_else(|| DeviceError::Emulator(format!("unknown node {}", node)))?;
        if self.released.contains(&node) {
            return Err(DeviceError::Emulator(format!("snapshot of {} was already released", node)));
        }

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let restored = device.restore(&target.snapshot).and_then(|_| device.capture());
            match restored {
                Ok(state) if self.verify(&target.state, &state) => {
                    debug!(%node, attempt, "restored");
                    self.live = Some(node);
                    return Ok(Restore::Restored);
                }
                Ok(state) => {
                    let similarity = target.state.similarity(&state);
                    warn!(%node, attempt, similarity, "restored state does not match the recording");
                    last_error = Some(DeviceError::Emulator(format!(
                        "restored state of {} does not match its recording (similarity {:.2})",
                        node, similarity
                    )));
                }
                Err(e) => {
                    warn!(%node, attempt, error = %e, "restore failed");
                    last_error = Some(e);
                }
            }
        }
        let cause = last_error.unwrap_or_else(|| DeviceError::Emulator(format!("could not restore {}", node)));

        match self.replay(device, tree, node) {
            Ok(()) => {
                info!(%node, "node rebuilt by replaying its path");
                self.live = Some(node);
                Ok(Restore::Replayed(cause))
            }
            Err(e) => {
                warn!(%node, error = %e, "replay failed");
                Err(DeviceError::Emulator(format!("{}; replay: {}", cause, e)))
            }
        }
    }

    /// Relaunch the app and re-execute the committed actions leading to `node`
    fn replay(&mut self, device: &mut dyn Device, tree: &SearchTree, node: NodeId) -> DeviceResult<()> {
        let target = tree
            .get(node)
            .ok_or_else(|| DeviceError::Emulator(format!("unknown node {}", node)))?;
        let actions = tree.actions(node);
        debug!(%node, steps = actions.len(), "replaying path from a fresh launch");

        device.relaunch()?;
        let mut state = device.capture()?;
        for action in &actions {
            state = device.execute(action)?;
        }
        if self.verify(&target.state, &state) {
            Ok(())
        } else {
            Err(DeviceError::Emulator(format!(
                "replayed state of {} does not match its recording (similarity {:.2})",
                node,
                target.state.similarity(&state)
            )))
        }
    }

    /// Release `node`'s snapshot once
    pub fn release(&mut self, device: &mut dyn Device, tree: &SearchTree, node: NodeId) -> DeviceResult<()> {
        if !self.released.insert(node) {
            return Ok(());
        }
        let handle = &tree
            .get(node)
            .ok_or_else(|| DeviceError::Emulator(format!("unknown node {}", node)))?
            .snapshot;
        device.release(handle)
    }

    pub fn is_released(&self, node: NodeId) -> bool {
        self.released.contains(&node)
    }

    /// Release every remaining handle except `keep`'s; failures are returned, not raised
    pub fn release_all_except(
        &mut self,
        device: &mut dyn Device,
        tree: &SearchTree,
        keep: Option<NodeId>,
    ) -> Vec<(NodeId, DeviceError)> {
        let ids: Vec<NodeId> = tree.nodes().map(|n| n.id).filter(|id| Some(*id) != keep).collect();
        ids.into_iter()
            .filter_map(|id| self.release(device, tree, id).err().map(|e| (id, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, SimScreen, SimulatedDevice, Trigger};
    use crate::explore::action::{Action, ActionKind};
    use crate::explore::effect::record_effect;

    fn device() -> SimulatedDevice {
        SimulatedDevice::new(SimScreen::new("home").button("com.example.app:id/next", "Next").with_clock())
            .with_screen(SimScreen::new("detail").label("Detail"))
            .with_edge("home", Trigger::tap("com.example.app:id/next"), "detail")
    }

    fn root(device: &mut SimulatedDevice) -> (SearchTree, NodeId) {
        let mut tree = SearchTree::new();
        let state = device.capture().unwrap();
        let handle = device.snapshot().unwrap();
        let id = tree.add_root(state, handle).unwrap();
        (tree, id)
    }

    #[test]
    fn test_restore_round_trip_matches_recording() {
        let mut device = device();
        let (tree, root) = root(&mut device);
        let mut bt = Backtracker::new(1.0, 1);

        let state = tree.get(root).unwrap().state.clone();
        let tap = Action::on(ActionKind::Tap, state.keys()[1].clone(), "Next");
        device.execute(&tap).unwrap();
        assert_eq!(device.current_screen(), "detail");

        bt.ensure_live(&mut device, &tree, root).unwrap();
        assert_eq!(device.current_screen(), "home");
        let captured = device.capture().unwrap();
        assert!(record_effect(&state, &captured).is_no_effect());
    }

    #[test]
    fn test_ensure_live_is_idempotent() {
        let mut device = device();
        let (tree, root) = root(&mut device);
        let mut bt = Backtracker::new(1.0, 1);
        bt.mark_live(root);
        let calls = device.calls().len();
        bt.ensure_live(&mut device, &tree, root).unwrap();
        assert_eq!(device.calls().len(), calls);

        bt.invalidate();
        bt.ensure_live(&mut device, &tree, root).unwrap();
        assert!(device.calls()[calls..].contains(&DeviceCall::Restore("sim-1".into())));
    }

    /// Tree with the root and the "detail" child committed through "Next"
    fn with_child(device: &mut SimulatedDevice) -> (SearchTree, NodeId) {
        let (mut tree, root) = root(device);
        let before = tree.get(root).unwrap().state.clone();
        let tap = Action::on(ActionKind::Tap, before.keys()[1].clone(), "Next");
        let after = device.execute(&tap).unwrap();
        let handle = device.snapshot().unwrap();
        let effect = record_effect(&before, &after);
        let child = tree.add_child(root, tap, effect, after, handle, 1).unwrap();
        (tree, child)
    }

    #[test]
    fn test_misrouted_restore_fails_when_replay_fails() {
        let mut device = device();
        let (tree, root) = root(&mut device);
        device.misroute_restores_to(Some("detail"));
        device.fail_next_relaunches(1);
        let mut bt = Backtracker::new(1.0, 2);

        let err = bt.ensure_live(&mut device, &tree, root).unwrap_err();
        assert_eq!(err.kind(), "EmulatorError");
        assert!(err.to_string().contains("replay"));
        let restores = device.calls().iter().filter(|c| matches!(c, DeviceCall::Restore(_))).count();
        assert_eq!(restores, 2);
        assert_eq!(bt.live(), None);
    }

    #[test]
    fn test_misrouted_restore_falls_back_to_replay() {
        let mut device = device();
        let (tree, child) = with_child(&mut device);
        device.misroute_restores_to(Some("home"));
        let mut bt = Backtracker::new(1.0, 2);

        let restore = bt.ensure_live(&mut device, &tree, child).unwrap();
        assert!(matches!(restore, Restore::Replayed(DeviceError::Emulator(_))));
        assert_eq!(bt.live(), Some(child));
        assert_eq!(device.current_screen(), "detail");

        let relaunch = device.calls().iter().position(|c| *c == DeviceCall::Relaunch).unwrap();
        assert!(device.executed().last().unwrap().contains("Next"));
        assert!(device.calls()[relaunch..].iter().any(|c| matches!(c, DeviceCall::Execute(_))));
    }

    #[test]
    fn test_replay_that_diverges_is_an_error() {
        let mut device = device();
        let (tree, child) = with_child(&mut device);
        device.misroute_restores_to(Some("home"));
        device.fail_action(Trigger::tap("com.example.app:id/next"));
        let mut bt = Backtracker::new(1.0, 1);

        let err = bt.ensure_live(&mut device, &tree, child).unwrap_err();
        assert_eq!(err.kind(), "EmulatorError");
        assert_eq!(bt.live(), None);
    }

    #[test]
    fn test_transient_restore_failure_is_retried() {
        let mut device = device();
        let (tree, root) = root(&mut device);
        device.fail_next_restores(1);
        let mut bt = Backtracker::new(1.0, 2);
        let restore = bt.ensure_live(&mut device, &tree, root).unwrap();
        assert!(matches!(restore, Restore::Restored));
        assert_eq!(bt.live(), Some(root));
    }

    #[test]
    fn test_release_once() {
        let mut device = device();
        let (tree, root) = root(&mut device);
        let mut bt = Backtracker::new(1.0, 1);
        bt.release(&mut device, &tree, root).unwrap();
        bt.release(&mut device, &tree, root).unwrap();
        assert_eq!(device.released().len(), 1);
        assert!(bt.ensure_live(&mut device, &tree, root).is_err());
        assert!(bt.release_all_except(&mut device, &tree, None).is_empty());
    }
}
