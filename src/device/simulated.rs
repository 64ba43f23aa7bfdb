//! Deterministic in-memory device used by tests and demos.
//!
//! A `SimulatedDevice` is a graph of named screens. Edges are keyed by a
//! `Trigger` (an action on an element id, or a global action); an action with
//! no edge leaves the screen unchanged. Screens are rendered with `Canvas` so
//! screenshots, grids and digests behave like real captures. Fault injection
//! hooks make execute, capture, snapshot and restore fail on demand.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::adapter::Device;
use super::canvas::Canvas;
use super::types::{Bounds, DeviceError, DeviceResult, Screenshot, SnapshotHandle, UiElement, UiState};
use crate::explore::action::{Action, ActionKind, Direction, GlobalAction};

pub const SIM_WIDTH: u32 = 180;
pub const SIM_HEIGHT: u32 = 320;
const ROW_TOP: i32 = 30;
const ROW_PITCH: i32 = 28;
const ROW_HEIGHT: i32 = 24;
const STATUS_BAR_HEIGHT: i32 = 18;

/// Edge label in the screen graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    Tap(String),
    LongPress(String),
    Scroll(String, Direction),
    /// Any text typed into the element
    Input(String),
    Global(GlobalAction),
}

impl Trigger {
    pub fn tap(id: &str) -> Self {
        Trigger::Tap(id.to_string())
    }

    pub fn long_press(id: &str) -> Self {
        Trigger::LongPress(id.to_string())
    }

    pub fn input(id: &str) -> Self {
        Trigger::Input(id.to_string())
    }

    pub fn back() -> Self {
        Trigger::Global(GlobalAction::Back)
    }

    fn from_action(action: &Action) -> Option<Self> {
        let id = action.target.as_ref().map(|k| k.resource_id.clone());
        Some(match &action.kind {
            ActionKind::Tap => Trigger::Tap(id?),
            ActionKind::LongPress => Trigger::LongPress(id?),
            ActionKind::Scroll(d) => Trigger::Scroll(id?, *d),
            ActionKind::TextInput(_) => Trigger::Input(id?),
            ActionKind::Global(g) => Trigger::Global(*g),
        })
    }
}

/// One node of the screen graph
#[derive(Debug, Clone)]
pub struct SimScreen {
    pub name: String,
    package: String,
    activity: String,
    color: [u8; 3],
    elements: Vec<UiElement>,
    crash: Option<String>,
    clock: bool,
}

impl SimScreen {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let seed = name.bytes().fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Self {
            activity: format!(".{}Activity", name),
            package: "com.example.app".to_string(),
            color: [
                (seed & 0x7f) as u8 + 64,
                ((seed >> 8) & 0x7f) as u8 + 64,
                ((seed >> 16) & 0x7f) as u8 + 64,
            ],
            name,
            elements: Vec::new(),
            crash: None,
            clock: false,
        }
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        for e in &mut self.elements {
            e.package = self.package.clone();
        }
        self
    }

    fn next_row(&self) -> Bounds {
        let top = ROW_TOP + self.elements.len() as i32 * ROW_PITCH;
        Bounds::new(10, top, SIM_WIDTH as i32 - 10, top + ROW_HEIGHT)
    }

    fn push(mut self, element: UiElement) -> Self {
        self.elements.push(element.package(self.package.clone()));
        self
    }

    pub fn button(self, id: &str, text: &str) -> Self {
        let e = UiElement::new("Button", self.next_row()).resource_id(id).text(text).clickable();
        self.push(e)
    }

    pub fn long_button(self, id: &str, text: &str) -> Self {
        let e = UiElement::new("Button", self.next_row())
            .resource_id(id)
            .text(text)
            .clickable()
            .long_clickable();
        self.push(e)
    }

    pub fn input(self, id: &str, hint: &str) -> Self {
        let e = UiElement::new("EditText", self.next_row()).resource_id(id).hint(hint).editable();
        self.push(e)
    }

    pub fn list(self, id: &str) -> Self {
        let e = UiElement::new("ListView", self.next_row()).resource_id(id).scrollable();
        self.push(e)
    }

    pub fn label(self, text: &str) -> Self {
        let e = UiElement::new("TextView", self.next_row()).text(text);
        self.push(e)
    }

    /// Screen shows the app's crash dialog
    pub fn crash(mut self, signature: &str) -> Self {
        self.crash = Some(signature.to_string());
        self
    }

    /// Show a status-bar clock that advances on every capture
    pub fn with_clock(mut self) -> Self {
        self.clock = true;
        self
    }

    fn render(&self, tick: u64) -> DeviceResult<UiState> {
        let mut canvas = Canvas::with_color(SIM_WIDTH, SIM_HEIGHT, self.color);
        let mut elements = Vec::new();

        if self.clock {
            let time = format!("10:{:02}", tick % 60);
            canvas.draw_rect(0, 0, SIM_WIDTH, STATUS_BAR_HEIGHT as u32, [0, 0, 0]);
            canvas.draw_text(4, 5, &time, [255, 255, 255], [0, 0, 0]);
            elements.push(
                UiElement::new("TextView", Bounds::new(0, 0, SIM_WIDTH as i32, STATUS_BAR_HEIGHT))
                    .text(time)
                    .package(self.package.clone()),
            );
        }

        for e in &self.elements {
            let b = e.bounds;
            let (x, y, w, h) = (b.left as u32, b.top as u32, b.width() as u32, b.height() as u32);
            canvas.draw_rect(x, y, w, h, [240, 240, 240]);
            canvas.draw_outline(x, y, w, h, 1, [30, 30, 30]);
            canvas.draw_text(x + 4, y + 8, &e.label(), [0, 0, 0], [240, 240, 240]);
        }
        elements.extend(self.elements.iter().cloned());

        if let Some(sig) = &self.crash {
            canvas.draw_rect(20, 120, SIM_WIDTH - 40, 60, [200, 0, 0]);
            canvas.draw_text(28, 140, "has stopped", [255, 255, 255], [200, 0, 0]);
            canvas.draw_text(28, 156, sig, [255, 255, 255], [200, 0, 0]);
        }

        let png = canvas.to_png()?;
        Ok(UiState {
            elements,
            screenshot: Screenshot::from_png(png)?,
            package: self.package.clone(),
            activity: Some(format!("{}{}", self.package, self.activity)),
            crash: self.crash.clone(),
        })
    }
}

/// A device call observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Execute(String),
    Capture,
    Snapshot(String),
    Restore(String),
    Release(String),
    Relaunch,
}

#[derive(Debug, Default)]
struct Faults {
    failing_triggers: HashSet<Trigger>,
    fail_captures: usize,
    fail_snapshots: usize,
    fail_restores: usize,
    fail_relaunches: usize,
    misroute_restores: Option<String>,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    screens: HashMap<String, SimScreen>,
    edges: HashMap<(String, Trigger), String>,
    start: String,
    current: String,
    snapshots: HashMap<String, String>,
    next_snapshot: u64,
    tick: u64,
    calls: Vec<DeviceCall>,
    released: Vec<SnapshotHandle>,
    faults: Faults,
}

impl SimulatedDevice {
    /// Create a device showing `start`
    pub fn new(start: SimScreen) -> Self {
        let current = start.name.clone();
        let mut screens = HashMap::new();
        screens.insert(current.clone(), start);
        Self {
            screens,
            edges: HashMap::new(),
            start: current.clone(),
            current,
            snapshots: HashMap::new(),
            next_snapshot: 0,
            tick: 0,
            calls: Vec::new(),
            released: Vec::new(),
            faults: Faults::default(),
        }
    }

    pub fn with_screen(mut self, screen: SimScreen) -> Self {
        self.screens.insert(screen.name.clone(), screen);
        self
    }

    /// Add an edge: `trigger` on screen `from` leads to screen `to`
    pub fn with_edge(mut self, from: &str, trigger: Trigger, to: &str) -> Self {
        self.edges.insert((from.to_string(), trigger), to.to_string());
        self
    }

    /// Make every execution of `trigger` fail
    pub fn fail_action(&mut self, trigger: Trigger) {
        self.faults.failing_triggers.insert(trigger);
    }

    pub fn fail_next_captures(&mut self, n: usize) {
        self.faults.fail_captures = n;
    }

    pub fn fail_next_snapshots(&mut self, n: usize) {
        self.faults.fail_snapshots = n;
    }

    pub fn fail_next_restores(&mut self, n: usize) {
        self.faults.fail_restores = n;
    }

    pub fn fail_next_relaunches(&mut self, n: usize) {
        self.faults.fail_relaunches = n;
    }

    /// Make restores report success but land on `screen` instead
    pub fn misroute_restores_to(&mut self, screen: Option<&str>) {
        self.faults.misroute_restores = screen.map(str::to_string);
    }

    pub fn current_screen(&self) -> &str {
        &self.current
    }

    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Display strings of every executed action, in order
    pub fn executed(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Execute(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    pub fn released(&self) -> &[SnapshotHandle] {
        &self.released
    }

    fn render_current(&mut self) -> DeviceResult<UiState> {
        self.tick += 1;
        let screen = self
            .screens
            .get(&self.current)
            .ok_or_else(|| DeviceError::Emulator(format!("unknown screen '{}'", self.current)))?;
        screen.render(self.tick)
    }
}

impl Device for SimulatedDevice {
    fn execute(&mut self, action: &Action) -> DeviceResult<UiState> {
        self.calls.push(DeviceCall::Execute(action.to_string()));
        let fail = |reason: &str| DeviceError::ActionExecution {
            action: action.to_string(),
            reason: reason.to_string(),
        };

        if action.needs_input() {
            return Err(fail("no text value was synthesized"));
        }
        let trigger = Trigger::from_action(action).ok_or_else(|| fail("action has no target element"))?;
        if self.faults.failing_triggers.contains(&trigger) {
            return Err(fail("injected failure"));
        }

        if let Some(key) = &action.target {
            let screen = self
                .screens
                .get(&self.current)
                .ok_or_else(|| DeviceError::Emulator(format!("unknown screen '{}'", self.current)))?;
            let present = screen.elements.iter().any(|e| e.resource_id == key.resource_id && e.bounds == key.bounds);
            if !present {
                return Err(fail("target element is not on screen"));
            }
        }

        if let Some(next) = self.edges.get(&(self.current.clone(), trigger)) {
            debug!(from = %self.current, to = %next, "simulated transition");
            self.current = next.clone();
        }
        self.render_current()
    }

    fn capture(&mut self) -> DeviceResult<UiState> {
        self.calls.push(DeviceCall::Capture);
        if self.faults.fail_captures > 0 {
            self.faults.fail_captures -= 1;
            return Err(DeviceError::Emulator("injected capture failure".to_string()));
        }
        self.render_current()
    }

    fn snapshot(&mut self) -> DeviceResult<SnapshotHandle> {
        self.next_snapshot += 1;
        let handle = SnapshotHandle(format!("sim-{}", self.next_snapshot));
        self.calls.push(DeviceCall::Snapshot(handle.0.clone()));
        if self.faults.fail_snapshots > 0 {
            self.faults.fail_snapshots -= 1;
            return Err(DeviceError::Emulator("injected snapshot failure".to_string()));
        }
        self.snapshots.insert(handle.0.clone(), self.current.clone());
        Ok(handle)
    }

    fn restore(&mut self, handle: &SnapshotHandle) -> DeviceResult<()> {
        self.calls.push(DeviceCall::Restore(handle.0.clone()));
        if self.faults.fail_restores > 0 {
            self.faults.fail_restores -= 1;
            return Err(DeviceError::Emulator("injected restore failure".to_string()));
        }
        let screen = self
            .snapshots
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| DeviceError::Emulator(format!("unknown snapshot '{}'", handle)))?;
        self.current = self.faults.misroute_restores.clone().unwrap_or(screen);
        Ok(())
    }

    fn release(&mut self, handle: &SnapshotHandle) -> DeviceResult<()> {
        self.calls.push(DeviceCall::Release(handle.0.clone()));
        self.snapshots
            .remove(&handle.0)
            .ok_or_else(|| DeviceError::Emulator(format!("unknown snapshot '{}'", handle)))?;
        self.released.push(handle.clone());
        Ok(())
    }

    fn relaunch(&mut self) -> DeviceResult<()> {
        self.calls.push(DeviceCall::Relaunch);
        if self.faults.fail_relaunches > 0 {
            self.faults.fail_relaunches -= 1;
            return Err(DeviceError::Emulator("injected relaunch failure".to_string()));
        }
        self.current = self.start.clone();
        Ok(())
    }

    fn source_type(&self) -> String {
        "simulated".to_string()
    }
}
