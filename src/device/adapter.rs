//! Device adapter abstraction.
//!
//! The explorer drives exactly one device through this trait. Every call is
//! made from the explorer's thread, so implementations only need `Send`.
//! - `AdbDevice` for a real emulator reached through `adb`
//! - `SimulatedDevice` for tests and demos

use super::types::{DeviceResult, SnapshotHandle, UiState};
use crate::explore::action::Action;

pub trait Device: Send {
    /// Apply an action to the live app and capture the resulting state
    fn execute(&mut self, action: &Action) -> DeviceResult<UiState>;

    /// Capture the current state without changing it
    fn capture(&mut self) -> DeviceResult<UiState>;

    /// Pin the current device state and return a handle to it
    fn snapshot(&mut self) -> DeviceResult<SnapshotHandle>;

    /// Return the device to a pinned state
    fn restore(&mut self, handle: &SnapshotHandle) -> DeviceResult<()>;

    /// Free a pinned state; the handle must not be used afterwards
    fn release(&mut self, handle: &SnapshotHandle) -> DeviceResult<()>;

    /// Stop the app and start it again from its launch screen
    fn relaunch(&mut self) -> DeviceResult<()>;

    /// Identifier written to the run record (e.g. "adb:emulator-5554")
    fn source_type(&self) -> String;
}
