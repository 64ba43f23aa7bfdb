pub mod adapter;
pub mod adb;
pub mod canvas;
pub mod hierarchy;
pub mod simulated;
pub mod types;

pub use adapter::Device;
pub use adb::AdbDevice;
pub use canvas::{Canvas, GLYPH_SIZE};
pub use simulated::{DeviceCall, SimScreen, SimulatedDevice, Trigger};
pub use types::*;
