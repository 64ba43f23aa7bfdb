pub mod reader;
pub mod recorder;
pub mod types;

pub use reader::{RunLog, read_run};
pub use recorder::RunRecorder;
pub use types::*;
