pub mod process;
pub mod thread;

pub use process::{Process, ResumeAction, ResumeKind, StopEvent};
pub use thread::{StopReason, Thread, ThreadState};
