//! rvds: a GDB/LLDB remote debug stub for RISC-V Linux.
//!
//! The stub mediates between a debugger speaking the GDB Remote Serial
//! Protocol and an inferior process controlled through ptrace. Layers,
//! bottom up: `channel` (byte transports), `session` (framing, queueing,
//! dispatch, delegates), `target` (the process/thread model), `breakpoint`
//! (trap sites and splicing), `arch` (RISC-V decode and payloads), `host`
//! (ptrace and other OS primitives).

#[macro_use]
pub mod log;

pub mod arch;
pub mod breakpoint;
pub mod channel;
pub mod commands;
pub mod error;
pub mod flags;
pub mod host;
pub mod message_queue;
pub mod scoped_fd;
pub mod session;
pub mod target;
pub mod util;
pub mod wait_status;
