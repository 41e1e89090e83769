pub mod delegate;
pub mod debug_session;
pub mod file_ops;
pub mod launch;
pub mod packet;
pub mod platform_session;
pub mod queue_channel;
pub mod session;
pub mod stop_reply;

pub use delegate::SessionDelegate;
pub use session::Session;

/// Which dialect of the remote protocol the peer speaks. The LLDB dialect
/// adds key:value stop replies, qRegisterInfo, qHostInfo and friends; the
/// classic GDB dialect sticks to the baseline packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompatibilityMode {
    Gdb,
    Lldb,
}
