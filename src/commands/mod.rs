pub mod gdbserver_command;
pub mod platform_command;
pub mod slave_command;

use crate::flags::{GdbserverFlags, PlatformFlags, SlaveFlags};
use structopt::StructOpt;

pub use gdbserver_command::GdbserverCommand;
pub use platform_command::PlatformCommand;
pub use slave_command::SlaveCommand;

pub trait StubCommand {
    fn run(&mut self) -> i32;
}

const USAGE: &str = "usage: rvds [gdbserver|platform|slave|version] [options]";

/// Dispatch on the first character of the subcommand, the way the launcher
/// scripts invoke us (`g…`, `p…`, `s…`, `v…`).
pub fn dispatch(args: Vec<String>) -> i32 {
    let subcommand = match args.get(1) {
        Some(subcommand) if !subcommand.is_empty() => subcommand.clone(),
        _ => {
            eprintln!("{}", USAGE);
            return 1;
        }
    };
    // structopt sees the binary name plus everything after the subcommand.
    let rest: Vec<String> = std::iter::once(args[0].clone())
        .chain(args.into_iter().skip(2))
        .collect();

    match subcommand.as_bytes()[0] {
        b'g' => GdbserverCommand::new(GdbserverFlags::from_iter(rest)).run(),
        b'p' => PlatformCommand::new(PlatformFlags::from_iter(rest)).run(),
        b's' => SlaveCommand::new(SlaveFlags::from_iter(rest)).run(),
        b'v' => {
            println!("rvds {}", env!("CARGO_PKG_VERSION"));
            0
        }
        _ => {
            eprintln!("{}", USAGE);
            1
        }
    }
}
