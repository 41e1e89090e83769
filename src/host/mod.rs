pub mod daemon;
pub mod elf;
pub mod file;
pub mod platform;
pub mod ptrace;
pub mod spawner;
pub mod wait_interrupter;
