//! Command-line interface

mod commands;

pub use commands::{load_rules, Cli, Commands, ServeArgs};
