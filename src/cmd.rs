//! Subcommands of the `opstats` binary.

mod convert_cmd;

pub use convert_cmd::*;
