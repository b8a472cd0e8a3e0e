//! The `amrsurf` command
//!
//! Argument parsing, input-file overrides and the snapshot loop behind the
//! binary. Exposed as a library so the driver can be exercised directly.

pub mod args;
pub mod config;
pub mod run;

pub use args::Cli;
pub use config::{default_outpath, FileConfig, Settings};
pub use run::{process_snapshot, run, SnapshotReport};
