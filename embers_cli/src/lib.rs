//! The `embers` command line: argument parsing and backend wiring.

pub mod backends;
pub mod cli;
