//! CLI support
//!
//! Exit status shared by the `benchlink` binary and scripts driving it.

pub mod exit_codes;

pub use exit_codes::{ExitStatus, Outcome};
