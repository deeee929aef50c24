//! Low-level file and clock helpers shared by the dicebot crates.
//!
//! Endpoint bootstrap and registry persistence rely on these to write state
//! without exposing half-written files to the protocol client process.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{remove_file_if_exists, write_text_atomic};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, elapsed_since_unix_ms};
