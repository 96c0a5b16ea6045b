#![forbid(unsafe_code)]

//! Small helpers shared by the `ModHost` crates.

pub mod duration;

pub use duration::{DurationParseError, parse_duration};
