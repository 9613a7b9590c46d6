//! Process-wide tracing setup shared by jobsdb binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};
