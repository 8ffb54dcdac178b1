//! Long-running process support.

pub mod shutdown;
