//! Long-running mode: scheduler plus signal handling.

pub mod shutdown;
