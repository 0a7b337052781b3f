//! The `utils` module provides the definitions shared across `fmrelay`:
//! the error types for every failure class and the logging bootstrap.

pub mod error;
pub mod logging;
