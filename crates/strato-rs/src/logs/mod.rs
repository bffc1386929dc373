//! Structured logging setup.

pub mod logger;
