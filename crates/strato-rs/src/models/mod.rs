//! Data models shared across the framework: configuration, routes,
//! request/response state, errors, IPC envelopes and worker records.

pub mod config;
pub mod context;
pub mod error;
pub mod ipc;
pub mod route;
pub mod worker;
