//! Core services: the response cache, request lifecycle controls, port
//! acquisition, the request dispatcher and the multi-server controller.

pub mod cache;
pub mod http;
pub mod lifecycle;
pub mod multi_server;
pub mod port;
