//! authgate HTTP enforcement proxy.
//!
//! The decision logic lives in `authgate-core`; this crate supplies the
//! hyper server, the tower service stack and the upstream client.

pub mod error;
pub mod logging_layer;
pub mod proxy_config;
pub mod proxy_service;
pub mod server;
