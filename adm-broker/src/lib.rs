//! Agent Dispatch Manager: multiplexes short-running per-workspace tasks
//! from an orchestration backend to external IDE/CLI agent runners, either
//! over a persistent WebSocket session or short poll-based REST calls.

#[macro_use]
extern crate tracing;

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod http;
pub mod model;
pub mod store;

#[cfg(feature = "openapi")]
pub mod openapi;

use std::sync::Arc;

use broker::BrokerHandle;
use config::Conf;

/// Shared application state handed to every axum handler: a cheap handle
/// to the broker actor plus the resolved configuration snapshot it was
/// built from.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub conf: Arc<Conf>,
}
