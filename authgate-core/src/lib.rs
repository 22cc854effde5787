//! authgate core: the decision side of the enforcement proxy.
//!
//! For every inbound request the [`gate::RequestGate`] classifies the path
//! against the [`routes::RouteTable`], authenticates the caller, consults the
//! IAM policy service where the route demands it, writes one audit record and
//! hands back either a rejection or a sanitized forwarding plan. The HTTP
//! plumbing lives in `authgate-proxy`.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod headers;
pub mod policy;
pub mod routes;

pub use error::GateError;
pub use gate::{ForwardPlan, GateRequest, RequestGate, Verdict};
