//! Quill relay — library interface.
//!
//! Re-exports the decision core, transports, and admission pieces so that
//! integration tests and other crates can programmatically construct a
//! relay.

pub mod admission;
pub mod config;
pub mod decision;
pub mod http;
pub mod interceptor;
pub mod rate_limit;
pub mod sse;
pub mod stdio;

pub use decision::{DecisionCore, Outcome};
pub use http::AppState;
pub use rate_limit::{RateCheck, RateLimiter};
