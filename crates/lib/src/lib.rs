//! cligate core library: decides whether and how a wrapped command-line tool may be
//! invoked on behalf of an authenticated actor, runs it under time and output bounds,
//! and records every attempt in an append-only audit trail.
//!
//! Pipeline per request: [`validator`] → [`ratelimit`] → [`executor`] → [`result`],
//! with [`audit`] fed at every exit point. [`gate`] wires the stages together and
//! [`gateway`] exposes them over HTTP and WebSocket.

pub mod audit;
pub mod config;
pub mod executor;
pub mod gate;
pub mod gateway;
pub mod init;
pub mod ratelimit;
pub mod registry;
pub mod request;
pub mod result;
pub mod validator;
