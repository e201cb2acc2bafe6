//! HTTP service: routing, admission control and error bodies.
//!
//! ## Structure
//!
//! - [`handler`] - shared state, router, health endpoint, request ids.
//! - [`admission`] - per-request token-bucket admission middleware.
//! - [`problem`] - `application/problem+json` responses.

pub mod admission;
pub mod handler;
pub mod problem;
