//! Turnstile - Distributed Request Admission Controller
//!
//! This crate decides, per request, whether a caller may proceed. Callers are
//! identified by source address or presented token, and their per-second
//! counters and block markers live in a store shared by every instance of
//! the service, so limits hold cluster-wide rather than per process.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
