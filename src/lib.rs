//! Gatekeeper - Login Rate Limiting
//!
//! This crate tracks failed authentication attempts per client IP and per
//! username, and blocks identities that exceed a failure threshold inside a
//! sliding window. Blocks grow exponentially with each repeated burst until
//! a successful login. State lives either in process memory or in Redis so
//! several service instances can share it.

pub mod config;
pub mod error;
pub mod ratelimit;
