//! Tollgate - Token-Bucket Request Admission
//!
//! This crate implements a request-admission gate for HTTP servers. A single
//! token bucket is shared by every request; a tower layer consults it before
//! each call and either forwards the request to the wrapped handler or answers
//! with `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
