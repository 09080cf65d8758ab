//! HTTP API
//!
//! Routes, handlers and error responses.

pub mod endpoints;
pub mod error;
