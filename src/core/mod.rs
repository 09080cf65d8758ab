//! Core application modules
//!
//! This module contains configuration, logging, validation, the backend
//! abstraction and its implementations, and request bookkeeping.

pub mod backend;
pub mod backends;
pub mod config;
pub mod constants;
pub mod logging;
pub mod requests;
pub mod retry;
pub mod sse;
pub mod template;
pub mod validation;
