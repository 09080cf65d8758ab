//! API data models
//!
//! This module contains data structures for the OpenAI-compatible chat API
//! and the TGI native generation API.

pub mod openai;
pub mod tgi;
