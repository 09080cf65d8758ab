//! Conversion between the chat API and the TGI generation API

pub mod request_converter;
pub mod response_converter;
pub mod stop;
