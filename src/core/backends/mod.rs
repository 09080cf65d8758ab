//! Backend implementations

pub mod openai;
pub mod tgi;

pub use openai::OpenAIBackend;
pub use tgi::TgiBackend;
