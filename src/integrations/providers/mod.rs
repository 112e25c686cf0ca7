//! Built-in provider implementations.

pub mod github;
pub mod security_hub;
