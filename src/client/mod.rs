//! Generation service client module.

mod generator;
mod llm_client;
mod rate_limiter;

pub use generator::*;
pub use llm_client::*;
pub use rate_limiter::*;
