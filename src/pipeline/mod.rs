//! Pipeline module - hyde regeneration and lex normalization.

mod hyde;
mod lex;

pub use hyde::*;
pub use lex::*;
