//! Command output: pretty JSON for scripts, Markdown tables for terminals.

pub mod json;
pub mod markdown;
