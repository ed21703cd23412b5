//! kcache CLI - package, extract and check Triton kernel cache images.

pub mod commands;
pub mod output;
