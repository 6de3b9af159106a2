//! Prodex CLI library

pub mod commands;
pub mod error;
pub mod meta;
