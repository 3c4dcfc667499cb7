//! Subcommand implementations

pub mod catalog;
pub mod query;
pub mod summary;
