//! HTTP front end of the metrics query service

pub mod api;
pub mod config;
