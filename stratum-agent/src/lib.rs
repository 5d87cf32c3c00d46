//! Upstream pool session for an aggregating Stratum mining proxy.

pub mod config;
pub mod daemon;
pub mod tracing;
pub mod upstream;
