//! Stratum CLI - build container images from registries, OCI layouts and hubs.

pub mod commands;
pub mod output;
