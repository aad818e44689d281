// Copyright 2025-2026 CEMAXECUTER LLC

//! Frontend for the Polaris receive pipeline: configuration, the radio
//! source facade, and the dataflow pull interface.

pub mod config;
pub mod source;

pub use config::SourceConfig;
pub use source::PolarisSource;
