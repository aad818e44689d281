// Copyright 2025-2026 CEMAXECUTER LLC

//! Line-oriented TCP control channel for the radio.  The command set is
//! opaque to the receive pipeline; only the FXL load reply is parsed.

pub mod client;
pub mod commands;
pub mod load;

pub use client::MnemonicClient;
pub use load::LoadMonitor;
