#![allow(clippy::new_without_default)]

//! Shared infrastructure used across the gateway crates: logging, time and a
//! small error-handling vocabulary. Mirrors the role `flux` plays for the
//! teacher's game server crates.

pub mod error;
pub mod logging;
pub mod time;
