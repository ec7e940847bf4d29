//! act-runner: fleet worker daemon for a CI coordination server.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod reporter;
pub mod runner;
pub mod session;
