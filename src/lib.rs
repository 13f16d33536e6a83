pub mod branch;
pub mod catalog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod launch;
pub mod manifest;
pub mod observer;
pub mod orchestrator;
pub mod snapshot;
pub mod status;
pub mod steam;
