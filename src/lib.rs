//! Sandbay - dynamic malware analysis sandbox
//!
//! This crate provides both halves of an analysis run:
//! - In-guest agent that runs static, behavior and network tasks under one deadline
//! - Host session driver that boots, feeds, collects from and reverts a sandbox
//! - Control channel between the two (HTTP, session-id correlated)
//! - Memory forensics pipeline over the captured guest memory

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod forensics;
pub mod host;
pub mod machine;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};
