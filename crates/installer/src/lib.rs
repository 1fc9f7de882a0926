//! Homelab CLI library.
//!
//! Command implementations and configuration resolution behind the
//! `homelab` binary.

#![allow(clippy::doc_markdown)]

pub mod commands;
pub mod config;
pub mod ui;

pub use commands::Globals;
pub use config::{ConnectionArgs, K3sArgs, K3sSettings, Target};
