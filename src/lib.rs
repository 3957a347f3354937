#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod archive;
pub mod cleanup;
pub mod cli;
pub mod clone;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod package;
pub mod paths;
pub mod platform;
pub mod power;
pub mod registry;
pub mod tail;
pub mod transport;
pub mod vmx;
