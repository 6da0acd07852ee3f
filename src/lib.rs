#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod admin;
pub mod channel;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod logging;
pub mod module;
pub mod paths;
pub mod property;
pub mod qube;
pub mod reconcile;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod testing;
