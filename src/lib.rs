//! rowpipe - driver-agnostic row streaming and materialization.
//!
//! This library exposes the core modules to the `rowpipe` binary and to
//! integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
