//! `gopherd`: a multi-process, single-threaded-per-process Gopher server.
//!
//! The binary (`src/bin/main.rs`) is a thin shell around this library: parse
//! configuration, install logging, then hand off to either the supervisor
//! (multi-worker) or the worker entry point directly.

pub mod config;
pub mod error;
pub mod gopher;
pub mod logging;
pub mod session;
pub mod supervisor;
pub mod worker;
