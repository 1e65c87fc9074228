//! Process-wide logging to standard error.
//!
//! The reference implementation prefixes nearly every log line with the raw
//! pid (`fprintf(stderr, "%i - ...", getpid(), ...)`); the closest
//! `tracing`-idiomatic equivalent is a span entered for the lifetime of each
//! process with the pid as a field, rather than reimplementing that
//! formatting by hand the way `proxy_log`'s dead macro crate did.
//!
//! The subscriber is installed exactly once, in the very first process
//! (`main`, before any fork). Workers and the supervisor are separate
//! processes sharing that installation across `fork()`, but each enters its
//! *own* pid span afterward — entering happens per-process, not per-install,
//! since a span entered before forking would otherwise keep reporting the
//! parent's pid in every child.

use tracing::span::EnteredSpan;
use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

/// Enters (and returns, to keep alive for the process lifetime) a span
/// carrying this process's pid as a field.
pub fn enter_pid_span() -> EnteredSpan {
    tracing::info_span!("gopherd", pid = std::process::id()).entered()
}
