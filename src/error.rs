//! Crate-wide error type.
//!
//! The reference implementation's `CleanError` wraps any `Box<dyn Error>`
//! and is never matched on — every call site just propagates it with `?` up
//! to `main`. This server's call sites need to distinguish error *kinds*
//! (an `openat` failure must become a 404, a 403, or a 500 depending on
//! errno), so `GopherError` is a proper enum instead of an opaque box, while
//! keeping the same `Display`/`From` ergonomics.

use std::fmt;

#[derive(Debug)]
pub enum GopherError {
    Io(std::io::Error),
    Nix(nix::errno::Errno),
    Config(String),
    Fatal(String),
}

impl fmt::Display for GopherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GopherError::Io(e) => write!(f, "{e}"),
            GopherError::Nix(e) => write!(f, "{e}"),
            GopherError::Config(msg) => write!(f, "configuration error: {msg}"),
            GopherError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for GopherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GopherError::Io(e) => Some(e),
            GopherError::Nix(e) => Some(e),
            GopherError::Config(_) | GopherError::Fatal(_) => None,
        }
    }
}

impl From<std::io::Error> for GopherError {
    fn from(e: std::io::Error) -> Self {
        GopherError::Io(e)
    }
}

impl From<nix::errno::Errno> for GopherError {
    fn from(e: nix::errno::Errno) -> Self {
        GopherError::Nix(e)
    }
}

impl From<reactor::LoopError> for GopherError {
    fn from(e: reactor::LoopError) -> Self {
        match e {
            reactor::LoopError::Io(io) => GopherError::Io(io),
            other => GopherError::Fatal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GopherError>;

/// Errno classes that matter to the request path: every other errno is
/// folded into the generic I/O error case and answered with 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenErrorClass {
    NotFound,
    PermissionDenied,
    Other,
}

impl OpenErrorClass {
    pub fn classify(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::ENOENT => OpenErrorClass::NotFound,
            nix::errno::Errno::EACCES => OpenErrorClass::PermissionDenied,
            _ => OpenErrorClass::Other,
        }
    }
}
