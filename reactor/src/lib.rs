//! Generic readiness-based event demultiplexer, a formatted-write buffer, and
//! the process-fork-with-pidfd primitive shared by `gopherd` and `gopherlist`.
//!
//! This crate is the leaf of the workspace: everything here is reusable
//! independently of gopher semantics, mirroring how `server.c`'s `sepoll`,
//! `sbuffer` and `sfork` modules had no knowledge of the protocol built on
//! top of them.

pub mod event_loop;
pub mod procfork;
pub mod write_buffer;

pub use event_loop::{Callback, EventLoop, LoopError};
pub use procfork::{fork_with_pidfd, pidfd_send_signal, waitid_pidfd, ForkResult, CLONE_CLEAR_SIGHAND};
pub use write_buffer::WriteBuffer;
