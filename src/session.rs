//! Per-client session state (§3 of the design). A session is in exactly one
//! sub-state at a time; the state enum carries exactly the state-specific
//! descriptors, while the directory descriptor lives alongside it because it
//! may be held across either outcome of a directory selector (it is set as
//! soon as a selector resolves to a directory, independent of whether the
//! directory's index file turns out to be executable or not).

use std::os::fd::OwnedFd;
use std::time::Instant;

use mio::net::TcpStream;

pub enum SessionState {
    ReadingRequest,
    SendingFile { file: OwnedFd, size: u64, sent: u64 },
    CgiRunning { pidfd: OwnedFd },
}

pub struct Session {
    pub socket: TcpStream,
    pub peer_addr: String,
    pub last_activity: Instant,
    pub buffer: Vec<u8>,
    pub state: SessionState,
    /// Set once a selector resolves to a directory; released on disconnect
    /// regardless of which state the session ends up in.
    pub dirfd: Option<OwnedFd>,
}

impl Session {
    pub fn new(socket: TcpStream, peer_addr: String) -> Self {
        Session {
            socket,
            peer_addr,
            last_activity: Instant::now(),
            buffer: Vec::with_capacity(super::gopher::MAX_REQUEST_SIZE),
            state: SessionState::ReadingRequest,
            dirfd: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}
