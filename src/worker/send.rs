//! Writable sub-path for state `SendingFile` (§4.4.5): `sendfile(2)` loop
//! advancing a persistent `sent` offset until the whole file has gone out or
//! the socket would block.

use std::os::fd::AsRawFd;

use mio::Token;

use crate::gopher::ErrorReason;
use crate::session::SessionState;
use reactor::EventLoop;

use super::SharedWorker;

pub fn on_writable(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token) {
    loop {
        let (file_fd, socket_fd, size, sent) = {
            let w = worker.borrow();
            let Some(session) = w.sessions.get(&token) else { return };
            match &session.state {
                SessionState::SendingFile { file, size, sent } => {
                    (file.as_raw_fd(), session.socket.as_raw_fd(), *size, *sent)
                }
                _ => return,
            }
        };

        if sent >= size {
            super::disconnect(worker, event_loop, token);
            return;
        }

        let remaining = size - sent;
        let mut offset: libc::off_t = sent as libc::off_t;

        let ret = unsafe { libc::sendfile(socket_fd, file_fd, &mut offset, remaining as usize) };

        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
                        session.touch();
                    }
                    return;
                }
                Some(libc::EPIPE) => {
                    super::disconnect(worker, event_loop, token);
                    return;
                }
                _ => {
                    tracing::warn!(error = %errno, "sendfile failed");
                    if sent == 0 {
                        super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
                    } else {
                        super::disconnect(worker, event_loop, token);
                    }
                    return;
                }
            }
        }

        let n = ret as u64;
        if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
            if let SessionState::SendingFile { sent, .. } = &mut session.state {
                *sent += n;
            }
            session.touch();
        }

        if n == 0 {
            // Zero-length sendfile with remaining > 0 would otherwise spin.
            super::disconnect(worker, event_loop, token);
            return;
        }
    }
}
