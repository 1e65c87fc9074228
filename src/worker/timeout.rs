//! Idle-timeout sweep (§4.4.8), driven by the per-worker interval timer.
//! Grounded on `server.c`'s `server_timer`, including the `TCP_INFO`
//! last-data-sent check used to decide whether an idle-looking CGI session
//! is really idle or just slow to finish.

use std::os::fd::{AsRawFd, RawFd};

use mio::Token;
use nix::sys::signal::Signal;

use crate::gopher::ErrorReason;
use crate::session::SessionState;
use reactor::{pidfd_send_signal, EventLoop};

use super::SharedWorker;

pub fn on_tick(worker: &SharedWorker, event_loop: &mut EventLoop, timer_fd: RawFd) {
    drain_timerfd(timer_fd);

    let timeout = worker.borrow().config.timeout;
    let tokens: Vec<Token> = worker.borrow().sessions.keys().copied().collect();

    for token in tokens {
        let (idle, is_cgi, socket_fd, bytes_sent) = {
            let w = worker.borrow();
            let Some(session) = w.sessions.get(&token) else { continue };
            let (is_cgi, bytes_sent) = match &session.state {
                SessionState::CgiRunning { .. } => (true, 0),
                SessionState::SendingFile { sent, .. } => (false, *sent),
                SessionState::ReadingRequest => (false, 0),
            };
            (session.idle_for().as_secs(), is_cgi, session.socket.as_raw_fd(), bytes_sent)
        };

        if idle < timeout {
            continue;
        }

        if is_cgi {
            if socket_idle_by_tcp_info(socket_fd, timeout) {
                kill_cgi_child(worker, token);
            }
            continue;
        }

        if bytes_sent == 0 {
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::RequestTimeout);
        } else {
            super::disconnect(worker, event_loop, token);
        }
    }
}

fn kill_cgi_child(worker: &SharedWorker, token: Token) {
    let w = worker.borrow();
    if let Some(SessionState::CgiRunning { pidfd }) = w.sessions.get(&token).map(|s| &s.state) {
        let _ = pidfd_send_signal(pidfd.as_raw_fd(), Signal::SIGKILL);
    }
}

/// `true` when the socket's `TCP_INFO` reports no data sent for at least
/// `timeout` seconds, or the metric could not be read at all — in either
/// case the reference source treats the CGI child as genuinely idle rather
/// than merely slow to finish a large response.
fn socket_idle_by_tcp_info(socket_fd: RawFd, timeout: u64) -> bool {
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            socket_fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return true;
    }

    (info.tcpi_last_data_sent as u64) >= timeout * 1000
}

fn drain_timerfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if n <= 0 {
            break;
        }
    }
}
