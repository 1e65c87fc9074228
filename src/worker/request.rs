use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use mio::{Interest, Token};
use nix::sys::stat::{fstat, FileStat};

use crate::error::OpenErrorClass;
use crate::gopher::{self, ErrorReason};
use crate::session::SessionState;
use reactor::EventLoop;

use super::{cgi, send, SharedWorker};

enum ReadOutcome {
    Continue,
    Disconnected,
    Error,
}

/// The readable sub-path for state `ReadingRequest` (§4.4.3).
pub fn on_readable(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token) {
    match read_into_buffer(worker, token) {
        ReadOutcome::Disconnected => {
            super::disconnect(worker, event_loop, token);
            return;
        }
        ReadOutcome::Error => {
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
            return;
        }
        ReadOutcome::Continue => {}
    }

    let buffer = match worker.borrow().sessions.get(&token) {
        Some(session) => session.buffer.clone(),
        None => return,
    };

    let Some(crlf) = gopher::find_crlf(&buffer) else {
        if buffer.len() >= gopher::MAX_REQUEST_SIZE {
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::BadRequest);
        }
        return;
    };

    let line = &buffer[..crlf];
    let (selector, raw_query) = gopher::split_selector_query(line);
    let query = String::from_utf8_lossy(raw_query).to_string();

    if !gopher::is_selector_safe(selector) {
        super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::Forbidden);
        return;
    }

    let normalized = gopher::normalize_filename(selector);
    let content_root_fd = worker.borrow().content_root.as_raw_fd();

    let file = match openat_relative(content_root_fd, &normalized) {
        Ok(fd) => fd,
        Err(errno) => {
            respond_open_error(worker, event_loop, token, errno);
            return;
        }
    };

    let stat = match fstat(file.as_raw_fd()) {
        Ok(st) => st,
        Err(e) => {
            tracing::warn!(error = %e, "fstat failed");
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
            return;
        }
    };

    if is_directory(&stat) {
        handle_directory(worker, event_loop, token, file, stat, normalized, query);
    } else if is_regular(&stat) {
        finalize_selection(worker, event_loop, token, file, stat, normalized, query);
    } else {
        super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::Forbidden);
    }
}

fn handle_directory(
    worker: &SharedWorker,
    event_loop: &mut EventLoop,
    token: Token,
    dirfd: OwnedFd,
    _dir_stat: FileStat,
    normalized: String,
    query: String,
) {
    let indexfile = worker.borrow().config.indexfile.clone();

    let inner = match openat_relative(dirfd.as_raw_fd(), &indexfile) {
        Ok(fd) => fd,
        Err(errno) => {
            respond_open_error(worker, event_loop, token, errno);
            return;
        }
    };

    let inner_stat = match fstat(inner.as_raw_fd()) {
        Ok(st) => st,
        Err(e) => {
            tracing::warn!(error = %e, "fstat on index file failed");
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
            return;
        }
    };

    if !is_regular(&inner_stat) {
        super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::Forbidden);
        return;
    }

    if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
        session.dirfd = Some(dirfd);
    }

    finalize_selection(worker, event_loop, token, inner, inner_stat, format!("{normalized}/"), query);
}

/// Dispatches to CGI launch or a static-file send, depending on the
/// world-execute bit (§4.4.3 final paragraph).
fn finalize_selection(
    worker: &SharedWorker,
    event_loop: &mut EventLoop,
    token: Token,
    file: OwnedFd,
    stat: FileStat,
    normalized: String,
    query: String,
) {
    let world_executable = stat.st_mode & (libc::S_IXOTH as u32) != 0;

    if world_executable {
        cgi::launch(worker, event_loop, token, file, normalized, query);
        return;
    }

    let size = stat.st_size as u64;

    if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
        session.state = SessionState::SendingFile { file, size, sent: 0 };
        session.touch();
    } else {
        return;
    }

    let mut w = worker.borrow_mut();
    if let Some(session) = w.sessions.get_mut(&token) {
        if event_loop
            .modify_interest(&mut session.socket, token, Interest::WRITABLE)
            .is_err()
        {
            tracing::warn!("failed to switch client socket to writable interest");
        }
        let cb_worker = worker.clone();
        let _ = event_loop.modify_callback(
            token,
            Box::new(move |ev_loop, _event| send::on_writable(&cb_worker, ev_loop, token)),
        );
    }
}

fn respond_open_error(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token, errno: nix::errno::Errno) {
    let reason = match OpenErrorClass::classify(errno) {
        OpenErrorClass::NotFound => ErrorReason::NotFound,
        OpenErrorClass::PermissionDenied => ErrorReason::Forbidden,
        OpenErrorClass::Other => {
            tracing::warn!(error = %errno, "open failed");
            ErrorReason::InternalServerError
        }
    };
    super::send_error_and_disconnect(worker, event_loop, token, reason);
}

fn openat_relative(dirfd: RawFd, path: &str) -> nix::Result<OwnedFd> {
    use nix::fcntl::{openat, OFlag};
    use nix::sys::stat::Mode;

    let raw = openat(dirfd, path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn is_directory(stat: &FileStat) -> bool {
    stat.st_mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
}

fn is_regular(stat: &FileStat) -> bool {
    stat.st_mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
}

fn read_into_buffer(worker: &SharedWorker, token: Token) -> ReadOutcome {
    let mut w = worker.borrow_mut();
    let Some(session) = w.sessions.get_mut(&token) else {
        return ReadOutcome::Disconnected;
    };

    let mut tmp = [0u8; gopher::MAX_REQUEST_SIZE];

    loop {
        if session.buffer.len() >= gopher::MAX_REQUEST_SIZE {
            break;
        }

        match session.socket.read(&mut tmp) {
            Ok(0) => return ReadOutcome::Disconnected,
            Ok(n) => {
                let remaining = gopher::MAX_REQUEST_SIZE - session.buffer.len();
                let take = n.min(remaining);
                session.buffer.extend_from_slice(&tmp[..take]);
                session.touch();
                if take < n {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset || e.kind() == io::ErrorKind::UnexpectedEof => {
                return ReadOutcome::Disconnected
            }
            Err(_) => return ReadOutcome::Error,
        }
    }

    ReadOutcome::Continue
}
