//! CGI launch pathway (§4.4.4): fork, argument/env wiring, socket
//! redirection. Grounded on `server.c`'s inline CGI branch of the request
//! handler, generalized to the `reactor::fork_with_pidfd` primitive instead
//! of a raw `sfork()` call.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use mio::unix::SourceFd;
use mio::{Interest, Token};
use nix::sys::signal::Signal;

use crate::gopher::{self, ErrorReason};
use crate::session::SessionState;
use reactor::{fork_with_pidfd, pidfd_send_signal, waitid_pidfd, ForkResult, CLONE_CLEAR_SIGHAND};
use reactor::EventLoop;

use super::SharedWorker;

const ENV_BUFFER_SIZE: usize = 1024;

/// Transitions `ReadingRequest` → `CgiRunning` (§4.4.4). `file` is the
/// already-opened, close-on-exec response-file descriptor for the selected
/// executable.
pub fn launch(
    worker: &SharedWorker,
    event_loop: &mut EventLoop,
    token: Token,
    file: OwnedFd,
    normalized: String,
    query: String,
) {
    let (content_root_fd, indexfile, hostname, port, peer_addr, socket_fd, dirfd) = {
        let w = worker.borrow();
        let Some(session) = w.sessions.get(&token) else { return };
        (
            w.content_root.as_raw_fd(),
            w.config.indexfile.clone(),
            w.config.hostname.clone(),
            w.config.port,
            session.peer_addr.clone(),
            session.socket.as_raw_fd(),
            session.dirfd.as_ref().map(|d| d.as_raw_fd()),
        )
    };

    match fork_with_pidfd(CLONE_CLEAR_SIGHAND) {
        Ok(ForkResult::Child) => {
            run_child(ChildArgs {
                file_fd: file.as_raw_fd(),
                socket_fd,
                content_root_fd,
                dirfd,
                indexfile: &indexfile,
                hostname: &hostname,
                port,
                peer_addr: &peer_addr,
                normalized: &normalized,
                query: &query,
            });
            unreachable!("run_child always exits the process");
        }
        Ok(ForkResult::Parent { pidfd, .. }) => {
            // The parent no longer needs the response file; the child holds
            // its own duplicate across the fork.
            drop(file);

            let pidfd_raw = pidfd.as_raw_fd();
            let cb_worker = worker.clone();
            if let Err(e) = event_loop.add(
                &mut SourceFd(&pidfd_raw),
                Token(pidfd_raw as usize),
                Interest::READABLE,
                Box::new(move |ev_loop, _event| on_pidfd_readable(&cb_worker, ev_loop, token)),
            ) {
                tracing::warn!(error = %e, "failed to register CGI process-descriptor");
                let _ = pidfd_send_signal(pidfd_raw, Signal::SIGKILL);
                super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
                return;
            }

            // Narrow the socket's own interest: mio cannot express "no
            // readable, no writable" directly (epoll always reports
            // EPOLLERR/EPOLLHUP regardless of requested bits), so the
            // callback below keeps the readable registration but ignores
            // everything except a genuine error or full hangup, matching the
            // effective behavior of the edge-triggered-only interest the
            // reference source installs here. `is_read_closed()` must NOT be
            // treated as a hangup: it also fires on EPOLLRDHUP alone, which a
            // client raises by half-closing its write side after sending the
            // request (a legal gopher client pattern) — killing the CGI
            // child on that would cut it off before it can respond.
            let cb_worker = worker.clone();
            let _ = event_loop.modify_callback(
                token,
                Box::new(move |ev_loop, event| {
                    if event.is_error() || event.is_write_closed() {
                        on_client_hangup(&cb_worker, ev_loop, token);
                    }
                }),
            );

            if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
                session.state = SessionState::CgiRunning { pidfd };
                session.touch();
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "fork_with_pidfd failed");
            super::send_error_and_disconnect(worker, event_loop, token, ErrorReason::InternalServerError);
        }
    }
}

/// A readable event on the process-descriptor means the child has exited
/// (§4.4.7). Reap it, then disconnect — `disconnect` removes and closes the
/// pidfd itself.
fn on_pidfd_readable(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token) {
    let pidfd_raw = {
        let w = worker.borrow();
        match w.sessions.get(&token).map(|s| &s.state) {
            Some(SessionState::CgiRunning { pidfd }) => pidfd.as_raw_fd(),
            _ => return,
        }
    };

    match waitid_pidfd(pidfd_raw) {
        Ok(status) => tracing::debug!(status, "CGI child exited"),
        Err(e) => tracing::warn!(error = %e, "waitid on CGI process-descriptor failed"),
    }

    super::disconnect(worker, event_loop, token);
}

/// Client callback, error/hangup sub-path (§4.4.6), wired in only while a
/// session is `CgiRunning` — the other states handle their own hangups
/// inline (`request.rs` treats EOF/reset as a disconnect, `send.rs` treats
/// `EPIPE` the same way).
fn on_client_hangup(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token) {
    let pidfd_raw = {
        let w = worker.borrow();
        match w.sessions.get(&token).map(|s| &s.state) {
            Some(SessionState::CgiRunning { pidfd }) => Some(pidfd.as_raw_fd()),
            _ => None,
        }
    };

    match pidfd_raw {
        Some(raw) => {
            let _ = pidfd_send_signal(raw, Signal::SIGKILL);
        }
        None => super::disconnect(worker, event_loop, token),
    }
}

struct ChildArgs<'a> {
    file_fd: RawFd,
    socket_fd: RawFd,
    content_root_fd: RawFd,
    dirfd: Option<RawFd>,
    indexfile: &'a str,
    hostname: &'a str,
    port: u16,
    peer_addr: &'a str,
    normalized: &'a str,
    query: &'a str,
}

/// Never returns: always exits the process, on success via `execveat`, on
/// any failure via `std::process::exit`.
fn run_child(args: ChildArgs<'_>) -> ! {
    let (command, workdir_fd): (String, RawFd) = if let Some(dirfd) = args.dirfd {
        (args.indexfile.to_string(), dirfd)
    } else {
        match args.normalized.rfind('/') {
            Some(idx) => {
                let prefix = &args.normalized[..idx];
                let command = args.normalized[idx + 1..].to_string();
                match openat_path_dir(args.content_root_fd, prefix) {
                    Ok(fd) => (command, leak_fd(fd)),
                    Err(e) => fail_to_socket(args.socket_fd, &format!("cannot open CGI directory: {e}")),
                }
            }
            None => fail_to_socket(args.socket_fd, "normalized filename has no slash"),
        }
    };

    if unsafe { libc::fchdir(workdir_fd) } < 0 {
        fail_to_socket(args.socket_fd, "fchdir failed");
    }

    let empty_mask = nix::sys::signal::SigSet::empty();
    if let Err(e) = empty_mask.thread_set_mask() {
        fail_to_socket(args.socket_fd, &format!("cannot reset signal mask: {e}"));
    }

    if unsafe { libc::dup2(args.socket_fd, libc::STDOUT_FILENO) } < 0 {
        fail_to_socket(args.socket_fd, "dup2 onto stdout failed");
    }

    let command_c = CString::new(command.clone()).unwrap_or_default();
    let argv = [command_c.as_ptr(), std::ptr::null()];

    let script_name = gopher::script_name(args.normalized);
    let env_selector = truncated_env("SCRIPT_NAME", &script_name);
    let env_query = truncated_env("QUERY_STRING", args.query);
    let env_hostname = truncated_env("SERVER_NAME", args.hostname);
    let env_port = truncated_env("SERVER_PORT", &args.port.to_string());
    let env_address = truncated_env("REMOTE_ADDR", args.peer_addr);

    let envp = [
        env_selector.as_ptr(),
        env_query.as_ptr(),
        env_hostname.as_ptr(),
        env_port.as_ptr(),
        env_address.as_ptr(),
        std::ptr::null(),
    ];

    // `file` was opened close-on-exec; `dup` here produces a copy without
    // CLOEXEC so the `execveat`+`AT_EMPTY_PATH` (the `fexecve` equivalent)
    // below doesn't close it out from under itself mid-syscall.
    let exec_fd = unsafe { libc::dup(args.file_fd) };
    if exec_fd < 0 {
        fail_on_stdout("cannot dup response file for exec");
    }

    let empty_path = CString::new("").unwrap();
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            exec_fd as libc::c_long,
            empty_path.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            libc::AT_EMPTY_PATH as libc::c_long,
        );
    }

    // Only reached if execveat failed.
    fail_on_stdout("exec failed")
}

fn truncated_env(key: &str, value: &str) -> CString {
    let mut s = format!("{key}={value}");
    if s.len() > ENV_BUFFER_SIZE - 1 {
        // Truncate on a char boundary so the CString conversion cannot fail.
        let mut cut = ENV_BUFFER_SIZE - 1;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    CString::new(s).unwrap_or_else(|_| CString::new(format!("{key}=")).unwrap())
}

fn openat_path_dir(dirfd: RawFd, path: &str) -> nix::Result<OwnedFd> {
    use nix::fcntl::{openat, OFlag};
    use nix::sys::stat::Mode;

    let raw = openat(
        dirfd,
        path,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// The prefix directory descriptor must outlive the `fchdir` call; since
/// this function never returns, leaking it is harmless — the whole address
/// space is replaced by `execveat` moments later.
fn leak_fd(fd: OwnedFd) -> RawFd {
    let raw = fd.as_raw_fd();
    std::mem::forget(fd);
    raw
}

fn fail_to_socket(socket_fd: RawFd, reason: &str) -> ! {
    tracing::warn!(reason, "CGI child setup failed");
    let menu = ErrorReason::InternalServerError.to_string();
    unsafe {
        libc::write(socket_fd, menu.as_ptr() as *const libc::c_void, menu.len());
    }
    std::process::exit(1);
}

fn fail_on_stdout(reason: &str) -> ! {
    tracing::warn!(reason, "CGI child exec failed");
    let menu = ErrorReason::InternalServerError.to_string();
    unsafe {
        libc::write(libc::STDOUT_FILENO, menu.as_ptr() as *const libc::c_void, menu.len());
    }
    std::process::exit(1);
}
