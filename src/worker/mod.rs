//! The worker process: listener, per-client state machine, CGI launch and
//! supervision, idle-timeout sweep (§4.4). Roughly 55% of the system by the
//! design's own reckoning, and the part with no single counterpart in the
//! teacher repo's broken `Server` — generalized instead from `server.c` in
//! its entirety, expressed with `mio`'s reactor rather than raw `epoll`.

mod cgi;
mod listener;
mod request;
mod send;
mod timeout;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use nix::sys::stat::fstat;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::config::Config;
use crate::error::{GopherError, Result};
use crate::gopher::ErrorReason;
use crate::session::Session;
use reactor::EventLoop;

/// `SERVER_FIXED` in the reference source: stdio + listener + signalfd +
/// timerfd + content-root fd + headroom for one in-flight accept/CGI dup.
const SERVER_FIXED: u64 = 10;
/// Per client: socket, response file, directory, process-descriptor.
const PER_CLIENT: u64 = 4;

pub struct Worker {
    pub config: Config,
    pub content_root: OwnedFd,
    pub listener: TcpListener,
    pub sessions: HashMap<Token, Session>,
    pub client_count: u32,
}

pub type SharedWorker = Rc<RefCell<Worker>>;

pub fn run(config: Config) -> Result<()> {
    let _span = crate::logging::enter_pid_span();

    setup_signals()?;
    raise_fd_limit(config.maxclients)?;

    let content_root = open_content_root(&config)?;
    let listener = open_listener(config.port)?;

    let mut sigmask = SigSet::empty();
    sigmask.add(Signal::SIGTERM);
    sigmask
        .thread_block()
        .map_err(GopherError::from)?;
    let signal_fd = SignalFd::with_flags(&sigmask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(GopherError::from)?;

    let timer_fd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC)
        .map_err(GopherError::from)?;
    timer_fd
        .set(
            Expiration::Interval(nix::sys::time::TimeSpec::new(config.timeout as i64, 0)),
            TimerSetTimeFlags::empty(),
        )
        .map_err(GopherError::from)?;

    let worker: SharedWorker = Rc::new(RefCell::new(Worker {
        config,
        content_root,
        listener,
        sessions: HashMap::new(),
        client_count: 0,
    }));

    let mut event_loop = EventLoop::create(worker.borrow().config.maxclients as usize + 16)
        .map_err(GopherError::from)?;

    let listener_token = {
        let mut w = worker.borrow_mut();
        let token = Token(w.listener.as_raw_fd() as usize);
        let cb_worker = worker.clone();
        event_loop
            .add(
                &mut w.listener,
                token,
                Interest::READABLE,
                Box::new(move |ev_loop, _event| listener::on_readable(&cb_worker, ev_loop)),
            )
            .map_err(GopherError::from)?;
        token
    };

    let signal_raw = signal_fd.as_raw_fd();
    let signal_token = Token(signal_raw as usize);
    {
        let cb_worker = worker.clone();
        event_loop
            .add(
                &mut SourceFd(&signal_raw),
                signal_token,
                Interest::READABLE,
                Box::new(move |ev_loop, _event| on_signal(&cb_worker, ev_loop, signal_raw)),
            )
            .map_err(GopherError::from)?;
    }

    let timer_raw = timer_fd.as_raw_fd();
    let timer_token = Token(timer_raw as usize);
    {
        let cb_worker = worker.clone();
        event_loop
            .add(
                &mut SourceFd(&timer_raw),
                timer_token,
                Interest::READABLE,
                Box::new(move |ev_loop, _event| timeout::on_tick(&cb_worker, ev_loop, timer_raw)),
            )
            .map_err(GopherError::from)?;
    }

    tracing::info!(port = worker.borrow().config.port, "worker listening");

    event_loop.run(None, None).map_err(GopherError::from)?;

    cleanup(&worker, &mut event_loop);
    let _ = listener_token;

    Ok(())
}

fn on_signal(worker: &SharedWorker, event_loop: &mut EventLoop, fd: RawFd) {
    // Drain the signalfd. We only ever multiplex SIGTERM here, so a single
    // successful read is enough to know shutdown was requested.
    let mut siginfo: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    loop {
        let n = unsafe {
            libc::read(
                fd,
                &mut siginfo as *mut _ as *mut libc::c_void,
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n <= 0 {
            break;
        }
    }

    tracing::info!("received SIGTERM, shutting down");
    cleanup(worker, event_loop);
    event_loop.stop();
}

/// Kills remaining CGI children, then disconnects every live session in
/// order, releasing descriptors per §4.4.10.
fn cleanup(worker: &SharedWorker, event_loop: &mut EventLoop) {
    let tokens: Vec<Token> = worker.borrow().sessions.keys().copied().collect();
    for token in tokens {
        let is_cgi = matches!(
            worker.borrow().sessions.get(&token).map(|s| &s.state),
            Some(crate::session::SessionState::CgiRunning { .. })
        );
        if is_cgi {
            if let Some(crate::session::SessionState::CgiRunning { pidfd }) =
                worker.borrow().sessions.get(&token).map(|s| &s.state)
            {
                let _ = reactor::pidfd_send_signal(pidfd.as_raw_fd(), Signal::SIGKILL);
            }
        }
        disconnect(worker, event_loop, token);
    }
}

/// The disconnect routine (§4.4.10): closes the response-file descriptor if
/// set, the directory descriptor if set, the process-descriptor if set
/// (removed from the loop first), then the socket (removed from the loop),
/// unlinks the session and decrements the client count. All of the
/// "closing" happens implicitly: each `OwnedFd` is dropped in the order
/// pulled out of the session.
pub fn disconnect(worker: &SharedWorker, event_loop: &mut EventLoop, token: Token) {
    let session = worker.borrow_mut().sessions.remove(&token);
    let Some(mut session) = session else { return };

    match std::mem::replace(&mut session.state, crate::session::SessionState::ReadingRequest) {
        crate::session::SessionState::SendingFile { file, .. } => drop(file),
        crate::session::SessionState::CgiRunning { pidfd } => {
            let raw = pidfd.as_raw_fd();
            let _ = event_loop.remove(&mut SourceFd(&raw), Token(raw as usize));
            drop(pidfd);
        }
        crate::session::SessionState::ReadingRequest => {}
    }

    if let Some(dirfd) = session.dirfd.take() {
        drop(dirfd);
    }

    let _ = event_loop.remove(&mut session.socket, token);
    drop(session);

    worker.borrow_mut().client_count -= 1;
}

/// Writes a gopher error menu and disconnects the session (used by every
/// error path that has not yet sent any response bytes: bad request,
/// forbidden, not found, internal error, request timeout). The write is
/// best-effort — the socket is non-blocking and the menu is a handful of
/// bytes, so a short write here just means the client sees a truncated
/// error, which is no worse than the silent-disconnect alternative.
pub fn send_error_and_disconnect(
    worker: &SharedWorker,
    event_loop: &mut EventLoop,
    token: Token,
    reason: ErrorReason,
) {
    let menu = reason.to_string();
    if let Some(session) = worker.borrow_mut().sessions.get_mut(&token) {
        let _ = std::io::Write::write_all(&mut session.socket, menu.as_bytes());
    }
    disconnect(worker, event_loop, token);
}

fn setup_signals() -> Result<()> {
    unsafe {
        nix::sys::signal::signal(Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)
            .map_err(GopherError::from)?;
        nix::sys::signal::signal(Signal::SIGCHLD, nix::sys::signal::SigHandler::SigIgn)
            .map_err(GopherError::from)?;
    }

    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0) };
    if ret < 0 {
        return Err(GopherError::Io(std::io::Error::last_os_error()));
    }

    Ok(())
}

fn raise_fd_limit(max_clients: u32) -> Result<()> {
    let required = SERVER_FIXED + (max_clients as u64) * PER_CLIENT;
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(GopherError::from)?;

    if hard < required {
        return Err(GopherError::Fatal(format!(
            "hard file descriptor limit {hard} is below the required {required}"
        )));
    }

    if soft < required {
        setrlimit(Resource::RLIMIT_NOFILE, required, hard).map_err(GopherError::from)?;
    }

    Ok(())
}

fn open_content_root(config: &Config) -> Result<OwnedFd> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    let raw = open(
        &config.directory,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(GopherError::from)?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let st = fstat(fd.as_raw_fd()).map_err(GopherError::from)?;
    let world_readable = st.st_mode & libc::S_IROTH != 0;
    let world_executable = st.st_mode & libc::S_IXOTH != 0;
    if !world_readable || !world_executable {
        return Err(GopherError::Fatal(format!(
            "content root {} must be world-readable and world-executable",
            config.directory.display()
        )));
    }

    Ok(fd)
}

fn open_listener(port: u16) -> Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(GopherError::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(GopherError::from)?;
    socket::setsockopt(&fd, sockopt::ReusePort, &true).map_err(GopherError::from)?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr).map_err(GopherError::from)?;
    socket::listen(&fd, Backlog::new(256).map_err(GopherError::from)?).map_err(GopherError::from)?;

    let std_listener: std::net::TcpListener = fd.into();
    Ok(TcpListener::from_std(std_listener))
}
