//! The supervisor (§4.5): spawns `W` workers, routes SIGTERM to them, reaps
//! them via process-descriptors, and exits once all are reaped. Grounded on
//! `main.c`'s `struct supervisor` and its two event-loop callbacks.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use mio::unix::SourceFd;
use mio::{Interest, Token};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::config::Config;
use crate::error::{GopherError, Result};
use reactor::{fork_with_pidfd, pidfd_send_signal, waitid_pidfd, EventLoop, ForkResult};

struct WorkerHandle {
    index: usize,
    pid: nix::unistd::Pid,
    pidfd: Option<OwnedFd>,
}

struct Supervisor {
    workers: Vec<WorkerHandle>,
    active: usize,
}

/// Spawns `config.workers` worker processes and runs the supervisor's own
/// event loop until every one of them has exited. Each worker process never
/// returns from this function — it runs [`crate::worker::run`] instead and
/// exits the process directly.
pub fn run(config: Config) -> Result<()> {
    redirect_stdio_to_devnull()?;

    let mut workers = Vec::with_capacity(config.workers);

    for index in 0..config.workers {
        match fork_with_pidfd(0) {
            Ok(ForkResult::Child) => {
                // The rest of the supervisor's bookkeeping (`workers`, any
                // already-spawned siblings' handles) belongs to the parent
                // only; this process becomes a worker and never returns.
                drop(workers);
                let exit_code = match crate::worker::run(config.clone()) {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!(error = %e, "worker exited with an error");
                        1
                    }
                };
                std::process::exit(exit_code);
            }
            Ok(ForkResult::Parent { child, pidfd }) => {
                tracing::info!(index, pid = child.as_raw(), "spawned worker");
                workers.push(WorkerHandle {
                    index,
                    pid: child,
                    pidfd: Some(pidfd),
                });
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "failed to fork worker");
            }
        }
    }

    if workers.is_empty() {
        return Err(GopherError::Fatal("no worker processes could be started".into()));
    }
    if workers.len() < config.workers {
        tracing::warn!(
            spawned = workers.len(),
            requested = config.workers,
            "not all requested workers could be started"
        );
    }

    let active = workers.len();
    let mut supervisor = Supervisor { workers, active };

    let mut sigmask = SigSet::empty();
    sigmask.add(Signal::SIGTERM);
    sigmask.thread_block().map_err(GopherError::from)?;
    let signal_fd = SignalFd::with_flags(&sigmask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(GopherError::from)?;

    let mut event_loop = EventLoop::create(supervisor.workers.len() + 1).map_err(GopherError::from)?;

    for handle in &supervisor.workers {
        let Some(pidfd) = &handle.pidfd else { continue };
        let raw = pidfd.as_raw_fd();
        let index = handle.index;
        event_loop
            .add(
                &mut SourceFd(&raw),
                Token(raw as usize),
                Interest::READABLE,
                Box::new(move |ev_loop, _event| on_worker_exit(ev_loop, index)),
            )
            .map_err(GopherError::from)?;
    }

    let signal_raw = signal_fd.as_raw_fd();
    event_loop
        .add(
            &mut SourceFd(&signal_raw),
            Token(signal_raw as usize),
            Interest::READABLE,
            Box::new(move |ev_loop, _event| on_signal(ev_loop, signal_raw)),
        )
        .map_err(GopherError::from)?;

    SUPERVISOR.with(|cell| *cell.borrow_mut() = Some(supervisor));

    tracing::info!(workers = active, "all workers spawned");
    let run_result = event_loop.run(None, None).map_err(GopherError::from);

    let outcome = SUPERVISOR.with(|cell| cell.borrow_mut().take());
    if run_result.is_err() {
        // Cleanup on exit failure (§4.5, §9): kill whatever workers are
        // still alive via their process-descriptors before propagating.
        if let Some(supervisor) = &outcome {
            for handle in &supervisor.workers {
                if let Some(pidfd) = &handle.pidfd {
                    let _ = pidfd_send_signal(pidfd.as_raw_fd(), Signal::SIGKILL);
                }
            }
        }
    }
    run_result?;

    tracing::info!("all workers exited");

    Ok(())
}

// The supervisor's own event loop callbacks need shared mutable access to
// its worker table; since this module (unlike the worker's) has exactly one
// instance per process and no concurrent entry points, a thread-local cell
// is simpler than threading an `Rc<RefCell<_>>` through every closure.
thread_local! {
    static SUPERVISOR: std::cell::RefCell<Option<Supervisor>> = const { std::cell::RefCell::new(None) };
}

fn on_signal(event_loop: &mut EventLoop, fd: RawFd) {
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

    tracing::info!("received SIGTERM, terminating workers");
    SUPERVISOR.with(|cell| {
        if let Some(supervisor) = cell.borrow().as_ref() {
            for handle in &supervisor.workers {
                let Some(pidfd) = &handle.pidfd else { continue };
                if pidfd_send_signal(pidfd.as_raw_fd(), Signal::SIGTERM).is_err() {
                    tracing::warn!(pid = handle.pid.as_raw(), "pidfd_send_signal failed, falling back to kill(2)");
                    let _ = nix::sys::signal::kill(handle.pid, Signal::SIGTERM);
                }
            }
        }
    });
    let _ = event_loop;
}

fn on_worker_exit(event_loop: &mut EventLoop, index: usize) {
    SUPERVISOR.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let Some(supervisor) = borrow.as_mut() else { return };
        let Some(handle) = supervisor.workers.iter_mut().find(|w| w.index == index) else { return };
        let Some(pidfd) = handle.pidfd.take() else { return };

        let raw = pidfd.as_raw_fd();
        match waitid_pidfd(raw) {
            Ok(status) => tracing::info!(pid = handle.pid.as_raw(), status, "worker exited"),
            Err(e) => tracing::warn!(pid = handle.pid.as_raw(), error = %e, "waitid on worker pidfd failed"),
        }

        let _ = event_loop.remove(&mut SourceFd(&raw), Token(raw as usize));
        drop(pidfd);

        supervisor.active -= 1;
        if supervisor.active == 0 {
            event_loop.stop();
        }
    });
}

/// Redirects the supervisor's own stdin/stdout to `/dev/null` before
/// forking, so workers inherit the redirection (§4.5's final paragraph);
/// stderr is left alone for logging.
fn redirect_stdio_to_devnull() -> Result<()> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    let raw = open("/dev/null", OFlag::O_RDWR, Mode::empty()).map_err(GopherError::from)?;
    if unsafe { libc::dup2(raw, libc::STDIN_FILENO) } < 0 {
        return Err(GopherError::Io(std::io::Error::last_os_error()));
    }
    if unsafe { libc::dup2(raw, libc::STDOUT_FILENO) } < 0 {
        return Err(GopherError::Io(std::io::Error::last_os_error()));
    }
    if raw != libc::STDIN_FILENO && raw != libc::STDOUT_FILENO {
        unsafe { libc::close(raw) };
    }
    Ok(())
}
