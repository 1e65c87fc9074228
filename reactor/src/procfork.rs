use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// `CLONE_CLEAR_SIGHAND` (Linux 5.5+). Not present in every `libc` crate
/// version, so it is defined locally rather than assumed.
pub const CLONE_CLEAR_SIGHAND: u64 = 0x1_0000_0000;

pub enum ForkResult {
    Parent { child: Pid, pidfd: OwnedFd },
    Child,
}

/// Forks a child while atomically obtaining a process-descriptor (`pidfd`)
/// bound to it, via the raw `clone(2)` syscall with `CLONE_PIDFD` — neither
/// `std::process::Command` nor `nix::unistd::fork` exposes that flag.
/// `extra_flags` are OR'd in alongside `CLONE_PIDFD` (e.g.
/// [`CLONE_CLEAR_SIGHAND`] for CGI children).
///
/// Mirrors the reference `sfork()`, which issues exactly this syscall with
/// the pidfd output slot reused from `CLONE_PARENT_SETTID`'s argument
/// position, as documented in `clone(2)`.
pub fn fork_with_pidfd(extra_flags: u64) -> io::Result<ForkResult> {
    let mut pidfd: libc::c_int = -1;
    let flags = (libc::CLONE_PIDFD as u64) | extra_flags;

    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags as libc::c_long,
            std::ptr::null_mut::<libc::c_void>(),
            &mut pidfd as *mut libc::c_int,
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_long,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if ret == 0 {
        Ok(ForkResult::Child)
    } else {
        let child = Pid::from_raw(ret as i32);
        let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd) };
        Ok(ForkResult::Parent { child, pidfd })
    }
}

/// Sends `signal` to the process referred to by a pidfd, via the raw
/// `pidfd_send_signal(2)` syscall (glibc only wraps this as a function
/// starting at 2.36; the raw syscall works everywhere).
pub fn pidfd_send_signal(pidfd: RawFd, signal: Signal) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd as libc::c_long,
            signal as libc::c_int,
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_uint,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reaps the exited child referred to by a pidfd via `waitid(P_PIDFD, ...)`,
/// returning its exit status.
pub fn waitid_pidfd(pidfd: RawFd) -> io::Result<i32> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

    let ret = unsafe { libc::waitid(libc::P_PIDFD, pidfd as libc::id_t, &mut info, libc::WEXITED) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { info.si_status() })
}
