//! Per-worker benchmark loop (§4.7), grounded on `gophertester.c`'s
//! `process()`: repeatedly connect, send the configured request, read the
//! reply to EOF, and score the attempt, until the duration timer fires.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrIn};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::{read, write};

use crate::{config::Args, WorkerResult};

const RX_BUFFER_SIZE: usize = 1024 * 1024;

pub fn run(id: u32, args: &Args, results: &mut [WorkerResult]) -> nix::Result<()> {
    results[id as usize].total = 0;
    results[id as usize].successful = 0;
    results[id as usize].timeout = 0;
    results[id as usize].mismatch = 0;

    let request = format!("{}\r\n", args.request);

    let addr: std::net::Ipv4Addr = args.address.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    let octets = addr.octets();
    let sockaddr = SockaddrIn::new(octets[0], octets[1], octets[2], octets[3], args.port);

    let timer = TimerFd::new(ClockId::CLOCK_REALTIME, TimerFlags::empty())?;
    timer.set(
        Expiration::OneShot(TimeSpec::new(args.duration as i64, 0)),
        TimerSetTimeFlags::empty(),
    )?;

    let mut rx_buffer = vec![0u8; RX_BUFFER_SIZE];
    let poll_timeout = PollTimeout::try_from(args.timeout).unwrap_or(PollTimeout::NONE);
    let mut timer_active = true;

    loop {
        results[id as usize].total += 1;

        let fd = socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;

        match socket::connect(fd.as_raw_fd(), &sockaddr) {
            Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let done = run_attempt(&fd, &timer, &mut timer_active, &request, &mut rx_buffer, poll_timeout, args, id, results)?;
        drop(fd);

        if done {
            break;
        }
    }

    Ok(())
}

/// Drives one connection to completion or a single poll timeout, scoring
/// the attempt into `results[id]`. Returns whether the overall test is done
/// (the duration timer has fired and this attempt has concluded).
#[allow(clippy::too_many_arguments)]
fn run_attempt(
    fd: &OwnedFd,
    timer: &TimerFd,
    timer_active: &mut bool,
    request: &str,
    rx_buffer: &mut [u8],
    poll_timeout: PollTimeout,
    args: &Args,
    id: u32,
    results: &mut [WorkerResult],
) -> nix::Result<bool> {
    let mut awaiting_write = true;
    let mut received: usize = 0;

    loop {
        let timer_fd = timer.as_fd();
        let socket_fd = fd.as_fd();

        let socket_interest = if awaiting_write { PollFlags::POLLOUT } else { PollFlags::POLLIN };

        let mut fds = Vec::with_capacity(2);
        if *timer_active {
            fds.push(PollFd::new(timer_fd, PollFlags::POLLIN));
        }
        fds.push(PollFd::new(socket_fd, socket_interest));

        let n = poll(&mut fds, poll_timeout)?;

        if n == 0 {
            let result = &mut results[id as usize];
            if result.timeout == 0 {
                eprintln!("Warning: worker #{id} timed out");
            }
            result.timeout += 1;
            return Ok(!*timer_active);
        }

        if *timer_active && fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            *timer_active = false;
        }

        let socket_events = fds.last().unwrap().revents().unwrap_or(PollFlags::empty());

        if socket_events.contains(PollFlags::POLLOUT) && awaiting_write {
            write(fd, request.as_bytes())?;
            awaiting_write = false;
        } else if socket_events.contains(PollFlags::POLLIN) {
            loop {
                match read(fd.as_raw_fd(), rx_buffer) {
                    Ok(0) => {
                        let result = &mut results[id as usize];
                        if args.size > 0 && received != args.size as usize {
                            if result.mismatch == 0 {
                                eprintln!("Warning: worker #{id} size mismatch");
                            }
                            result.mismatch += 1;
                        } else {
                            result.successful += 1;
                        }
                        return Ok(!*timer_active);
                    }
                    Ok(n) => received += n,
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
