//! `gophertester`: a multi-process benchmark client for gopher servers
//! (§4.7). Grounded on `gophertester.c`, ported worker-for-worker, with the
//! original's hand-rolled `smalloc`/`scalloc`/`sfree` anonymous-mmap
//! allocator replaced by one `memmap2::MmapMut` sized up front.

mod config;
mod worker;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};

use config::Args;

/// One worker's tally, laid out so the parent and every forked child can
/// read/write their own slot of the same `mmap`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WorkerResult {
    pub pid: libc::pid_t,
    pub status: i32,
    pub total: i64,
    pub successful: i64,
    pub timeout: i64,
    pub mismatch: i64,
}

impl WorkerResult {
    const UNSET: WorkerResult = WorkerResult {
        pid: 0,
        status: -1,
        total: 0,
        successful: 0,
        timeout: 0,
        mismatch: 0,
    };
}

/// Stderr `fmt` subscriber, mirroring `gopherd`'s own `logging::init` — the
/// same ambient observability crates, since this tool has no pid-per-process
/// fan-out of its own to warrant a per-process span.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn main() {
    init_logging();

    let args = Args::parse_args();
    args.display();

    let region_len = args.workers as usize * std::mem::size_of::<WorkerResult>();
    let mut mmap = match memmap2::MmapMut::map_anon(region_len) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "cannot allocate shared memory for results");
            std::process::exit(1);
        }
    };

    {
        let results = results_slice_mut(&mut mmap, args.workers as usize);
        results.fill(WorkerResult::UNSET);
    }

    for id in 0..args.workers {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let results = results_slice_mut(&mut mmap, args.workers as usize);
                let code = match worker::run(id, &args, results) {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!(id, error = %e, "worker failed");
                        1
                    }
                };
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                let results = results_slice_mut(&mut mmap, args.workers as usize);
                results[id as usize].pid = child.as_raw();
                results[id as usize].status = -1;
            }
            Err(e) => {
                tracing::error!(id, error = %e, "cannot create worker process");
                std::process::exit(1);
            }
        }
    }

    tracing::info!("all worker processes dispatched, waiting for results");

    loop {
        match waitpid(None, Some(WaitPidFlag::empty())) {
            Ok(WaitStatus::Exited(pid, code)) => record_exit(&mut mmap, args.workers, pid.as_raw(), code),
            Ok(WaitStatus::Signaled(pid, sig, _)) => record_exit(&mut mmap, args.workers, pid.as_raw(), 128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "wait failed");
                break;
            }
        }
    }

    let results = results_slice_mut(&mut mmap, args.workers as usize);

    let mut final_total = 0i64;
    let mut final_successful = 0i64;
    let mut final_timeout = 0i64;
    let mut final_mismatch = 0i64;
    let mut count = 0;

    for (index, result) in results.iter().enumerate() {
        if result.status == 0 {
            final_total += result.total;
            final_successful += result.successful;
            final_timeout += result.timeout;
            final_mismatch += result.mismatch;
            count += 1;
        } else if result.status == -1 {
            tracing::warn!(index, pid = result.pid, "worker was never reaped");
        } else {
            tracing::warn!(index, pid = result.pid, status = result.status, "worker exited abnormally");
        }
    }

    tracing::info!(count, "process(es) exited successfully");

    if count == 0 {
        tracing::error!("no processes exited successfully, a result cannot be calculated");
        std::process::exit(1);
    }

    let duration = args.duration.max(1) as i64;
    println!("Number of attempts: {final_total}");
    println!("Rate of attempts: {} per second", final_total / duration);
    println!("Number of successful requests: {final_successful}");
    println!("Rate of successful requests: {} per second", final_successful / duration);
    if final_timeout > 0 {
        println!("Number of timeouts: {final_timeout}");
    }
    if final_mismatch > 0 {
        println!("Number of size mismatches: {final_mismatch}");
    }
}

fn record_exit(mmap: &mut memmap2::MmapMut, workers: u32, pid: libc::pid_t, status: i32) {
    let results = results_slice_mut(mmap, workers as usize);
    if let Some(result) = results.iter_mut().find(|r| r.pid == pid) {
        if status != 0 {
            eprintln!("Warning: worker process (pid {pid}) exited with status {status}");
        }
        result.status = status;
    }
}

fn results_slice_mut(mmap: &mut memmap2::MmapMut, workers: usize) -> &mut [WorkerResult] {
    let ptr = mmap.as_mut_ptr() as *mut WorkerResult;
    // Safety: the mapping was sized as exactly `workers * size_of::<WorkerResult>()`
    // and `WorkerResult` is `repr(C)` with no padding-sensitive invariants.
    unsafe { std::slice::from_raw_parts_mut(ptr, workers) }
}
