//! Entry point: parse configuration, install logging, then hand off to the
//! supervisor, which forks exactly `config.workers` children and waits on
//! them. With `--workers=1` that is a single fork — "no forking beyond the
//! supervisor's own single worker", in `main.c`'s phrasing.

use gopherd::config::Config;
use gopherd::{logging, supervisor};

fn main() {
    let config = Config::parse_args();

    logging::init();
    let _span = logging::enter_pid_span();

    config.display();

    if let Err(e) = supervisor::run(config) {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
