//! CLI surface for the benchmark client (§4.7), via `clap` derive — the
//! same ambient tool the main server uses for its own configuration.

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "gophertester", about = "Benchmark tool for Gopher servers")]
pub struct Args {
    /// Address of the gopher server under test.
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    /// Duration of the test, in seconds.
    #[arg(long, default_value_t = 60)]
    pub duration: u32,

    /// Network port to use. Defaults to 70 (this server's own default),
    /// deliberately diverging from the original tool's 8080 default so an
    /// unconfigured run talks to an unconfigured `gopherd` out of the box.
    #[arg(long, default_value_t = 70)]
    pub port: u16,

    /// Request string sent before CRLF on every attempt.
    #[arg(long, default_value = "/")]
    pub request: String,

    /// Expected size of the response in bytes. 0 disables the check.
    #[arg(long, default_value_t = 0)]
    pub size: u32,

    /// Time to wait for socket state change before giving up, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub timeout: i32,

    /// Number of worker processes.
    #[arg(long, default_value_t = 1)]
    pub workers: u32,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    pub fn display(&self) {
        eprintln!("Address: {}", self.address);
        eprintln!("Port: {}", self.port);
        eprintln!("Duration: {} seconds", self.duration);
        eprintln!("Request: {}", self.request);
        eprintln!("Expected size: {}", self.size);
        eprintln!("Timeout: {} milliseconds", self.timeout);
        eprintln!("Workers: {}", self.workers);
    }
}
