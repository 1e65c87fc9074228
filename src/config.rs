//! Worker configuration, parsed from the command line.
//!
//! The reference implementation's YAML config layer (`config_handler/`, a
//! hand-rolled tokenizer and `FromYaml` derive) has no counterpart here: the
//! spec's configuration surface is seven flat flags, which `clap`'s derive
//! API expresses directly without inventing a parser of our own.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "gopherd", version, about = "A multi-process Gopher server")]
pub struct Config {
    /// Location to serve files from.
    #[arg(long, default_value = "./gopherroot")]
    pub directory: PathBuf,

    /// Hostname advertised in error menus and the CGI environment.
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    /// Filename looked up when a selector resolves to a directory.
    #[arg(long, default_value = ".gophermap")]
    pub indexfile: String,

    /// Maximum concurrent clients per worker process.
    #[arg(long, default_value_t = 1000)]
    pub maxclients: u32,

    /// Network port to listen on.
    #[arg(long, default_value_t = 70)]
    pub port: u16,

    /// Per-client idle timeout, in seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Number of worker processes. 1 results in no forking beyond the
    /// supervisor's own single worker.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
}

impl Config {
    pub fn parse_args() -> Self {
        Config::parse()
    }

    pub fn display(&self) {
        tracing::info!(
            directory = %self.directory.display(),
            hostname = %self.hostname,
            indexfile = %self.indexfile,
            maxclients = self.maxclients,
            port = self.port,
            timeout = self.timeout,
            workers = self.workers,
            "configuration",
        );
    }
}
