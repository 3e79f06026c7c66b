use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use qhttpd::config::DEFAULT_PORT;
use qhttpd::metrics;
use qhttpd::policy::Policy;
use qhttpd::signals;
use qhttpd::supervisor::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "qhttpd", about = "HTTP server options")]
struct Opt {
    /// Number of HTTP (compute) workers.
    #[arg(long = "http-workers", short = 'w', default_value_t = 1)]
    http_workers: u16,

    /// Number of TCP (connection) workers.
    #[arg(long = "tcp-workers", short = 't', default_value_t = 1)]
    tcp_workers: u16,

    /// Run the compute stage on its own worker pool.
    #[arg(long)]
    split: bool,

    /// Request routing policy in split mode.
    #[arg(long, default_value = "one-to-one", value_parser = parse_policy)]
    policy: Policy,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base listen address; worker i listens on base + 2*i. All workers
    /// share the wildcard address when unset.
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Document root served by the file builder.
    #[arg(long = "file-dir", default_value = ".")]
    file_dir: PathBuf,

    /// Verbosity level. Can be error, warn, info, debug, or trace.
    #[arg(long, short, default_value = "info")]
    verbose: String,
}

fn parse_policy(input: &str) -> Result<Policy, String> {
    Policy::from_str(input)
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let level = log::LevelFilter::from_str(&opt.verbose)
        .map_err(|_| anyhow::anyhow!("invalid verbosity string {:?}", opt.verbose))?;
    stderrlog::new()
        .module(module_path!())
        .module("qhttpd")
        .quiet(level == log::LevelFilter::Off)
        .verbosity((level as usize).saturating_sub(1))
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()?;

    // Block termination signals so every spawned worker inherits the mask
    // and only this thread delivers them.
    signals::block_termination().context("blocking termination signals")?;

    let config = ServerConfig {
        conn_workers: opt.tcp_workers,
        compute_workers: opt.http_workers,
        split: opt.split,
        policy: opt.policy,
        ip: opt.ip,
        port: opt.port,
        doc_root: opt.file_dir,
    };
    let server = supervisor::launch(config).context("starting workers")?;

    signals::install_handlers().context("installing signal handlers")?;
    metrics::spawn_reporter();

    info!("qhttpd: ready");
    server.join();
    Ok(())
}
