use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tracing::metadata::LevelFilter;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bench::{Mode, Report, RequestPool};
use conf::ResolvConf;
use dns_hdr::RRType;
use event_loop::{EventLoop, DEFAULT_CAPACITY};
use session::Question;
use stub::StubSession;

mod bench;
mod conf;
mod dns_hdr;
#[cfg(test)]
mod dns_server;
mod error;
mod event_loop;
mod session;
mod stub;
mod tracker;

/// Resolve a name N times and print the total time taken.
///
/// All queries are submitted at once and driven by a single-threaded
/// event loop, unless `--sequential` is given.
#[derive(Debug, Parser)]
#[command(name = "dns-bench", version, allow_negative_numbers = true)]
struct Opts {
    /// Domain name to resolve
    name: String,

    /// Record type: A, AAAA, CNAME, MX, NS, PTR, SOA, SRV, TXT or ANY
    #[arg(value_name = "TYPE")]
    rtype: RRType,

    /// Number of resolutions
    #[arg(value_name = "N", value_parser = parse_count)]
    count: NonZeroUsize,

    /// Name servers to use instead of the system ones, e.g. 8.8.8.8 or
    /// 1.1.1.1,[2606:4700:4700::1111]:53
    server: Option<String>,

    /// Resolve one query at a time instead of all at once
    #[arg(long)]
    sequential: bool,

    /// Time to wait for each attempt, in milliseconds
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: Option<u64>,

    /// Attempts per server before a query fails
    #[arg(long)]
    attempts: Option<usize>,

    /// Largest number of sockets a single wait may cover
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    max_sockets: usize,

    /// Resolver configuration file
    #[arg(long, default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,

    #[command(flatten)]
    log: LogConfig,
}

fn parse_count(s: &str) -> Result<NonZeroUsize, String> {
    s.parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| "N must be a positive integer".to_string())
}

/// Log level flags; `RUST_LOG` is honored as well.
#[derive(Debug, Args)]
struct LogConfig {
    /// Enable debug + info + warning + error logging
    #[arg(long)]
    debug: bool,

    /// Enable info + warning + error logging
    #[arg(long)]
    info: bool,

    /// Enable warning + error logging
    #[arg(long)]
    warn: bool,

    /// Enable error logging
    #[arg(long)]
    error: bool,
}

impl LogConfig {
    fn level(&self) -> Option<Level> {
        if self.debug {
            Some(Level::DEBUG)
        } else if self.info {
            Some(Level::INFO)
        } else if self.warn {
            Some(Level::WARN)
        } else if self.error {
            Some(Level::ERROR)
        } else {
            None
        }
    }
}

/// Sets up logging to stderr, off unless asked for.
fn logger(level: Option<Level>) -> Result<()> {
    let env = env::var("RUST_LOG").unwrap_or_default();
    let directives = match level {
        Some(level) => format!(
            "dns_bench={},{env}",
            level.to_string().to_lowercase()
        ),
        None => env,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::OFF.into())
        .parse(directives)
        .context("failed to configure logging")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .context("failed to install logger")
}

fn run(opts: Opts) -> Result<Report> {
    let mut conf = ResolvConf::from_file(&opts.resolv_conf)
        .with_context(|| format!("cannot load {}", opts.resolv_conf.display()))?;
    if let Some(server) = &opts.server {
        conf.set_servers_csv(server)?;
    }
    if let Some(ms) = opts.timeout_ms {
        conf.options.timeout = Duration::from_millis(ms);
    }
    if let Some(attempts) = opts.attempts {
        conf.options.attempts = attempts;
    }
    conf.finalize();

    let question = Question::new(&opts.name, opts.rtype)
        .with_context(|| format!("cannot query {:?}", opts.name))?;
    let mut session = StubSession::new(conf).context("cannot set up resolver")?;
    let mut event_loop = EventLoop::new(opts.max_sockets)?;

    let pool = RequestPool::new(question, opts.count);
    let mode = if opts.sequential {
        Mode::Sequential
    } else {
        Mode::Concurrent
    };
    Ok(bench::run(&mut session, &mut event_loop, &pool, mode)?)
}

fn main() -> ExitCode {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(err) = logger(opts.log.level()) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(opts) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
