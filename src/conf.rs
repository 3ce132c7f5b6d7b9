//! Resolver configuration.
//!
//! Name servers and query options come from a file in `/etc/resolv.conf`
//! format and may be replaced by a comma separated server list given on
//! the command line.

use std::fs;
use std::io::{self, BufRead};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::SplitWhitespace;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("cannot read resolver configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid server: {0}")]
    InvalidServer(String),
}

/// Options that apply to every query of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvOptions {
    /// How long a single attempt waits for its response.
    pub timeout: Duration,

    /// How many times each server is tried before a query fails.
    pub attempts: usize,

    /// Spread the first attempt of consecutive queries over the servers.
    pub rotate: bool,
}

impl Default for ResolvOptions {
    fn default() -> Self {
        ResolvOptions {
            timeout: Duration::from_secs(2),
            attempts: 3,
            rotate: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub servers: Vec<SocketAddr>,
    pub options: ResolvOptions,
}

impl ResolvConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from a file, falling back to the loopback
    /// servers if the file is missing or names no server.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfError> {
        let mut conf = ResolvConf::new();
        match fs::File::open(path.as_ref()) {
            Ok(file) => conf.parse(io::BufReader::new(file))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.as_ref().display(), "no resolver configuration file");
            }
            Err(err) => return Err(err.into()),
        }
        conf.finalize();
        Ok(conf)
    }

    /// Parses resolv.conf formatted input, adding to `self`.
    ///
    /// Lines and options that cannot be understood are logged and skipped,
    /// only read errors fail.
    pub fn parse<R: BufRead>(&mut self, reader: R) -> Result<(), ConfError> {
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    if let Err(reason) = self.parse_nameserver(words) {
                        warn!(line = idx + 1, %reason, "skipping nameserver");
                    }
                }
                Some("options") => self.parse_options(idx + 1, words),
                // Search lists do not apply to a fixed benchmark name.
                Some("domain") | Some("search") | Some("sortlist") => {}
                Some(other) => debug!(keyword = other, "ignoring resolver configuration line"),
                None => {}
            }
        }
        Ok(())
    }

    fn parse_nameserver(&mut self, mut words: SplitWhitespace<'_>) -> Result<(), String> {
        let word = words.next().ok_or("missing nameserver address")?;
        // Scoped addresses ("fe80::1%eth0") are not supported and skipped.
        if word.contains('%') {
            debug!(server = word, "skipping scoped nameserver");
            return Ok(());
        }
        let ip: IpAddr = word
            .parse()
            .map_err(|_| format!("invalid nameserver address {word:?}"))?;
        self.servers.push(SocketAddr::new(ip, DNS_PORT));
        Ok(())
    }

    fn parse_options(&mut self, line: usize, words: SplitWhitespace<'_>) {
        for word in words {
            match split_arg(word) {
                // A zero timeout would expire every attempt at once.
                Ok(("timeout", Some(0))) => warn!(line, option = word, "skipping zero timeout"),
                Ok(("timeout", Some(n))) => self.options.timeout = Duration::from_secs(n as u64),
                Ok(("attempts", Some(n))) => self.options.attempts = n,
                Ok(("rotate", None)) => self.options.rotate = true,
                Ok((name, _)) => debug!(option = name, "ignoring resolver option"),
                Err(reason) => warn!(line, %reason, "skipping resolver option"),
            }
        }
    }

    /// Replaces the server list with a comma separated list of addresses.
    ///
    /// Each entry is `ip`, `ip:port`, `[ipv6]` or `[ipv6]:port`; a bare
    /// IPv6 address is also accepted.
    pub fn set_servers_csv(&mut self, csv: &str) -> Result<(), ConfError> {
        let servers = csv
            .split(',')
            .map(|entry| parse_server(entry.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfError::InvalidServer(csv.to_string()))?;
        self.servers = servers;
        Ok(())
    }

    /// Fills in defaults for anything the input left out.
    pub fn finalize(&mut self) {
        if self.servers.is_empty() {
            self.servers = vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), DNS_PORT),
            ];
        }
        if self.options.attempts == 0 {
            self.options.attempts = 1;
        }
    }
}

fn parse_server(entry: &str) -> Result<SocketAddr, ()> {
    if entry.is_empty() {
        return Err(());
    }
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    entry
        .strip_prefix('[')
        .and_then(|e| e.strip_suffix(']'))
        .and_then(|e| e.parse::<Ipv6Addr>().ok())
        .map(|ip| SocketAddr::new(IpAddr::V6(ip), DNS_PORT))
        .ok_or(())
}

/// Splits an option into its name and its optional numeric argument.
fn split_arg(s: &str) -> Result<(&str, Option<usize>), String> {
    match s.split_once(':') {
        Some((name, value)) => value
            .parse()
            .map(|n| (name, Some(n)))
            .map_err(|_| format!("invalid value in option {s:?}")),
        None => Ok((s, None)),
    }
}
