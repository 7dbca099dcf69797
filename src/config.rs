use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio_rustls::TlsAcceptor;

use crate::backend::BackendAddr;
use crate::tls;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "roundhouse",
    about = "SMTP multiplexor: copies one client session to several SMTP servers"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Interface to listen on, as ip:port (can be specified multiple times)
    #[structopt(short = "i", long = "interface", number_of_values = 1)]
    pub interfaces: Vec<SocketAddr>,

    /// Listening ports, combined with --address when no --interface is given
    #[structopt(short = "p", long = "port", default_value = "25", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Listening address for --port
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: IpAddr,

    /// Socket timeout in seconds, shared between the backends
    #[structopt(short = "t", long = "timeout", default_value = "300")]
    pub timeout: u64,

    /// Timeout in seconds for each backend connection attempt
    #[structopt(long = "connect-timeout", default_value = "30")]
    pub connect_timeout: u64,

    /// Drop the client unless every server can be reached
    #[structopt(short = "r", long = "require-all")]
    pub require_all: bool,

    /// Host name used in the greeting and Received headers
    #[structopt(long = "hostname", default_value = "roundhouse.local")]
    pub hostname: String,

    /// TLS certificate file (PEM), enables STARTTLS together with --tls-key
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Verbosity: -v dialogue, -vv message headers, -vvv message bodies
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbose: u8,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Do not filter non-printable characters from console logs
    #[structopt(long = "raw")]
    pub raw_display: bool,

    /// PID file written in daemon mode
    #[structopt(long = "pid-file", default_value = "/var/run/roundhouse.pid", parse(from_os_str))]
    pub pid_file: PathBuf,

    /// Run as this user (daemon mode)
    #[structopt(short = "u", long = "user")]
    pub user: Option<String>,

    /// Run as this group (daemon mode)
    #[structopt(short = "g", long = "group")]
    pub group: Option<String>,

    /// SMTP servers: a unix domain socket path or host[:port]
    #[structopt(name = "SERVER", required = true, min_values = 1)]
    pub servers: Vec<BackendAddr>,
}

/// Settings shared read-only by every session.
#[derive(Clone)]
pub struct ProxyConfig {
    pub interfaces: Vec<SocketAddr>,
    pub backends: Vec<BackendAddr>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub require_all: bool,
    pub hostname: String,
    pub tls: Option<TlsAcceptor>,
}

impl ProxyConfig {
    pub fn new(backends: Vec<BackendAddr>) -> Self {
        Self {
            interfaces: vec![SocketAddr::from(([0, 0, 0, 0], 25))],
            backends,
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            require_all: false,
            hostname: "roundhouse.local".to_string(),
            tls: None,
        }
    }

    pub fn from_opt(opt: &Opt) -> Result<Self> {
        if opt.servers.is_empty() {
            return Err(anyhow::anyhow!("missing server arguments"));
        }
        if opt.timeout == 0 {
            return Err(anyhow::anyhow!("timeout must be at least one second"));
        }

        let interfaces = if opt.interfaces.is_empty() {
            opt.ports
                .iter()
                .map(|port| SocketAddr::new(opt.address, *port))
                .collect()
        } else {
            opt.interfaces.clone()
        };

        let tls = match (&opt.tls_cert, &opt.tls_key) {
            (Some(cert), Some(key)) => Some(
                tls::load_acceptor(cert, key).context("STARTTLS configuration failed")?,
            ),
            (None, None) => None,
            _ => return Err(anyhow::anyhow!("--tls-cert and --tls-key go together")),
        };

        Ok(Self {
            interfaces,
            backends: opt.servers.clone(),
            timeout: Duration::from_secs(opt.timeout),
            connect_timeout: Duration::from_secs(opt.connect_timeout.max(1)),
            require_all: opt.require_all,
            hostname: opt.hostname.clone(),
            tls,
        })
    }

    /// Each backend's share of the session timeout. Always divided by the
    /// configured count so a slow backend cannot eat the others' share.
    pub fn link_timeout(&self) -> Duration {
        let shares = self.backends.len().max(1) as u32;
        (self.timeout / shares).max(Duration::from_millis(1))
    }

    pub fn starttls_configured(&self) -> bool {
        self.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(args: &[&str]) -> Opt {
        Opt::from_iter_safe(std::iter::once("roundhouse").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = ProxyConfig::from_opt(&opt(&["mx1", "127.0.0.1:2525"])).unwrap();
        assert_eq!(config.interfaces, vec!["0.0.0.0:25".parse().unwrap()]);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(!config.require_all);
        assert!(!config.starttls_configured());
        assert_eq!(config.link_timeout(), Duration::from_secs(150));
    }

    #[test]
    fn ports_and_interfaces() {
        let config =
            ProxyConfig::from_opt(&opt(&["-a", "127.0.0.1", "-p", "25", "-p", "587", "mx"]))
                .unwrap();
        assert_eq!(
            config.interfaces,
            vec![
                "127.0.0.1:25".parse().unwrap(),
                "127.0.0.1:587".parse().unwrap()
            ]
        );

        let config = ProxyConfig::from_opt(&opt(&["-i", "[::1]:2525", "-p", "587", "mx"])).unwrap();
        assert_eq!(config.interfaces, vec!["[::1]:2525".parse().unwrap()]);
    }

    #[test]
    fn flags() {
        let o = opt(&["-r", "-vv", "-t", "90", "mx1", "mx2", "/tmp/lmtp.sock"]);
        assert_eq!(o.verbose, 2);
        let config = ProxyConfig::from_opt(&o).unwrap();
        assert!(config.require_all);
        assert_eq!(config.link_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn servers_are_required() {
        assert!(Opt::from_iter_safe(vec!["roundhouse", "-v"]).is_err());
    }

    #[test]
    fn tls_paths_go_together() {
        let o = opt(&["--tls-cert", "/tmp/cert.pem", "mx"]);
        assert!(ProxyConfig::from_opt(&o).is_err());
    }
}
