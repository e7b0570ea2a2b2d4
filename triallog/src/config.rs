//! Configuration parsing for the daemon: the receive address sublanguage,
//! the optional YAML config file, and telemetry selection.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::housekeeping;
use crate::receiver;

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Config file could not be parsed.
    #[error("failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Receive address did not parse.
    #[error("invalid receive address {0:?}: expected IFACE:HOST:PORT, HOST:PORT or PORT")]
    Address(String),
}

/// Where the receiver listens: `IFACE:HOST:PORT`, `HOST:PORT`, or `PORT`.
///
/// An empty host binds the wildcard address; a named interface restricts
/// the socket to datagrams arriving on that device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RecvAddress {
    /// Optional network device to bind to.
    pub interface: Option<String>,
    /// Optional host address; wildcard when absent.
    pub host: Option<IpAddr>,
    /// UDP port.
    pub port: u16,
}

impl Default for RecvAddress {
    fn default() -> Self {
        Self {
            interface: None,
            host: None,
            port: 29_001,
        }
    }
}

impl RecvAddress {
    /// The socket address to bind, wildcard when no host was given.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        let host = self
            .host
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(host, self.port)
    }
}

fn parse_host(raw: &str) -> Result<Option<IpAddr>, Error> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw == "localhost" {
        return Ok(Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
    }
    raw.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| Error::Address(raw.to_owned()))
}

impl FromStr for RecvAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::Address(s.to_owned());
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [port] => Ok(Self {
                interface: None,
                host: None,
                port: port.parse().map_err(|_| bad())?,
            }),
            [host, port] => Ok(Self {
                interface: None,
                host: parse_host(host)?,
                port: port.parse().map_err(|_| bad())?,
            }),
            [interface, host, port] => {
                if interface.is_empty() {
                    return Err(bad());
                }
                Ok(Self {
                    interface: Some((*interface).to_owned()),
                    host: parse_host(host)?,
                    port: port.parse().map_err(|_| bad())?,
                })
            }
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for RecvAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for RecvAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(interface) = &self.interface {
            write!(f, "{interface}:")?;
        }
        match self.host {
            Some(host) => write!(f, "{host}:{port}", port = self.port),
            None => write!(f, "0.0.0.0:{port}", port = self.port),
        }
    }
}

/// Defines the manner of the daemon's telemetry.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// Expose internal counters at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for the prometheus exporter.
        prometheus_addr: SocketAddr,
    },
    /// Counters are kept but not exported.
    Disabled,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::Disabled
    }
}

fn default_dataroot() -> PathBuf {
    PathBuf::from("/var/tmp/triallog")
}

/// Main configuration struct for the daemon.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the receiver listens.
    #[serde(default)]
    pub recv: RecvAddress,
    /// Kernel receive buffer sizing and other receiver knobs.
    #[serde(default)]
    pub receiver: receiver::Tuning,
    /// Root of the trial artifact tree.
    #[serde(default = "default_dataroot")]
    pub dataroot: PathBuf,
    /// The method by which to express telemetry.
    #[serde(default)]
    pub telemetry: Telemetry,
    /// Trial splitting and flushing cadence.
    #[serde(default)]
    pub housekeeping: housekeeping::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv: RecvAddress::default(),
            receiver: receiver::Tuning::default(),
            dataroot: default_dataroot(),
            telemetry: Telemetry::default(),
            housekeeping: housekeeping::Config::default(),
        }
    }
}

impl Config {
    /// Load a config file, or defaults when no path is given.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, Error> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&contents)?)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_parses() {
        let addr: RecvAddress = "29001".parse().expect("valid");
        assert_eq!(addr, RecvAddress::default());
        assert_eq!(addr.to_string(), "0.0.0.0:29001");
    }

    #[test]
    fn host_and_port_parse() {
        let addr: RecvAddress = "127.0.0.1:5000".parse().expect("valid");
        assert_eq!(addr.interface, None);
        assert_eq!(addr.host, Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
        assert_eq!(addr.port, 5000);
        assert_eq!(addr.to_string(), "127.0.0.1:5000");
    }

    #[test]
    fn interface_host_and_port_parse() {
        let addr: RecvAddress = "eno4:100.1.1.3:29001".parse().expect("valid");
        assert_eq!(addr.interface.as_deref(), Some("eno4"));
        assert_eq!(addr.to_string(), "eno4:100.1.1.3:29001");

        // Interface with a wildcard host.
        let addr: RecvAddress = "eno4::29001".parse().expect("valid");
        assert_eq!(addr.interface.as_deref(), Some("eno4"));
        assert_eq!(addr.host, None);
    }

    #[test]
    fn localhost_is_accepted() {
        let addr: RecvAddress = "localhost:29001".parse().expect("valid");
        assert_eq!(addr.host, Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn junk_addresses_are_rejected() {
        for bad in ["", "notaport", "nohost:", "a:b:c:d", "eth0:nothost:29001"] {
            assert!(bad.parse::<RecvAddress>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let contents = r#"
recv: "eno4::29001"
dataroot: "/data/trials"
telemetry:
  prometheus:
    prometheus_addr: "0.0.0.0:9000"
housekeeping:
  split_trials_older_than_secs: 30.0
"#;
        let config: Config = serde_yaml::from_str(contents)?;
        assert_eq!(config.recv.interface.as_deref(), Some("eno4"));
        assert_eq!(config.dataroot, PathBuf::from("/data/trials"));
        assert_eq!(
            config.telemetry,
            Telemetry::Prometheus {
                prometheus_addr: "0.0.0.0:9000".parse().expect("valid addr"),
            }
        );
        assert_eq!(config.housekeeping.split_trials_older_than_secs, 30.0);
        assert_eq!(
            config.housekeeping.flush_trials_older_than_secs,
            housekeeping::Config::default().flush_trials_older_than_secs
        );
        Ok(())
    }
}
