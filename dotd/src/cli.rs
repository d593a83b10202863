//! Command-line configuration.
//!
//! `--hostname`, `--pin` and `--no-pki` attach to the most recent
//! `--forwarder`, so the options are replayed in the order they appeared on
//! the command line rather than grouped by flag.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dotd_core::pin::decode_pin;
use dotd_core::tls::DEFAULT_CIPHERS;
use dotd_core::upstream::Upstream;

const DEFAULT_SERVER_PORT: u16 = 53;
const DEFAULT_FORWARDER_PORT: u16 = 853;

/// The well-known Cloudflare resolvers used when nothing is configured.
const DEFAULT_PIN: &str = "DPPP3G7LCnpidYBiFiN38CespymEvOsP1HCpoVVPtUM=";
const DEFAULT_HOSTNAME: &str = "cloudflare-dns.com";
const DEFAULT_FORWARDERS: [&str; 4] = [
    "2606:4700:4700::1111",
    "2606:4700:4700::1001",
    "1.1.1.1",
    "1.0.0.1",
];

/// Fully resolved runtime configuration.
pub struct Config {
    pub servers: Vec<SocketAddr>,
    pub upstreams: Vec<Upstream>,
    pub ciphers: String,
    pub max_connections: usize,
    pub timeout: Duration,
    pub daemonise: bool,
    pub pid_file: Option<PathBuf>,
    pub lookup: Option<SocketAddr>,
}

fn command() -> Command {
    Command::new("dotd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("DNS-over-TLS forwarding proxy")
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("IP[:PORT]")
                .action(ArgAction::Append)
                .help("Add a UDP listen address (default port 53)"),
        )
        .arg(
            Arg::new("forwarder")
                .short('f')
                .long("forwarder")
                .value_name("IP[:PORT]")
                .action(ArgAction::Append)
                .help("Add a DoT upstream (default port 853)"),
        )
        .arg(
            Arg::new("hostname")
                .short('H')
                .long("hostname")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Expected certificate hostname for the preceding forwarder"),
        )
        .arg(
            Arg::new("pin")
                .short('p')
                .long("pin")
                .value_name("BASE64")
                .action(ArgAction::Append)
                .help("Base64 SHA-256 SPKI pin for the preceding forwarder"),
        )
        .arg(
            Arg::new("no-pki")
                .short('n')
                .long("no-pki")
                .action(ArgAction::Append)
                .num_args(0..=1)
                .require_equals(true)
                .value_parser(clap::value_parser!(bool))
                .default_missing_value("true")
                .help("Skip the PKI chain for the preceding forwarder (pin/hostname only)"),
        )
        .arg(
            Arg::new("ciphers")
                .short('c')
                .long("ciphers")
                .value_name("LIST")
                .help("OpenSSL cipher list for upstream connections"),
        )
        .arg(
            Arg::new("connections")
                .short('m')
                .long("connections")
                .value_name("N")
                .value_parser(clap::value_parser!(u32).range(1..=6000))
                .default_value("5")
                .help("Maximum simultaneous upstream connections"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("5")
                .help("Per-upstream connection deadline"),
        )
        .arg(
            Arg::new("daemonise")
                .short('d')
                .long("daemonise")
                .action(ArgAction::SetTrue)
                .help("Fork into the background"),
        )
        .arg(
            Arg::new("pid-file")
                .short('P')
                .long("pid-file")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write a locked PID file, removed on exit"),
        )
        .arg(
            Arg::new("lookup")
                .short('l')
                .long("lookup")
                .value_name("IP[:PORT]")
                .help("Connect once, print the server's hostname and pin, and exit"),
        )
}

/// Parse `IP[:PORT]`, `[IPv6][:PORT]` or a bare IPv6 literal.
fn parse_endpoint(input: &str, default_port: u16) -> Result<SocketAddr> {
    let (ip, port) = if let Some(rest) = input.strip_prefix('[') {
        let (ip, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated '[' in address '{input}'"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(port),
            None if rest.is_empty() => None,
            None => bail!("trailing garbage after ']' in address '{input}'"),
        };
        (ip, port)
    } else if input.matches(':').count() == 1 {
        let (ip, port) = input.split_once(':').expect("one colon present");
        (ip, Some(port))
    } else {
        // No colon (IPv4) or several (a bare IPv6 literal).
        (input, None)
    };

    let ip: IpAddr = ip
        .parse()
        .with_context(|| format!("invalid IP address '{ip}'"))?;
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .with_context(|| format!("invalid port in '{input}'"))?,
        None => default_port,
    };
    Ok(SocketAddr::new(ip, port))
}

/// One command-line item, tagged with its argv index so the forwarder
/// grouping can be reconstructed.
enum Item {
    Forwarder(String),
    Hostname(String),
    Pin(String),
    NoPki,
}

fn ordered_items(matches: &ArgMatches) -> Vec<(usize, Item)> {
    let mut items: Vec<(usize, Item)> = Vec::new();
    if let (Some(indices), Some(values)) = (
        matches.indices_of("forwarder"),
        matches.get_many::<String>("forwarder"),
    ) {
        items.extend(
            indices
                .zip(values)
                .map(|(i, v)| (i, Item::Forwarder(v.clone()))),
        );
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("hostname"),
        matches.get_many::<String>("hostname"),
    ) {
        items.extend(
            indices
                .zip(values)
                .map(|(i, v)| (i, Item::Hostname(v.clone()))),
        );
    }
    if let (Some(indices), Some(values)) =
        (matches.indices_of("pin"), matches.get_many::<String>("pin"))
    {
        items.extend(indices.zip(values).map(|(i, v)| (i, Item::Pin(v.clone()))));
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("no-pki"),
        matches.get_many::<bool>("no-pki"),
    ) {
        items.extend(
            indices
                .zip(values)
                .filter(|(_, enabled)| **enabled)
                .map(|(i, _)| (i, Item::NoPki)),
        );
    }
    items.sort_by_key(|(i, _)| *i);
    items
}

struct PartialForwarder {
    addr: SocketAddr,
    hostname: String,
    pin: Vec<u8>,
    no_pki: bool,
}

impl PartialForwarder {
    fn finish(self) -> Result<Upstream> {
        let upstream = Upstream {
            addr: self.addr,
            hostname: self.hostname,
            pin: self.pin,
            no_pki: self.no_pki,
        };
        if !upstream.usable() {
            bail!(
                "forwarder {} needs --hostname, --pin or --no-pki",
                upstream.addr
            );
        }
        Ok(upstream)
    }
}

fn build_upstreams(matches: &ArgMatches) -> Result<Vec<Upstream>> {
    let mut upstreams = Vec::new();
    let mut current: Option<PartialForwarder> = None;

    for (_, item) in ordered_items(matches) {
        match item {
            Item::Forwarder(value) => {
                if let Some(done) = current.take() {
                    upstreams.push(done.finish()?);
                }
                current = Some(PartialForwarder {
                    addr: parse_endpoint(&value, DEFAULT_FORWARDER_PORT)?,
                    hostname: String::new(),
                    pin: Vec::new(),
                    no_pki: false,
                });
            }
            Item::Hostname(value) => {
                let partial = current
                    .as_mut()
                    .ok_or_else(|| anyhow!("--hostname given before any --forwarder"))?;
                if !partial.hostname.is_empty() {
                    bail!("forwarder {} has two hostnames", partial.addr);
                }
                partial.hostname = value;
            }
            Item::Pin(value) => {
                let partial = current
                    .as_mut()
                    .ok_or_else(|| anyhow!("--pin given before any --forwarder"))?;
                partial.pin = decode_pin(&value)
                    .with_context(|| format!("pin for forwarder {}", partial.addr))?;
            }
            Item::NoPki => {
                let partial = current
                    .as_mut()
                    .ok_or_else(|| anyhow!("--no-pki given before any --forwarder"))?;
                partial.no_pki = true;
            }
        }
    }
    if let Some(done) = current.take() {
        upstreams.push(done.finish()?);
    }
    Ok(upstreams)
}

fn default_upstreams() -> Vec<Upstream> {
    let pin = decode_pin(DEFAULT_PIN).expect("default pin is valid Base64");
    DEFAULT_FORWARDERS
        .iter()
        .map(|ip| Upstream {
            addr: SocketAddr::new(ip.parse().expect("default IP parses"), DEFAULT_FORWARDER_PORT),
            hostname: DEFAULT_HOSTNAME.into(),
            pin: pin.clone(),
            no_pki: false,
        })
        .collect()
}

fn default_servers() -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_SERVER_PORT),
        SocketAddr::new(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]), DEFAULT_SERVER_PORT),
    ]
}

impl Config {
    pub fn parse<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;

        let mut servers = Vec::new();
        if let Some(values) = matches.get_many::<String>("server") {
            for value in values {
                servers.push(parse_endpoint(value, DEFAULT_SERVER_PORT)?);
            }
        }
        if servers.is_empty() {
            servers = default_servers();
        }

        let mut upstreams = build_upstreams(&matches)?;
        if upstreams.is_empty() {
            upstreams = default_upstreams();
        }

        let lookup = matches
            .get_one::<String>("lookup")
            .map(|value| parse_endpoint(value, DEFAULT_FORWARDER_PORT))
            .transpose()?;

        Ok(Self {
            servers,
            upstreams,
            ciphers: matches
                .get_one::<String>("ciphers")
                .cloned()
                .unwrap_or_else(|| DEFAULT_CIPHERS.to_string()),
            max_connections: *matches.get_one::<u32>("connections").expect("has default")
                as usize,
            timeout: Duration::from_secs(*matches.get_one::<u64>("timeout").expect("has default")),
            daemonise: matches.get_flag("daemonise"),
            pid_file: matches.get_one::<PathBuf>("pid-file").cloned(),
            lookup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        Config::parse(std::iter::once("dotd").chain(args.iter().copied()))
    }

    #[test]
    fn test_endpoint_forms() {
        assert_eq!(
            parse_endpoint("1.1.1.1", 853).unwrap(),
            "1.1.1.1:853".parse().unwrap()
        );
        assert_eq!(
            parse_endpoint("1.1.1.1:5353", 853).unwrap(),
            "1.1.1.1:5353".parse().unwrap()
        );
        assert_eq!(
            parse_endpoint("[::1]", 53).unwrap(),
            "[::1]:53".parse().unwrap()
        );
        assert_eq!(
            parse_endpoint("[::1]:5353", 53).unwrap(),
            "[::1]:5353".parse().unwrap()
        );
        assert_eq!(
            parse_endpoint("2606:4700:4700::1111", 853).unwrap(),
            "[2606:4700:4700::1111]:853".parse().unwrap()
        );
        assert!(parse_endpoint("not-an-ip", 53).is_err());
        assert!(parse_endpoint("1.1.1.1:0", 53).is_err());
        assert!(parse_endpoint("1.1.1.1:99999", 53).is_err());
        assert!(parse_endpoint("[::1", 53).is_err());
    }

    #[test]
    fn test_defaults_when_nothing_given() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.upstreams.len(), 4);
        assert_eq!(config.upstreams[0].hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.upstreams[0].pin.len(), 32);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.daemonise);
        assert!(config.lookup.is_none());
    }

    #[test]
    fn test_options_attach_to_preceding_forwarder() {
        let config = parse(&[
            "-f",
            "9.9.9.9",
            "-H",
            "dns.quad9.net",
            "-f",
            "1.1.1.1",
            "-p",
            DEFAULT_PIN,
            "-H",
            "cloudflare-dns.com",
        ])
        .unwrap();

        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams[0].hostname, "dns.quad9.net");
        assert!(config.upstreams[0].pin.is_empty());
        assert_eq!(config.upstreams[1].hostname, "cloudflare-dns.com");
        assert_eq!(config.upstreams[1].pin.len(), 32);
    }

    #[test]
    fn test_no_pki_attaches_in_order() {
        let config = parse(&[
            "-f",
            "9.9.9.9",
            "-p",
            DEFAULT_PIN,
            "-n",
            "-f",
            "1.1.1.1",
            "-H",
            "cloudflare-dns.com",
        ])
        .unwrap();
        assert!(config.upstreams[0].no_pki);
        assert!(!config.upstreams[1].no_pki);
    }

    #[test]
    fn test_hostname_without_forwarder_is_rejected() {
        assert!(parse(&["-H", "example.com"]).is_err());
        assert!(parse(&["-p", DEFAULT_PIN]).is_err());
    }

    #[test]
    fn test_bad_pin_is_rejected() {
        assert!(parse(&["-f", "1.1.1.1", "-p", "!!! not base64 !!!"]).is_err());
    }

    #[test]
    fn test_unauthenticated_forwarder_is_rejected() {
        assert!(parse(&["-f", "1.1.1.1"]).is_err());
    }

    #[test]
    fn test_duplicate_hostname_is_rejected() {
        assert!(parse(&["-f", "1.1.1.1", "-H", "a.example", "-H", "b.example"]).is_err());
    }

    #[test]
    fn test_connections_range() {
        assert!(parse(&["-m", "0"]).is_err());
        assert!(parse(&["-m", "6001"]).is_err());
        let config = parse(&["-m", "6000"]).unwrap();
        assert_eq!(config.max_connections, 6000);
    }

    #[test]
    fn test_lookup_mode() {
        let config = parse(&["-l", "9.9.9.9"]).unwrap();
        assert_eq!(config.lookup, Some("9.9.9.9:853".parse().unwrap()));
    }

    #[test]
    fn test_server_addresses() {
        let config = parse(&["-s", "127.0.0.1:5300", "-s", "[::1]:5300"]).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0], "127.0.0.1:5300".parse().unwrap());
    }
}
