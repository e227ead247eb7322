//! Address normalization
//!
//! Host and network values are rendered in exactly one textual form so that a
//! compiled rule and the same rule read back from `iptables-save` compare
//! byte-equal. Which form depends on what the installed iptables prints:
//!
//! - [`AddressMode::Cidr`]: `10.0.0.0/24`, `10.0.0.1/32` (iptables 1.4 and later)
//! - [`AddressMode::Legacy`]: `10.0.0.0/255.255.255.0`, `10.0.0.1`

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use tracing::{debug, warn};

/// Address rendering capability of the installed iptables
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum AddressMode {
    #[default]
    #[strum(serialize = "cidr")]
    Cidr,
    #[strum(serialize = "legacy")]
    Legacy,
}

impl AddressMode {
    /// Derives the mode from `iptables --version` output (`iptables v1.8.7 (nf_tables)`).
    ///
    /// Releases before 1.4 print dotted netmasks. Output without a recognizable
    /// version falls back to CIDR.
    pub fn from_version_output(output: &str) -> Self {
        match parse_version(output) {
            Some((major, minor)) if major < 1 || (major == 1 && minor < 4) => AddressMode::Legacy,
            Some(_) => AddressMode::Cidr,
            None => {
                warn!("Unrecognized iptables version output {output:?}, assuming CIDR support");
                AddressMode::Cidr
            }
        }
    }
}

fn parse_version(output: &str) -> Option<(u32, u32)> {
    let version = output
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Normalizes a host name, address or network into its canonical text.
///
/// Values without a `/` are resolved (literal addresses resolve to themselves)
/// and treated as host routes.
pub fn normalize(value: &str, mode: AddressMode) -> Result<String> {
    let network = if value.contains('/') {
        parse_network(value)?
    } else {
        host_network(resolve(value)?)?
    };
    Ok(render(&network, mode))
}

/// Normalizes a value read back from a listing.
///
/// Listings never contain host names, so no resolution is attempted.
pub fn normalize_listed(value: &str, mode: AddressMode) -> Result<String> {
    let network = if value.contains('/') {
        parse_network(value)?
    } else {
        let addr: Ipv4Addr = value
            .parse()
            .map_err(|_| Error::Format(format!("invalid address '{value}'")))?;
        host_network(addr)?
    };
    Ok(render(&network, mode))
}

/// Parses `address/prefixlen` or `address/dotted-netmask`.
///
/// The netmask must be a contiguous run of 1 bits followed by 0 bits.
pub fn parse_network(value: &str) -> Result<Ipv4Network> {
    let (addr, mask) = value
        .split_once('/')
        .ok_or_else(|| Error::Format(format!("missing mask in '{value}'")))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Format(format!("invalid address '{addr}'")))?;

    let prefix = if mask.contains('.') {
        let mask: Ipv4Addr = mask
            .parse()
            .map_err(|_| Error::Format(format!("invalid netmask '{mask}'")))?;
        ipnetwork::ipv4_mask_to_prefix(mask)
            .map_err(|_| Error::Format(format!("bad netmask bit pattern '{mask}'")))?
    } else {
        mask.parse::<u8>()
            .map_err(|_| Error::Format(format!("invalid prefix length '{mask}'")))?
    };

    let network = Ipv4Network::new(addr, prefix)
        .map_err(|e| Error::Format(format!("invalid network '{value}': {e}")))?;

    // Host bits are dropped the same way iptables does
    Ipv4Network::new(network.network(), prefix)
        .map_err(|e| Error::Format(format!("invalid network '{value}': {e}")))
}

/// Renders a network in the form the listing command prints.
pub fn render(network: &Ipv4Network, mode: AddressMode) -> String {
    match mode {
        AddressMode::Cidr => format!("{}/{}", network.network(), network.prefix()),
        AddressMode::Legacy if network.prefix() == 32 => network.network().to_string(),
        AddressMode::Legacy => format!("{}/{}", network.network(), network.mask()),
    }
}

fn host_network(addr: Ipv4Addr) -> Result<Ipv4Network> {
    Ipv4Network::new(addr, 32).map_err(|e| Error::Format(format!("invalid address '{addr}': {e}")))
}

fn resolve(host: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    debug!("Resolving host name {host}");
    let addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|e| Error::Format(format!("cannot resolve '{host}': {e}")))?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::Format(format!("'{host}' has no IPv4 address")))
}
