//! Firewall rule data structures
//!
//! This module defines the declared and derived rule types that flow through
//! the compile → order → diff → apply pipeline.
//!
//! # Rule Structure
//!
//! A [`RuleSpec`] is one declared rule as read from a manifest:
//! - Placement: [`Table`] and [`Chain`]
//! - Matching: protocol, sources, destination, ports, interfaces, state, rate limit
//! - Target: [`Jump`] plus its target-specific options (NAT, LOG, REJECT)
//!
//! The compiler turns one spec into one [`CompiledRule`] per declared source
//! address. Compiled rules carry the canonical `iptables-save` text used as the
//! comparison key against the live rule set.
//!
//! # Example
//!
//! ```
//! use iptsync::core::firewall::{Chain, Jump, PortSpec, Protocol, RuleSpec, Table};
//!
//! let spec = RuleSpec {
//!     name: "ssh".to_string(),
//!     chain: Chain::Input,
//!     table: Table::Filter,
//!     proto: Protocol::Tcp,
//!     jump: Jump::Accept,
//!     dport: Some(PortSpec::Single("22".to_string())),
//!     ..RuleSpec::default()
//! };
//! assert_eq!(spec.chain.priority(), 2);
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Packet filter table
///
/// Declaration order is the order tables are listed, applied and flushed in.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "raw")]
    Raw,
}

/// Built-in chain a declared rule is appended to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Chain {
    #[strum(serialize = "PREROUTING")]
    #[serde(rename = "PREROUTING")]
    Prerouting,
    #[default]
    #[strum(serialize = "INPUT")]
    #[serde(rename = "INPUT")]
    Input,
    #[strum(serialize = "FORWARD")]
    #[serde(rename = "FORWARD")]
    Forward,
    #[strum(serialize = "OUTPUT")]
    #[serde(rename = "OUTPUT")]
    Output,
    #[strum(serialize = "POSTROUTING")]
    #[serde(rename = "POSTROUTING")]
    Postrouting,
}

impl Chain {
    /// Position of the chain in `iptables-save` output.
    ///
    /// Rules are sorted by this value so the declared order reproduces the
    /// listing order exactly.
    pub const fn priority(self) -> u8 {
        match self {
            Chain::Prerouting => 1,
            Chain::Input => 2,
            Chain::Forward => 3,
            Chain::Output => 4,
            Chain::Postrouting => 5,
        }
    }

    /// Priority of a chain given by name; user-defined chains sort last.
    pub fn priority_of(name: &str) -> u8 {
        name.parse::<Chain>().map_or(u8::MAX, Chain::priority)
    }
}

/// Protocol matched by `-p`
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "esp")]
    Esp,
    #[strum(serialize = "ah")]
    Ah,
    #[strum(serialize = "vrrp")]
    Vrrp,
    #[strum(serialize = "igmp")]
    Igmp,
    /// Match every protocol; no `-p` clause is rendered
    #[strum(serialize = "all")]
    All,
}

/// Jump target
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Jump {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "REJECT")]
    Reject,
    #[strum(serialize = "DNAT")]
    Dnat,
    #[strum(serialize = "SNAT")]
    Snat,
    #[strum(serialize = "LOG")]
    Log,
    #[strum(serialize = "MASQUERADE")]
    Masquerade,
    #[strum(serialize = "REDIRECT")]
    Redirect,
}

/// Source or destination port selection
///
/// A scalar renders as `--sport`/`--dport`, a list goes through the
/// multiport extension even when it holds a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Single(String),
    List(Vec<String>),
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(port) => write!(f, "{port}"),
            PortSpec::List(ports) => write!(f, "{}", ports.join(",")),
        }
    }
}

/// One declared rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub table: Table,
    #[serde(default)]
    pub proto: Protocol,
    #[serde(default)]
    pub jump: Jump,
    /// Each entry fans out into its own compiled rule
    #[serde(default, deserialize_with = "one_or_many")]
    pub source: Vec<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub destination: Option<String>,
    #[serde(default, deserialize_with = "ports")]
    pub sport: Option<PortSpec>,
    #[serde(default, deserialize_with = "ports")]
    pub dport: Option<PortSpec>,
    #[serde(default, deserialize_with = "non_empty")]
    pub iniface: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub outiface: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub tosource: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub todest: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub toports: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub reject: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub log_level: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub log_prefix: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub icmp: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub state: Vec<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub limit: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub burst: Option<String>,
}

/// Where a compiled rule came from
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    #[strum(serialize = "declared")]
    Declared,
    #[strum(serialize = "pre")]
    PreFile,
    #[strum(serialize = "post")]
    PostFile,
}

/// A rule in canonical `iptables-save` form
///
/// Derived from a [`RuleSpec`] (or a pre/post file line) and never mutated
/// afterwards except for the sequence number the registry assigns.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompiledRule {
    pub table: Table,
    pub chain: String,
    pub priority: u8,
    /// 1-based position within the table, 0 until the registry finalizes
    pub sequence: usize,
    pub name: String,
    /// Normalized source address this rule was fanned out for ("" when none)
    pub source: String,
    /// Canonical text starting with `-A <chain>`
    pub text: String,
    pub origin: RuleOrigin,
}

impl CompiledRule {
    /// Key used for exact-position comparison against a numbered listing
    pub fn numbered_key(&self) -> String {
        format!("{} {}", self.sequence, self.text)
    }
}

/// Scalar manifest value: strings and numbers are both accepted (`"22"` or `22`)
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(u64),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Text(text) => text,
            Scalar::Number(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Scalar),
    Many(Vec<Scalar>),
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(String::from)
        .filter(|s| !s.is_empty()))
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![String::from(value)],
        Some(OneOrMany::Many(values)) => values.into_iter().map(String::from).collect(),
    };
    Ok(values.into_iter().filter(|s| !s.is_empty()).collect())
}

fn ports<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PortSpec>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => None,
        Some(OneOrMany::One(value)) => {
            Some(String::from(value)).filter(|s| !s.is_empty()).map(PortSpec::Single)
        }
        Some(OneOrMany::Many(values)) if values.is_empty() => None,
        Some(OneOrMany::Many(values)) => Some(PortSpec::List(
            values.into_iter().map(String::from).collect(),
        )),
    })
}
