//! Rule constraint functions for declared rules
//!
//! This module centralizes the business logic about valid field combinations
//! that iptables itself enforces (or silently rewrites). The compiler checks
//! every declared rule against these before rendering it, so a rule that would
//! be rejected by iptables, or listed back in a different form, never reaches
//! the apply phase.
//!
//! # Examples
//!
//! ```
//! use iptsync::core::firewall::{Chain, Protocol, Table};
//! use iptsync::core::rule_constraints::*;
//!
//! assert!(chain_allowed_in_table(Table::Nat, Chain::Prerouting));
//! assert!(!chain_allowed_in_table(Table::Filter, Chain::Postrouting));
//! assert!(protocol_supports_ports(Protocol::Udp));
//! assert_eq!(icmp_type_code("echo-request"), Some("8"));
//! ```

use super::firewall::{Chain, Protocol, Table};

/// Upper bound of ports the multiport extension accepts in one rule
pub const MAX_MULTIPORT_ENTRIES: usize = 15;

/// Bytes of a log prefix kept before the `": "` separator.
///
/// The kernel caps `--log-prefix` at 29 bytes.
pub const LOG_PREFIX_MAX_BYTES: usize = 27;

/// Rejection type used when a REJECT rule does not specify one
pub const DEFAULT_REJECT_WITH: &str = "icmp-port-unreachable";

/// Connection states in the order iptables lists them
pub const STATE_ORDER: [&str; 4] = ["INVALID", "NEW", "RELATED", "ESTABLISHED"];

/// Rate units accepted by `--limit`
pub const LIMIT_UNITS: [&str; 4] = ["sec", "min", "hour", "day"];

// ═══════════════════════════════════════════════════════════════════════════
// Placement Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Built-in chains a table does not have.
pub const fn forbidden_chains(table: Table) -> &'static [Chain] {
    match table {
        Table::Filter => &[Chain::Prerouting, Chain::Postrouting],
        Table::Nat => &[Chain::Input, Chain::Forward],
        Table::Raw => &[Chain::Input, Chain::Forward, Chain::Postrouting],
        Table::Mangle => &[],
    }
}

/// Returns `true` if `chain` exists in `table`.
#[inline]
pub fn chain_allowed_in_table(table: Table, chain: Chain) -> bool {
    !forbidden_chains(table).contains(&chain)
}

/// Returns `true` if packets traversing `chain` have an input interface.
#[inline]
pub fn iniface_allowed(chain: Chain) -> bool {
    matches!(chain, Chain::Input | Chain::Forward | Chain::Prerouting)
}

/// Returns `true` if packets traversing `chain` have an output interface.
#[inline]
pub fn outiface_allowed(chain: Chain) -> bool {
    matches!(chain, Chain::Output | Chain::Forward | Chain::Postrouting)
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port matching.
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Tcp | Protocol::Udp)
}

/// Returns `true` if `-p <proto>` is followed by a `-m <proto>` match in listings.
///
/// VRRP and IGMP have no match extension of their own.
#[inline]
pub fn protocol_has_match_extension(protocol: Protocol) -> bool {
    !matches!(protocol, Protocol::All | Protocol::Vrrp | Protocol::Igmp)
}

// ═══════════════════════════════════════════════════════════════════════════
// ICMP Types
// ═══════════════════════════════════════════════════════════════════════════

/// Symbolic ICMP type names and the numeric form `iptables-save` prints.
const ICMP_TYPES: &[(&str, &str)] = &[
    ("any", "any"),
    ("echo-reply", "0"),
    ("pong", "0"),
    ("destination-unreachable", "3"),
    ("network-unreachable", "3/0"),
    ("host-unreachable", "3/1"),
    ("protocol-unreachable", "3/2"),
    ("port-unreachable", "3/3"),
    ("fragmentation-needed", "3/4"),
    ("source-route-failed", "3/5"),
    ("network-unknown", "3/6"),
    ("host-unknown", "3/7"),
    ("network-prohibited", "3/9"),
    ("host-prohibited", "3/10"),
    ("TOS-network-unreachable", "3/11"),
    ("TOS-host-unreachable", "3/12"),
    ("communication-prohibited", "3/13"),
    ("host-precedence-violation", "3/14"),
    ("precedence-cutoff", "3/15"),
    ("source-quench", "4"),
    ("redirect", "5"),
    ("network-redirect", "5/0"),
    ("host-redirect", "5/1"),
    ("TOS-network-redirect", "5/2"),
    ("TOS-host-redirect", "5/3"),
    ("echo-request", "8"),
    ("ping", "8"),
    ("router-advertisement", "9"),
    ("router-solicitation", "10"),
    ("time-exceeded", "11"),
    ("ttl-exceeded", "11"),
    ("ttl-zero-during-transit", "11/0"),
    ("ttl-zero-during-reassembly", "11/1"),
    ("parameter-problem", "12"),
    ("ip-header-bad", "12/0"),
    ("required-option-missing", "12/1"),
    ("timestamp-request", "13"),
    ("timestamp-reply", "14"),
    ("address-mask-request", "17"),
    ("address-mask-reply", "18"),
];

/// Translates an ICMP type to the form `iptables-save` prints.
///
/// Numeric types (`8`, `3/1`) pass through unchanged. Returns `None` for
/// unknown names.
pub fn icmp_type_code(value: &str) -> Option<&str> {
    if is_numeric_icmp(value) {
        return Some(value);
    }
    ICMP_TYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
        .map(|(_, code)| *code)
}

fn is_numeric_icmp(value: &str) -> bool {
    let mut parts = value.splitn(2, '/');
    let numeric = |part: Option<&str>| {
        part.is_some_and(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()))
    };
    let icmp_type = parts.next();
    match parts.next() {
        Some(code) => numeric(icmp_type) && numeric(Some(code)),
        None => numeric(icmp_type),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Match Option Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Validates a state list and returns it in listing order.
///
/// # Errors
///
/// Returns `Err` for an unknown state.
pub fn canonical_states(states: &[String]) -> Result<Vec<&'static str>, String> {
    let invalid = || {
        format!(
            "'state' accepts any of the following states: {}",
            STATE_ORDER.join(", ")
        )
    };

    if states.iter().any(|s| !STATE_ORDER.contains(&s.as_str())) {
        return Err(invalid());
    }

    // Known states only, so at most STATE_ORDER.len() distinct entries survive
    Ok(STATE_ORDER
        .iter()
        .copied()
        .filter(|known| states.iter().any(|s| s == known))
        .collect())
}

/// Validates a `--limit` value of the form `<count>/<sec|min|hour|day>`.
///
/// # Errors
///
/// Returns `Err` for a missing suffix, a non-numeric count or an unknown unit.
pub fn validate_limit(limit: &str) -> Result<(), String> {
    let Some((count, unit)) = limit.split_once('/') else {
        return Err(
            "Please append a valid suffix (sec/min/hour/day) to the value passed to 'limit'"
                .to_string(),
        );
    };

    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err("'limit' values must be numeric".to_string());
    }

    if !LIMIT_UNITS.contains(&unit) {
        return Err("Please use only sec/min/hour/day suffixes with 'limit'".to_string());
    }

    Ok(())
}

/// Validates `--limit-burst`, which needs a limit and a non-negative integer.
///
/// # Errors
///
/// Returns `Err` if no limit is set or the burst is not numeric.
pub fn validate_burst(burst: &str, limit: Option<&str>) -> Result<(), String> {
    if limit.is_none() {
        return Err("'burst' makes no sense without 'limit'".to_string());
    }
    if burst.is_empty() || !burst.bytes().all(|b| b.is_ascii_digit()) {
        return Err("'burst' accepts only numeric values".to_string());
    }
    Ok(())
}

/// Builds the quoted `--log-prefix` value, truncated to fit the kernel limit.
///
/// The limit is in bytes; a multi-byte character that would straddle it is dropped.
pub fn log_prefix_value(prefix: &str) -> String {
    let end = prefix
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= LOG_PREFIX_MAX_BYTES)
        .last()
        .unwrap_or(0);
    format!("\"{}: \"", &prefix[..end])
}
