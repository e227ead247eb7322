//! Core convergence functionality
//!
//! This module contains the types and logic for driving a live iptables rule
//! set to a declared one. It provides:
//!
//! - [`firewall`]: Declared rule specs, tables, chains and compiled rules
//! - [`address`]: IPv4 address and netmask normalization
//! - [`flags`]: Rule text building and tokenizing
//! - [`compiler`]: Rule spec to canonical `iptables-save` text
//! - [`registry`]: Per-table ordering, pre/post rule files and checksums
//! - [`listing`]: `iptables-save` output parsing
//! - [`iptables`]: Backend seam and the process backend
//! - [`converge`]: Prune and resync against the live rule set
//! - [`manifest`]: JSON rule manifests
//! - [`error`]: Error types and iptables error translations
//! - [`rule_constraints`]: Business rules for valid field combinations

pub mod address;
pub mod compiler;
pub mod converge;
pub mod error;
pub mod firewall;
pub mod flags;
pub mod iptables;
pub mod listing;
pub mod manifest;
pub mod registry;
pub mod rule_constraints;

#[cfg(test)]
pub mod test_helpers;
