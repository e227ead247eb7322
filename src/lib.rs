//! iptsync - declarative iptables convergence
//!
//! Compiles declared rule specs into the canonical text `iptables-save`
//! prints, then drives the live rule set to match: undeclared rules are
//! pruned, and a rule set that drifted out of order is rebuilt and persisted.
//!
//! # Architecture
//!
//! - [`core`] - Rule compilation, listing parsing and the convergence engine
//! - [`audit`] - Audit logging for every applied run
//! - [`validators`] - Input validation for rule specs
//! - [`config`] - Configuration loading
//! - [`elevation`] - Privilege escalation for iptables commands
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Guarantees
//!
//! - A second run against an unchanged firewall issues no mutating command
//! - Declaration order never changes the applied order
//! - An invalid declaration is skipped without affecting the others
//! - Commands are executed without a shell

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::converge::{ConvergeOptions, ConvergeReport, Session};
pub use core::error::{Error, Result};
pub use core::firewall::{Chain, Jump, Protocol, RuleSpec, Table};
