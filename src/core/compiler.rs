//! Rule compiler
//!
//! Turns one declared [`RuleSpec`] into one [`CompiledRule`] per source address,
//! each carrying canonical rule text in exactly the form `iptables-save` lists
//! it. Clause order:
//!
//! ```text
//! -A CHAIN [-s SRC] [-d DST] [-i IF] [-o IF] [-p P [-m P]]
//!   [--sport | -m multiport --sports] [--dport | -m multiport --dports]
//!   [--icmp-type T] [-m state --state S] -m comment --comment "NAME"
//!   [-m limit --limit L [--limit-burst B]] -j JUMP [target options]
//! ```
//!
//! Compilation is pure: the same spec and address mode always produce the
//! same text. Host names in `source`/`destination` are resolved, so the
//! result can change only if DNS does.

use super::address::{self, AddressMode};
use super::error::{Error, Result};
use super::firewall::{CompiledRule, Jump, PortSpec, Protocol, RuleOrigin, RuleSpec, Table};
use super::flags::{Flag, RuleText, quote};
use super::rule_constraints::{
    DEFAULT_REJECT_WITH, MAX_MULTIPORT_ENTRIES, canonical_states, chain_allowed_in_table,
    icmp_type_code, iniface_allowed, log_prefix_value, outiface_allowed, protocol_has_match_extension,
    protocol_supports_ports, validate_burst, validate_limit,
};
use crate::validators::{
    validate_interface, validate_log_prefix, validate_port_entry, validate_rule_name,
    validate_token,
};
use tracing::{debug, warn};

/// Compiles rule specs for one address rendering mode
#[derive(Debug, Clone, Copy, Default)]
pub struct Compiler {
    mode: AddressMode,
}

impl Compiler {
    pub fn new(mode: AddressMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    /// Compiles a spec into one rule per declared source (one rule if none).
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the spec breaks a field constraint
    /// - [`Error::Format`] if an address or netmask cannot be normalized
    ///
    /// Neither is fatal to a run: the caller skips the spec and goes on.
    pub fn compile(&self, spec: &RuleSpec) -> Result<Vec<CompiledRule>> {
        let invalid = |message: String| Error::validation(&spec.name, message);

        validate_rule_name(&spec.name).map_err(invalid)?;

        if !chain_allowed_in_table(spec.table, spec.chain) {
            return Err(invalid(format!(
                "{} cannot be used in table '{}'",
                spec.chain, spec.table
            )));
        }

        let sources = spec
            .source
            .iter()
            .map(|source| address::normalize(source, self.mode))
            .collect::<Result<Vec<_>>>()?;

        let clauses = self.clauses(spec)?;
        let chain = spec.chain.to_string();

        let render = |source: Option<&str>| {
            let mut text = RuleText::append(&chain);
            if let Some(source) = source {
                text.flag(Flag::Source, source);
            }
            for (flag, value) in &clauses {
                text.flag(*flag, value);
            }
            text.build()
        };

        let texts: Vec<(String, String)> = if sources.is_empty() {
            vec![(String::new(), render(None))]
        } else {
            sources
                .into_iter()
                .map(|source| {
                    let text = render(Some(&source));
                    (source, text)
                })
                .collect()
        };

        Ok(texts
            .into_iter()
            .map(|(source, text)| {
                debug!("Compiled '{}' [{}]: {}", spec.name, spec.table, text);
                CompiledRule {
                    table: spec.table,
                    chain: chain.clone(),
                    priority: spec.chain.priority(),
                    sequence: 0,
                    name: spec.name.clone(),
                    source,
                    text,
                    origin: RuleOrigin::Declared,
                }
            })
            .collect())
    }

    /// Every clause after the source, in canonical order.
    fn clauses(&self, spec: &RuleSpec) -> Result<Vec<(Flag, String)>> {
        let invalid = |message: String| Error::validation(&spec.name, message);
        let mut out = Vec::new();

        if let Some(destination) = &spec.destination {
            out.push((Flag::Destination, address::normalize(destination, self.mode)?));
        }

        if let Some(iface) = &spec.iniface {
            if !iniface_allowed(spec.chain) {
                return Err(invalid(
                    "--in-interface only applies to INPUT/FORWARD/PREROUTING".to_string(),
                ));
            }
            validate_interface(iface).map_err(invalid)?;
            out.push((Flag::InIface, iface.clone()));
        }

        if let Some(iface) = &spec.outiface {
            if !outiface_allowed(spec.chain) {
                return Err(invalid(
                    "--out-interface only applies to OUTPUT/FORWARD/POSTROUTING".to_string(),
                ));
            }
            validate_interface(iface).map_err(invalid)?;
            out.push((Flag::OutIface, iface.clone()));
        }

        if spec.proto != Protocol::All {
            out.push((Flag::Protocol, spec.proto.to_string()));
            if protocol_has_match_extension(spec.proto) {
                out.push((Flag::Match, spec.proto.to_string()));
            }
        }

        let port_fields = [
            ("sport", &spec.sport, Flag::SourcePort, Flag::SourcePorts),
            ("dport", &spec.dport, Flag::DestPort, Flag::DestPorts),
        ];
        for (field, ports, single, multi) in port_fields {
            let Some(ports) = ports else { continue };

            if !protocol_supports_ports(spec.proto) {
                return Err(invalid(format!("'{field}' only applies to tcp/udp")));
            }

            match ports {
                PortSpec::Single(port) => {
                    validate_port_entry(port).map_err(invalid)?;
                    out.push((single, port.clone()));
                }
                PortSpec::List(list) => {
                    if list.len() > MAX_MULTIPORT_ENTRIES {
                        return Err(invalid(format!(
                            "multiport module only accepts <= {MAX_MULTIPORT_ENTRIES} ports"
                        )));
                    }
                    for port in list {
                        validate_port_entry(port).map_err(invalid)?;
                    }
                    out.push((Flag::Match, "multiport".to_string()));
                    out.push((multi, ports.to_string()));
                }
            }
        }

        if spec.proto == Protocol::Icmp {
            let icmp = match spec.icmp.as_deref() {
                None => "any",
                Some(name) => icmp_type_code(name)
                    .ok_or_else(|| invalid(format!("unknown icmp type '{name}'")))?,
            };
            out.push((Flag::IcmpType, icmp.to_string()));
        } else if let Some(icmp) = &spec.icmp {
            warn!(
                "Rule '{}': 'icmp' = {icmp} ignored for proto {}",
                spec.name, spec.proto
            );
        }

        if !spec.state.is_empty() {
            let states = canonical_states(&spec.state).map_err(invalid)?;
            out.push((Flag::Match, "state".to_string()));
            out.push((Flag::State, states.join(",")));
        }

        out.push((Flag::Match, "comment".to_string()));
        out.push((Flag::Comment, quote(&spec.name)));

        if let Some(limit) = &spec.limit {
            validate_limit(limit).map_err(invalid)?;
            out.push((Flag::Match, "limit".to_string()));
            out.push((Flag::Limit, limit.clone()));
        }

        if let Some(burst) = &spec.burst {
            validate_burst(burst, spec.limit.as_deref()).map_err(invalid)?;
            out.push((Flag::LimitBurst, burst.clone()));
        }

        out.push((Flag::Jump, spec.jump.to_string()));
        target_options(spec, &mut out)?;

        Ok(out)
    }
}

/// Options that follow `-j <target>`.
fn target_options(spec: &RuleSpec, out: &mut Vec<(Flag, String)>) -> Result<()> {
    let invalid = |message: String| Error::validation(&spec.name, message);
    let require_nat = |jump: Jump| {
        if spec.table == Table::Nat {
            Ok(())
        } else {
            Err(invalid(format!("{jump} only applies to table 'nat'")))
        }
    };
    let required = |value: &Option<String>, field: &str| {
        let value = value
            .as_deref()
            .ok_or_else(|| {
                invalid(format!("{} missing mandatory '{field}' parameter", spec.jump))
            })?;
        validate_token(field, value).map_err(invalid)?;
        Ok::<_, Error>(value.to_string())
    };

    match spec.jump {
        Jump::Dnat => {
            require_nat(Jump::Dnat)?;
            out.push((Flag::ToDestination, required(&spec.todest, "todest")?));
        }
        Jump::Snat => {
            require_nat(Jump::Snat)?;
            out.push((Flag::ToSource, required(&spec.tosource, "tosource")?));
        }
        Jump::Redirect => {
            out.push((Flag::ToPorts, required(&spec.toports, "toports")?));
        }
        Jump::Masquerade => require_nat(Jump::Masquerade)?,
        Jump::Reject => {
            let reject = spec.reject.as_deref().unwrap_or(DEFAULT_REJECT_WITH);
            validate_token("reject", reject).map_err(invalid)?;
            out.push((Flag::RejectWith, reject.to_string()));
        }
        Jump::Log => {
            if let Some(level) = &spec.log_level {
                validate_token("log_level", level).map_err(invalid)?;
                out.push((Flag::LogLevel, level.clone()));
            }
            if let Some(prefix) = &spec.log_prefix {
                validate_log_prefix(prefix).map_err(invalid)?;
                out.push((Flag::LogPrefix, log_prefix_value(prefix)));
            }
        }
        Jump::Accept | Jump::Drop => {}
    }

    Ok(())
}
