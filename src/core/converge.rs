//! Convergence engine
//!
//! A [`Session`] collects declarations and then drives the live rule set to
//! match them in two phases:
//!
//! 1. **Prune**: delete every live rule whose text matches no declared rule,
//!    re-reading the listing until a pass deletes nothing.
//! 2. **Resync**: compare positions. If any declared rule is not at its exact
//!    position, append the whole declared set and then flush the old entries
//!    by deleting position 1 of their chain once per entry. Then persist.
//!
//! A run that finds everything in place issues no mutating command.
//!
//! A failing command aborts the run. Nothing is rolled back; re-running
//! converges from whatever state was left.
//!
//! # Example
//!
//! ```no_run
//! use iptsync::core::address::AddressMode;
//! use iptsync::core::converge::{ConvergeOptions, Session};
//! use iptsync::core::iptables::IptablesCommand;
//! use iptsync::core::manifest;
//!
//! # async fn example() -> iptsync::Result<()> {
//! let specs = manifest::load(std::path::Path::new("rules.json")).await?;
//! let mut session = Session::new(IptablesCommand::new(), AddressMode::Cidr, ConvergeOptions::default());
//! session.declare_all(&specs);
//! let report = session.converge().await?;
//! println!("changed: {}", report.changed);
//! # Ok(())
//! # }
//! ```

use super::address::AddressMode;
use super::compiler::Compiler;
use super::error::Result;
use super::firewall::{CompiledRule, RuleSpec, Table};
use super::flags::to_delete_text;
use super::iptables::{IptablesOps, PersistCommand};
use super::listing::{self, LiveState};
use super::registry::{RuleSet, TableRegistry};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Run-level settings
#[derive(Debug, Clone, Default)]
pub struct ConvergeOptions {
    /// Report mutating commands instead of running them
    pub dry_run: bool,
    /// `None` means rules are applied but not saved
    pub persist: Option<PersistCommand>,
    pub pre_rules: Vec<CompiledRule>,
    pub post_rules: Vec<CompiledRule>,
}

/// A declaration that failed to compile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub name: String,
    pub reason: String,
}

/// One mutating command, executed or (in dry-run) only reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Append { table: Table, rule: String },
    Delete { table: Table, rule: String },
    DeleteAt { table: Table, chain: String, position: usize },
    Persist { command: PersistCommand },
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Append { table, rule } => write!(f, "iptables -t {table} {rule}"),
            Mutation::Delete { table, rule } => {
                write!(f, "iptables -t {table} {}", to_delete_text(rule))
            }
            Mutation::DeleteAt {
                table,
                chain,
                position,
            } => write!(f, "iptables -t {table} -D {chain} {position}"),
            Mutation::Persist { command } => write!(f, "{command}"),
        }
    }
}

/// Reference to a live rule scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveRuleRef {
    pub table: Table,
    pub chain: String,
    pub key: String,
}

/// Flush-then-rebuild plan for a drifted rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    /// Every declared rule, table by table, in sequence order
    pub to_add: Vec<CompiledRule>,
    /// Every live entry, each removed by deleting position 1 of its chain
    pub to_delete: Vec<LiveRuleRef>,
}

impl ReconciliationPlan {
    /// Compares declared rules against a numbered listing.
    ///
    /// Returns `None` when every declared rule sits at its exact position.
    /// A single mismatch makes the whole declared set the plan.
    pub fn compute(declared: &RuleSet, live: &LiveState) -> Option<Self> {
        let missing = declared.tables().find_map(|(table, rules)| {
            rules
                .iter()
                .find(|rule| !live.contains(table, &rule.numbered_key()))
                .map(|rule| (table, rule))
        });

        let (table, rule) = missing?;
        debug!("Missing at position [{table}]: {}", rule.numbered_key());

        let to_delete = live
            .tables()
            .flat_map(|(table, state)| {
                state.iter().map(move |entry| LiveRuleRef {
                    table,
                    chain: entry.rule.chain.clone(),
                    key: entry.key.clone(),
                })
            })
            .collect();

        Some(Self {
            to_add: declared.iter().cloned().collect(),
            to_delete,
        })
    }
}

/// Outcome of one convergence run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergeReport {
    pub dry_run: bool,
    /// Rules in the final declared set, pre/post file rules included
    pub declared: usize,
    pub rejected: Vec<Rejection>,
    pub checksum: String,
    pub pruned: usize,
    pub changed: bool,
    pub added: usize,
    pub deleted: usize,
    pub persisted: bool,
    /// Rules changed but no persistence command is known
    pub persist_unavailable: bool,
    pub commands: Vec<Mutation>,
}

/// One convergence cycle: declarations in, one converge out
///
/// Dropping a session discards everything it collected.
pub struct Session<B: IptablesOps> {
    backend: B,
    compiler: Compiler,
    registry: TableRegistry,
    options: ConvergeOptions,
    rejected: Vec<Rejection>,
}

impl<B: IptablesOps> Session<B> {
    pub fn new(backend: B, mode: AddressMode, options: ConvergeOptions) -> Self {
        Self {
            backend,
            compiler: Compiler::new(mode),
            registry: TableRegistry::new(),
            options,
            rejected: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Address rendering used for declared and listed rules.
    pub fn mode(&self) -> AddressMode {
        self.compiler.mode()
    }

    /// Compiles and records one declaration.
    ///
    /// Returns `false` if the spec was rejected; the rejection is logged and
    /// kept for the report, and the remaining declarations are unaffected.
    pub fn declare(&mut self, spec: &RuleSpec) -> bool {
        match self.compiler.compile(spec) {
            Ok(rules) => {
                debug!("Declared '{}' ({} rule(s))", spec.name, rules.len());
                self.registry.insert(rules);
                true
            }
            Err(e) => {
                error!("{e}. Ignoring rule.");
                self.rejected.push(Rejection {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Declares every spec; returns how many were accepted.
    pub fn declare_all<'a>(&mut self, specs: impl IntoIterator<Item = &'a RuleSpec>) -> usize {
        specs
            .into_iter()
            .map(|spec| self.declare(spec))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    /// The declared rule set as `converge` would apply it.
    pub fn preview(&self) -> RuleSet {
        self.registry
            .clone()
            .finalize(self.options.pre_rules.clone(), self.options.post_rules.clone())
    }

    /// Runs prune and resync against the live rule set.
    ///
    /// # Errors
    ///
    /// Returns the first failing listing or mutating command. Commands already
    /// executed stay applied.
    pub async fn converge(mut self) -> Result<ConvergeReport> {
        let registry = std::mem::take(&mut self.registry);
        let pre = std::mem::take(&mut self.options.pre_rules);
        let post = std::mem::take(&mut self.options.post_rules);
        let declared = registry.finalize(pre, post);

        let mut report = ConvergeReport {
            dry_run: self.options.dry_run,
            declared: declared.len(),
            rejected: std::mem::take(&mut self.rejected),
            checksum: declared.checksum(),
            ..ConvergeReport::default()
        };

        info!(
            "Converging {} rule(s), {} rejected{}",
            report.declared,
            report.rejected.len(),
            if report.dry_run { " (dry run)" } else { "" }
        );

        report.pruned = self.prune(&declared, &mut report).await?;
        if report.pruned > 0 {
            info!("Pruned {} undeclared rule(s)", report.pruned);
        }

        let live = self.listing(true).await?;
        let Some(plan) = ReconciliationPlan::compute(&declared, &live) else {
            info!("Rules unchanged");
            return Ok(report);
        };

        report.changed = true;
        info!(
            "Rules have changed, adding {} rule(s) and flushing {} old one(s)",
            plan.to_add.len(),
            plan.to_delete.len()
        );

        for rule in plan.to_add {
            self.execute(
                Mutation::Append {
                    table: rule.table,
                    rule: rule.text,
                },
                &mut report,
            )
            .await?;
            report.added += 1;
        }

        for old in plan.to_delete {
            self.execute(
                Mutation::DeleteAt {
                    table: old.table,
                    chain: old.chain,
                    position: 1,
                },
                &mut report,
            )
            .await?;
            report.deleted += 1;
        }

        match self.options.persist.clone() {
            Some(command) => {
                self.execute(Mutation::Persist { command }, &mut report)
                    .await?;
                report.persisted = !report.dry_run;
            }
            None => {
                warn!("No save method known for this platform. Rules will not be saved!");
                report.persist_unavailable = true;
            }
        }

        Ok(report)
    }

    /// Deletes undeclared live rules until a pass deletes none.
    ///
    /// Identical live lines collapse into one entry per pass, so each extra
    /// copy takes another pass. In dry-run nothing changes between passes and
    /// the first pass is final.
    async fn prune(&self, declared: &RuleSet, report: &mut ConvergeReport) -> Result<usize> {
        let mut total = 0;

        loop {
            let live = self.listing(false).await?;
            let mut deleted = 0;

            for (table, state) in live.tables() {
                let keep: HashSet<&str> = declared
                    .rules(table)
                    .iter()
                    .map(|rule| rule.text.as_str())
                    .collect();

                for entry in state.iter().filter(|e| !keep.contains(e.key.as_str())) {
                    self.execute(
                        Mutation::Delete {
                            table,
                            rule: entry.key.clone(),
                        },
                        report,
                    )
                    .await?;
                    deleted += 1;
                }
            }

            total += deleted;
            if deleted == 0 || self.options.dry_run {
                break;
            }
        }

        Ok(total)
    }

    async fn listing(&self, numbered: bool) -> Result<LiveState> {
        let raw = self.backend.save().await?;
        Ok(listing::parse(&raw, numbered, self.compiler.mode()))
    }

    async fn execute(&self, mutation: Mutation, report: &mut ConvergeReport) -> Result<()> {
        if self.options.dry_run {
            info!("Would have run: {mutation} (dry run)");
        } else {
            debug!("Running: {mutation}");
            match &mutation {
                Mutation::Append { table, rule } => self.backend.append(*table, rule).await?,
                Mutation::Delete { table, rule } => self.backend.delete(*table, rule).await?,
                Mutation::DeleteAt {
                    table,
                    chain,
                    position,
                } => self.backend.delete_at(*table, chain, *position).await?,
                Mutation::Persist { command } => self.backend.persist(command).await?,
            }
        }
        report.commands.push(mutation);
        Ok(())
    }
}
