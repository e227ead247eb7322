//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::converge::Mutation;
use crate::core::error::{Error, Result};
use crate::core::firewall::{Chain, PortSpec, Protocol, RuleSpec, Table};
use crate::core::flags::{split_args, words};
use crate::core::iptables::{IptablesOps, PersistCommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use strum::IntoEnumIterator;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("IPTSYNC_TEST_NO_ELEVATION");
///     std::env::set_var("IPTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::set_var("IPTSYNC_TEST_NO_ELEVATION", "1");
///     std::env::remove_var("IPTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Path of the stateful shell mock (`tests/mock_iptables.sh`).
pub fn mock_script() -> PathBuf {
    PathBuf::from(format!("{}/tests/mock_iptables.sh", env!("CARGO_MANIFEST_DIR")))
}

/// Writes `iptables` and `iptables-save` wrappers into `dir` that run the
/// shell mock against a state file in the same directory.
///
/// Point [`crate::core::iptables::IptablesCommand::with_dir`] at `dir`.
pub fn install_mock_binaries(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let state = dir.join("state");
    std::fs::write(&state, "").unwrap();

    for (name, mode) in [("iptables", "iptables"), ("iptables-save", "save")] {
        let path = dir.join(name);
        let wrapper = format!(
            "#!/bin/sh\nexec sh '{}' '{}' {mode} \"$@\"\n",
            mock_script().display(),
            state.display()
        );
        std::fs::write(&path, wrapper).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

#[derive(Debug, Default)]
struct FakeState {
    /// Per table, rules as `(chain, "-A ...")` in insertion order
    tables: BTreeMap<Table, Vec<(String, String)>>,
    mutations: Vec<Mutation>,
    saves: usize,
    fail_when: Option<String>,
}

/// In-memory iptables with kernel-like ordering
///
/// `save()` lists every table (empty ones included) with rules grouped by
/// chain in built-in chain order, like `iptables-save` does. Quoted values
/// are printed the way iptables 1.8 prints them: bare when they only hold
/// `[A-Za-z0-9_-]` (`--comment ssh`), quoted and escaped otherwise. Deleting
/// by rule text matches on arguments, not on quoting.
#[derive(Debug)]
pub struct FakeIptables {
    state: Mutex<FakeState>,
    version: String,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            version: "iptables v1.8.9 (legacy)".to_string(),
        }
    }
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Seeds the live rules from `iptables-save` style text.
    pub fn seeded(listing: &str) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock().unwrap();
            let mut table = Table::Filter;
            for line in listing.lines().map(str::trim) {
                if let Some(name) = line.strip_prefix('*') {
                    table = name.parse().unwrap();
                } else if line.starts_with("-A ") {
                    let chain = crate::core::flags::appended_chain(line).unwrap();
                    state
                        .tables
                        .entry(table)
                        .or_default()
                        .push((chain, line.to_string()));
                }
            }
        }
        fake
    }

    /// Fails every mutating call whose command line contains `needle`.
    pub fn fail_when(&self, needle: &str) {
        self.state.lock().unwrap().fail_when = Some(needle.to_string());
    }

    /// Live rule texts of one table in listing order.
    pub fn rules(&self, table: Table) -> Vec<String> {
        let state = self.state.lock().unwrap();
        sorted(state.tables.get(&table).map(Vec::as_slice).unwrap_or_default())
            .into_iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Mutating calls received so far.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn save_count(&self) -> usize {
        self.state.lock().unwrap().saves
    }

    fn mutate(
        &self,
        mutation: Mutation,
        apply: impl FnOnce(&mut FakeState) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let command = mutation.to_string();
        if state.fail_when.as_ref().is_some_and(|n| command.contains(n)) {
            return Err(Error::Execution {
                command,
                stderr: "iptables: simulated failure.".to_string(),
                exit_code: Some(1),
            });
        }
        apply(&mut *state)?;
        state.mutations.push(mutation);
        Ok(())
    }
}

fn sorted(rules: &[(String, String)]) -> Vec<&(String, String)> {
    let mut rules: Vec<_> = rules.iter().collect();
    rules.sort_by_key(|(chain, _)| Chain::priority_of(chain));
    rules
}

/// Renders stored rule text the way `iptables-save` 1.8 prints it.
fn listed(text: &str) -> String {
    words(text)
        .iter()
        .map(|word| {
            let bare = !word.text.is_empty()
                && word
                    .text
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
            if !word.quoted || bare {
                return word.text.clone();
            }
            let mut out = String::from("\"");
            for c in word.text.chars() {
                if matches!(c, '"' | '\\' | '\'') {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
            out
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn bad_rule(command: String) -> Error {
    Error::Execution {
        command,
        stderr: "iptables: Bad rule (does a matching rule exist in that chain?).".to_string(),
        exit_code: Some(1),
    }
}

impl IptablesOps for FakeIptables {
    async fn version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn save(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.saves += 1;

        let mut out = String::from("# Generated by iptables-save v1.8.9\n");
        for table in Table::iter() {
            out.push_str(&format!("*{table}\n"));
            for chain in Chain::iter() {
                if super::rule_constraints::chain_allowed_in_table(table, chain) {
                    out.push_str(&format!(":{chain} ACCEPT [0:0]\n"));
                }
            }
            let rules = state.tables.get(&table).map(Vec::as_slice).unwrap_or_default();
            for (_, text) in sorted(rules) {
                out.push_str(&listed(text));
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        Ok(out)
    }

    async fn append(&self, table: Table, rule: &str) -> Result<()> {
        let mutation = Mutation::Append {
            table,
            rule: rule.to_string(),
        };
        self.mutate(mutation, |state| {
            let chain = crate::core::flags::appended_chain(rule)
                .ok_or_else(|| Error::Internal(format!("not an append: {rule}")))?;
            state
                .tables
                .entry(table)
                .or_default()
                .push((chain, rule.to_string()));
            Ok(())
        })
    }

    async fn delete(&self, table: Table, rule: &str) -> Result<()> {
        let mutation = Mutation::Delete {
            table,
            rule: rule.to_string(),
        };
        let command = mutation.to_string();
        self.mutate(mutation, |state| {
            let rules = state.tables.entry(table).or_default();
            let args = split_args(rule);
            let pos = rules
                .iter()
                .position(|(_, text)| split_args(text) == args)
                .ok_or_else(|| bad_rule(command))?;
            rules.remove(pos);
            Ok(())
        })
    }

    async fn delete_at(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        let mutation = Mutation::DeleteAt {
            table,
            chain: chain.to_string(),
            position,
        };
        let command = mutation.to_string();
        self.mutate(mutation, |state| {
            let rules = state.tables.entry(table).or_default();
            let pos = rules
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| c == chain)
                .nth(position.saturating_sub(1))
                .map(|(i, _)| i)
                .ok_or_else(|| Error::Execution {
                    command,
                    stderr: "iptables: Index of deletion too big.".to_string(),
                    exit_code: Some(1),
                })?;
            rules.remove(pos);
            Ok(())
        })
    }

    async fn persist(&self, command: &PersistCommand) -> Result<()> {
        self.mutate(
            Mutation::Persist {
                command: command.clone(),
            },
            |_| Ok(()),
        )
    }
}

/// Creates a test spec: TCP on INPUT, ACCEPT, with an optional port.
///
/// This is the canonical helper for creating test declarations.
pub fn create_test_spec(name: &str, dport: Option<u16>) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        dport: dport.map(|p| PortSpec::Single(p.to_string())),
        ..RuleSpec::default()
    }
}

/// Creates a test spec with the commonly varied fields populated.
///
/// # Arguments
///
/// * `name` - The rule name (rendered as the comment)
/// * `proto` - Protocol
/// * `dports` - Destination ports; more than one uses multiport
/// * `source` - Optional source address
/// * `iniface` - Optional input interface
pub fn create_full_test_spec(
    name: &str,
    proto: Protocol,
    dports: &[u16],
    source: Option<&str>,
    iniface: Option<&str>,
) -> RuleSpec {
    let dport = match dports {
        [] => None,
        [single] => Some(PortSpec::Single(single.to_string())),
        many => Some(PortSpec::List(many.iter().map(ToString::to_string).collect())),
    };
    RuleSpec {
        name: name.to_string(),
        proto,
        dport,
        source: source.map(String::from).into_iter().collect(),
        iniface: iniface.map(String::from),
        ..RuleSpec::default()
    }
}
