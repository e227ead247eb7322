//! Per-table rule registry
//!
//! Collects compiled rules, orders them the way `iptables-save` will list
//! them, splices in the pre/post rule files and numbers the result.

use super::error::Result;
use super::firewall::{Chain, CompiledRule, RuleOrigin, Table};
use super::flags::{self, Flag};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Declared rules collected during a run, not yet ordered
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<Table, Vec<CompiledRule>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rules: impl IntoIterator<Item = CompiledRule>) {
        for rule in rules {
            self.tables.entry(rule.table).or_default().push(rule);
        }
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Orders every table and numbers the rules.
    ///
    /// Declared rules are stable-sorted by `(chain priority, name, source)` so
    /// declaration order never matters. Pre-file rules go in front of their
    /// table in file order, post-file rules after it.
    pub fn finalize(self, pre: Vec<CompiledRule>, post: Vec<CompiledRule>) -> RuleSet {
        let mut tables = self.tables;

        for rules in tables.values_mut() {
            rules.sort_by(|a, b| {
                (a.priority, &a.name, &a.source).cmp(&(b.priority, &b.name, &b.source))
            });
        }

        let mut pre_by_table: BTreeMap<Table, Vec<CompiledRule>> = BTreeMap::new();
        for rule in pre {
            pre_by_table.entry(rule.table).or_default().push(rule);
        }
        for (table, mut front) in pre_by_table {
            let rules = tables.entry(table).or_default();
            front.append(rules);
            *rules = front;
        }

        for rule in post {
            tables.entry(rule.table).or_default().push(rule);
        }

        for rules in tables.values_mut() {
            for (index, rule) in rules.iter_mut().enumerate() {
                rule.sequence = index + 1;
            }
        }

        tables.retain(|_, rules| !rules.is_empty());
        RuleSet { tables }
    }
}

/// Final declared state: ordered, numbered rules per table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    tables: BTreeMap<Table, Vec<CompiledRule>>,
}

impl RuleSet {
    /// Tables in listing order with their rules in sequence order.
    pub fn tables(&self) -> impl Iterator<Item = (Table, &[CompiledRule])> {
        self.tables.iter().map(|(table, rules)| (*table, rules.as_slice()))
    }

    pub fn rules(&self, table: Table) -> &[CompiledRule] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every rule, table by table, in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.tables.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// SHA-256 over every `<table> <numbered key>` line, in order.
    ///
    /// Two runs that declare the same final rule set share a checksum.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for rule in self.iter() {
            hasher.update(rule.table.as_ref().as_bytes());
            hasher.update(b" ");
            hasher.update(rule.numbered_key().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Parses a pre/post rule file.
///
/// Blank lines and `#` comments are skipped. A `-t <table>` selector picks
/// the table (default `filter`) and is removed from the rule text, since the
/// table travels separately to the add command. Lines for unknown tables or
/// without a leading `-A <chain>` are skipped with a warning.
pub fn parse_rule_file(content: &str, origin: RuleOrigin) -> Vec<CompiledRule> {
    let mut rules = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut words = flags::words(line);
        let mut table = Table::Filter;

        if let Some(pos) = words.iter().position(|w| w.flag() == Some(Flag::Table)) {
            let Some(name) = words.get(pos + 1).map(|w| w.text.clone()) else {
                warn!("{origin} file line {}: '-t' without a table, skipped", index + 1);
                continue;
            };
            let Ok(parsed) = name.parse::<Table>() else {
                warn!("{origin} file line {}: unknown table '{name}', skipped", index + 1);
                continue;
            };
            table = parsed;
            words.drain(pos..pos + 2);
        }

        let text = flags::render(&words);
        let Some(chain) = flags::appended_chain(&text) else {
            warn!(
                "{origin} file line {}: only '-A <chain> ...' rules can be converged, skipped",
                index + 1
            );
            continue;
        };

        rules.push(CompiledRule {
            table,
            priority: Chain::priority_of(&chain),
            chain,
            sequence: 0,
            name: String::new(),
            source: String::new(),
            text,
            origin,
        });
    }

    rules
}

/// Reads and parses a pre/post rule file; a missing file yields no rules.
pub async fn load_rule_file(path: &Path, origin: RuleOrigin) -> Result<Vec<CompiledRule>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let rules = parse_rule_file(&content, origin);
            info!("Loaded {} {origin} rule(s) from {}", rules.len(), path.display());
            Ok(rules)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No {origin} rule file at {}", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(table: Table, chain: Chain, name: &str, source: &str) -> CompiledRule {
        CompiledRule {
            table,
            chain: chain.to_string(),
            priority: chain.priority(),
            sequence: 0,
            name: name.to_string(),
            source: source.to_string(),
            text: format!("-A {chain} -m comment --comment \"{name}\" -j ACCEPT"),
            origin: RuleOrigin::Declared,
        }
    }

    fn names(set: &RuleSet, table: Table) -> Vec<String> {
        set.rules(table).iter().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn test_sort_by_chain_then_name_then_source() {
        let mut registry = TableRegistry::new();
        registry.insert([
            declared(Table::Filter, Chain::Output, "a", ""),
            declared(Table::Filter, Chain::Input, "zeta", ""),
            declared(Table::Filter, Chain::Input, "alpha", "10.0.0.2/32"),
            declared(Table::Filter, Chain::Input, "alpha", "10.0.0.1/32"),
            declared(Table::Filter, Chain::Forward, "b", ""),
        ]);

        let set = registry.finalize(Vec::new(), Vec::new());
        assert_eq!(names(&set, Table::Filter), vec!["alpha", "alpha", "zeta", "b", "a"]);
        assert_eq!(set.rules(Table::Filter)[0].source, "10.0.0.1/32");

        let sequences: Vec<usize> = set.rules(Table::Filter).iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let rules = vec![
            declared(Table::Filter, Chain::Input, "b", ""),
            declared(Table::Nat, Chain::Postrouting, "masq", ""),
            declared(Table::Filter, Chain::Input, "a", ""),
        ];
        let mut forward = TableRegistry::new();
        forward.insert(rules.clone());
        let mut backward = TableRegistry::new();
        backward.insert(rules.into_iter().rev());

        assert_eq!(
            forward.finalize(Vec::new(), Vec::new()),
            backward.finalize(Vec::new(), Vec::new())
        );
    }

    #[test]
    fn test_pre_and_post_splice() {
        let pre = parse_rule_file(
            "# pre rules\n\n-A INPUT -i lo -j ACCEPT\n-t nat -A PREROUTING -j ACCEPT\n-A INPUT -j LOG\n",
            RuleOrigin::PreFile,
        );
        let post = parse_rule_file("-A INPUT -j DROP\n", RuleOrigin::PostFile);

        let mut registry = TableRegistry::new();
        registry.insert([declared(Table::Filter, Chain::Input, "ssh", "")]);
        let set = registry.finalize(pre, post);

        let texts: Vec<&str> = set
            .rules(Table::Filter)
            .iter()
            .map(|r| r.text.as_str())
            .collect();
        assert_eq!(
            texts,
            vec![
                "-A INPUT -i lo -j ACCEPT",
                "-A INPUT -j LOG",
                "-A INPUT -m comment --comment \"ssh\" -j ACCEPT",
                "-A INPUT -j DROP",
            ]
        );
        assert_eq!(set.rules(Table::Filter)[3].sequence, 4);
        assert_eq!(set.rules(Table::Filter)[3].numbered_key(), "4 -A INPUT -j DROP");

        let nat = set.rules(Table::Nat);
        assert_eq!(nat.len(), 1);
        assert_eq!(nat[0].text, "-A PREROUTING -j ACCEPT");
        assert_eq!(nat[0].sequence, 1);
    }

    #[test]
    fn test_rule_file_keeps_quoted_values() {
        let rules = parse_rule_file(
            "-t filter -A INPUT -m comment --comment \"local traffic\" -j ACCEPT",
            RuleOrigin::PreFile,
        );
        assert_eq!(
            rules[0].text,
            "-A INPUT -m comment --comment \"local traffic\" -j ACCEPT"
        );
    }

    #[test]
    fn test_rule_file_escaped_quotes_survive() {
        let rules = parse_rule_file(
            r#"-t nat -A PREROUTING -m comment --comment "say \"hi\"" -j ACCEPT"#,
            RuleOrigin::PreFile,
        );
        assert_eq!(rules[0].table, Table::Nat);
        assert_eq!(
            rules[0].text,
            r#"-A PREROUTING -m comment --comment "say \"hi\"" -j ACCEPT"#
        );
        assert_eq!(
            flags::split_args(&rules[0].text),
            vec!["-A", "PREROUTING", "-m", "comment", "--comment", "say \"hi\"", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn test_rule_file_skips_bad_lines() {
        let rules = parse_rule_file(
            "-t security -A INPUT -j ACCEPT\n-I INPUT 1 -j ACCEPT\n-t\n   # indented comment\n-A fail2ban -j RETURN\n",
            RuleOrigin::PostFile,
        );
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].chain, "fail2ban");
        assert_eq!(rules[0].priority, u8::MAX);
    }

    #[test]
    fn test_iteration_order() {
        let mut registry = TableRegistry::new();
        registry.insert([
            declared(Table::Raw, Chain::Prerouting, "raw", ""),
            declared(Table::Nat, Chain::Postrouting, "nat", ""),
            declared(Table::Filter, Chain::Input, "filter", ""),
        ]);
        assert_eq!(registry.len(), 3);
        let set = registry.finalize(Vec::new(), Vec::new());
        let order: Vec<&str> = set.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["filter", "nat", "raw"]);
        assert!(set.rules(Table::Mangle).is_empty());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let build = |name: &str| {
            let mut registry = TableRegistry::new();
            registry.insert([declared(Table::Filter, Chain::Input, name, "")]);
            registry.finalize(Vec::new(), Vec::new())
        };
        assert_eq!(build("ssh").checksum(), build("ssh").checksum());
        assert_ne!(build("ssh").checksum(), build("http").checksum());
        assert_eq!(build("ssh").checksum().len(), 64);
    }

    #[tokio::test]
    async fn test_missing_rule_file_is_empty() {
        let path = Path::new("/nonexistent/iptsync/pre.iptables");
        let rules = load_rule_file(path, RuleOrigin::PreFile).await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_load_rule_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("post.iptables");
        tokio::fs::write(&path, "-A INPUT -j DROP\n").await.unwrap();

        let rules = load_rule_file(&path, RuleOrigin::PostFile).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].origin, RuleOrigin::PostFile);
    }
}
