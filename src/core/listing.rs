//! Live-state parser for `iptables-save` output
//!
//! The listing is a sequence of table sections:
//!
//! ```text
//! *filter
//! :INPUT ACCEPT [0:0]
//! -A INPUT -i lo -m comment --comment "loopback" -j ACCEPT
//! COMMIT
//! ```
//!
//! Every `-A` line becomes one [`LiveRule`], keyed either by its canonical
//! text or, for exact-position comparison, by `"<n> <text>"` where `n` counts
//! rules from 1 within the table. Canonical text is the trimmed line with
//! quoting normalised ([`flags::canonical`]): iptables 1.6 and later print
//! simple comments bare (`--comment ssh`), older releases always quote them. Attributes are read back through the same flag
//! grammar the compiler renders with, and addresses go through the same
//! normalizer, so equal rules compare byte-equal.
//!
//! Parsing is best-effort: a field that cannot be read keeps its raw value
//! and never aborts the rest of the listing.

use super::address::{self, AddressMode};
use super::firewall::Table;
use super::flags::{self, Flag};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Attributes of one applied rule as read from the listing
///
/// Missing fields are empty strings, except `source` and `destination`
/// which are `None` when the rule has no `-s`/`-d` clause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveRule {
    /// Trimmed line as listed
    pub line: String,
    pub table: Table,
    pub chain: String,
    /// Comment text, which carries the declared rule name
    pub name: String,
    pub proto: String,
    pub jump: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub sport: String,
    pub dport: String,
    pub iniface: String,
    pub outiface: String,
    pub todest: String,
    pub tosource: String,
    pub toports: String,
    pub reject: String,
    pub log_level: String,
    pub log_prefix: String,
    pub icmp: String,
    pub state: String,
    pub limit: String,
    pub burst: String,
}

/// One keyed entry of a table section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveEntry {
    pub key: String,
    pub rule: LiveRule,
}

/// Applied rules of one table, in listing order, unique by key
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableState {
    entries: Vec<LiveEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl TableState {
    fn insert(&mut self, key: String, rule: LiveRule) {
        if self.index.contains_key(&key) {
            // Identical lines collapse into one entry; pruning loops for the rest
            debug!("Duplicate live rule '{key}'");
            return;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(LiveEntry { key, rule });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&LiveRule> {
        self.index.get(key).map(|&i| &self.entries[i].rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed listing: every known table that had a section
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct LiveState {
    tables: BTreeMap<Table, TableState>,
}

impl LiveState {
    pub fn table(&self, table: Table) -> Option<&TableState> {
        self.tables.get(&table)
    }

    pub fn contains(&self, table: Table, key: &str) -> bool {
        self.tables.get(&table).is_some_and(|state| state.contains(key))
    }

    pub fn tables(&self) -> impl Iterator<Item = (Table, &TableState)> {
        self.tables.iter().map(|(table, state)| (*table, state))
    }

    /// Total number of entries over all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(TableState::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Section {
    /// Before the first header; rules default to `filter`
    Implicit,
    Known(Table),
    /// A table this engine does not manage (`security`, ...)
    Ignored,
}

/// Parses raw listing output.
///
/// With `numbered` set, keys are `"<n> <text>"` and the counter restarts at
/// every table header.
pub fn parse(raw: &str, numbered: bool, mode: AddressMode) -> LiveState {
    let mut state = LiveState::default();
    let mut section = Section::Implicit;
    let mut counter = 0usize;

    for raw_line in raw.lines() {
        let line = raw_line.trim();

        if let Some(name) = line.strip_prefix('*') {
            counter = 0;
            section = match name.parse::<Table>() {
                Ok(table) => {
                    state.tables.entry(table).or_default();
                    Section::Known(table)
                }
                Err(_) => {
                    debug!("Ignoring unmanaged table '{name}'");
                    Section::Ignored
                }
            };
            continue;
        }

        if !line.starts_with("-A ") {
            // Chain policies, COMMIT, comments and blank lines
            continue;
        }

        let table = match section {
            Section::Implicit => Table::Filter,
            Section::Known(table) => table,
            Section::Ignored => continue,
        };

        counter += 1;
        let text = flags::canonical(line);
        let key = if numbered {
            format!("{counter} {text}")
        } else {
            text
        };

        let rule = parse_rule(line, table, mode);
        state.tables.entry(table).or_default().insert(key, rule);
    }

    state
}

/// Reads the attributes of one `-A` line.
pub fn parse_rule(line: &str, table: Table, mode: AddressMode) -> LiveRule {
    let words = flags::words(line);
    let mut rule = LiveRule {
        line: line.to_string(),
        table,
        proto: "all".to_string(),
        ..LiveRule::default()
    };

    let mut i = 0;
    while i < words.len() {
        let word = &words[i];
        let Some(flag) = word.flag() else {
            if word.looks_like_option() {
                debug!("Unknown option '{}' in '{line}'", word.text);
            }
            i += 1;
            continue;
        };

        let Some(value) = words.get(i + 1).map(|w| w.text.as_str()) else {
            debug!("Option '{flag}' without a value in '{line}'");
            break;
        };

        match flag {
            Flag::Append | Flag::Delete => rule.chain = value.to_string(),
            Flag::Source => rule.source = Some(listed_address(value, mode, line)),
            Flag::Destination => rule.destination = Some(listed_address(value, mode, line)),
            Flag::InIface => rule.iniface = value.to_string(),
            Flag::OutIface => rule.outiface = value.to_string(),
            Flag::Protocol => rule.proto = value.to_string(),
            Flag::Jump => rule.jump = value.to_string(),
            Flag::SourcePort | Flag::SourcePorts => rule.sport = value.to_string(),
            Flag::DestPort | Flag::DestPorts => rule.dport = value.to_string(),
            Flag::IcmpType => rule.icmp = value.to_string(),
            Flag::State => rule.state = value.to_string(),
            Flag::Comment => rule.name = value.to_string(),
            Flag::Limit => rule.limit = value.to_string(),
            Flag::LimitBurst => rule.burst = value.to_string(),
            Flag::ToDestination => rule.todest = value.to_string(),
            Flag::ToSource => rule.tosource = value.to_string(),
            Flag::ToPorts => rule.toports = value.to_string(),
            Flag::RejectWith => rule.reject = value.to_string(),
            Flag::LogLevel => rule.log_level = value.to_string(),
            Flag::LogPrefix => rule.log_prefix = value.to_string(),
            Flag::Match | Flag::Table => {}
        }
        i += 2;
    }

    rule
}

fn listed_address(value: &str, mode: AddressMode, line: &str) -> String {
    address::normalize_listed(value, mode).unwrap_or_else(|e| {
        debug!("Keeping raw address '{value}' in '{line}': {e}");
        value.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"# Generated by iptables-save v1.4.10 on Thu Mar 10 22:52:05 2011
*mangle
:PREROUTING ACCEPT [875664:689439240]
:INPUT ACCEPT [873529:689050567]
COMMIT
*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [18:2900]
:OUTPUT ACCEPT [916757:232100143]
-A INPUT -p icmp -m icmp --icmp-type any -m comment --comment "Accept all icmp" -j ACCEPT
-A INPUT -i lo -m comment --comment "Accept all to lo interface" -j ACCEPT
-A INPUT -p tcp -m tcp -m multiport --dports 22,8001 -m comment --comment "Allow SSH from everywhere" -j ACCEPT
-A INPUT -m state --state RELATED,ESTABLISHED -m comment --comment "Default input REL,EST" -j ACCEPT
-A INPUT -j DROP
-A FORWARD -s 10.22.100.0/24 -i br1 -p tcp -m tcp -m comment --comment "100_Forward from virts" -j ACCEPT
-A FORWARD -o br0 -p tcp -m tcp -m comment --comment "900_Reject forwards to virts" -j REJECT --reject-with icmp-port-unreachable
COMMIT
*nat
:PREROUTING ACCEPT [7135:1080650]
-A POSTROUTING -s 10.22.100.0/24 -o br0 -p udp -m udp -m comment --comment "100_Masquerade other ips - udp" -j MASQUERADE
COMMIT
"#;

    #[test]
    fn test_unnumbered_keys_are_trimmed_lines() {
        let state = parse(LISTING, false, AddressMode::Cidr);
        assert_eq!(state.table(Table::Filter).unwrap().len(), 7);
        assert!(state.contains(Table::Filter, "-A INPUT -j DROP"));
        assert!(state.table(Table::Mangle).unwrap().is_empty());
        assert_eq!(state.len(), 8);
    }

    #[test]
    fn test_numbered_keys_restart_per_table() {
        let state = parse(LISTING, true, AddressMode::Cidr);
        assert!(state.contains(Table::Filter, "5 -A INPUT -j DROP"));
        assert!(state.contains(
            Table::Nat,
            "1 -A POSTROUTING -s 10.22.100.0/24 -o br0 -p udp -m udp -m comment --comment \"100_Masquerade other ips - udp\" -j MASQUERADE"
        ));
    }

    #[test]
    fn test_attribute_extraction() {
        let state = parse(LISTING, false, AddressMode::Legacy);
        let rule = state
            .table(Table::Filter)
            .unwrap()
            .get("-A FORWARD -s 10.22.100.0/24 -i br1 -p tcp -m tcp -m comment --comment \"100_Forward from virts\" -j ACCEPT")
            .unwrap();

        assert_eq!(rule.chain, "FORWARD");
        assert_eq!(rule.table, Table::Filter);
        assert_eq!(rule.name, "100_Forward from virts");
        assert_eq!(rule.source.as_deref(), Some("10.22.100.0/255.255.255.0"));
        assert_eq!(rule.destination, None);
        assert_eq!(rule.iniface, "br1");
        assert_eq!(rule.outiface, "");
        assert_eq!(rule.proto, "tcp");
        assert_eq!(rule.jump, "ACCEPT");
        assert_eq!(rule.reject, "");
    }

    #[test]
    fn test_target_and_match_fields() {
        let state = parse(LISTING, false, AddressMode::Cidr);
        let filter = state.table(Table::Filter).unwrap();

        let reject = filter
            .iter()
            .find(|e| e.rule.jump == "REJECT")
            .unwrap();
        assert_eq!(reject.rule.reject, "icmp-port-unreachable");
        assert_eq!(reject.rule.outiface, "br0");

        let ssh = filter
            .iter()
            .find(|e| e.rule.name == "Allow SSH from everywhere")
            .unwrap();
        assert_eq!(ssh.rule.dport, "22,8001");

        let state_rule = filter
            .iter()
            .find(|e| e.rule.state == "RELATED,ESTABLISHED")
            .unwrap();
        assert_eq!(state_rule.rule.proto, "all");

        let icmp = filter.iter().next().unwrap();
        assert_eq!(icmp.rule.icmp, "any");
    }

    #[test]
    fn test_bare_comment_keys_match_quoted_form() {
        let line = "-A INPUT -p tcp -m tcp --dport 22 -m comment --comment ssh -j ACCEPT";
        let state = parse(&format!("*filter\n{line}\nCOMMIT\n"), true, AddressMode::Cidr);
        let key = "1 -A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"ssh\" -j ACCEPT";

        assert!(state.contains(Table::Filter, key));
        let rule = state.table(Table::Filter).unwrap().get(key).unwrap();
        assert_eq!(rule.name, "ssh");
        assert_eq!(rule.line, line);
    }

    #[test]
    fn test_rules_before_any_header_are_filter() {
        let state = parse("-A INPUT -j ACCEPT\n", false, AddressMode::Cidr);
        assert!(state.contains(Table::Filter, "-A INPUT -j ACCEPT"));
    }

    #[test]
    fn test_unmanaged_tables_are_ignored() {
        let state = parse(
            "*security\n-A INPUT -j ACCEPT\nCOMMIT\n*filter\n-A INPUT -j DROP\nCOMMIT\n",
            true,
            AddressMode::Cidr,
        );
        assert_eq!(state.len(), 1);
        assert!(state.contains(Table::Filter, "1 -A INPUT -j DROP"));
    }

    #[test]
    fn test_duplicate_lines_collapse() {
        let state = parse(
            "*filter\n-A INPUT -j DROP\n-A INPUT -j DROP\nCOMMIT\n",
            false,
            AddressMode::Cidr,
        );
        assert_eq!(state.table(Table::Filter).unwrap().len(), 1);

        let numbered = parse(
            "*filter\n-A INPUT -j DROP\n-A INPUT -j DROP\nCOMMIT\n",
            true,
            AddressMode::Cidr,
        );
        assert_eq!(numbered.table(Table::Filter).unwrap().len(), 2);
    }

    #[test]
    fn test_bad_fields_do_not_abort() {
        let state = parse(
            "*filter\n-A INPUT -s not-an-address -p tcp --tcp-flags FIN,SYN SYN -j DROP\n-A OUTPUT -j\n-A INPUT -j ACCEPT\n",
            false,
            AddressMode::Cidr,
        );
        let filter = state.table(Table::Filter).unwrap();
        assert_eq!(filter.len(), 3);

        let first = filter.iter().next().unwrap();
        assert_eq!(first.rule.source.as_deref(), Some("not-an-address"));
        assert_eq!(first.rule.jump, "DROP");
    }

    #[test]
    fn test_log_prefix_unquoted() {
        let rule = parse_rule(
            "-A INPUT -j LOG --log-level 4 --log-prefix \"dropped: \"",
            Table::Filter,
            AddressMode::Cidr,
        );
        assert_eq!(rule.log_prefix, "dropped: ");
        assert_eq!(rule.log_level, "4");
    }
}
