//! The iptables flag/value grammar shared by the compiler and the listing parser
//!
//! Rule text is a space-separated sequence of flags (`-p`, `--dport`, ...) and
//! values, where a value may be a double-quoted string containing spaces
//! (`--comment "Allow DNS"`). The compiler renders through [`RuleText`] and the
//! parser reads through [`words`], both keyed by [`Flag`], so a rendered rule
//! always parses back into the attributes it was rendered from.

use logos::Logos;
use std::fmt::Write;

/// Flags the compiler emits and the listing parser understands
///
/// `Display` gives the short form `iptables-save` prints; parsing also accepts
/// the long aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Flag {
    #[strum(to_string = "-A", serialize = "--append")]
    Append,
    #[strum(to_string = "-D", serialize = "--delete")]
    Delete,
    #[strum(to_string = "-t", serialize = "--table")]
    Table,
    #[strum(to_string = "-s", serialize = "--source", serialize = "--src")]
    Source,
    #[strum(to_string = "-d", serialize = "--destination", serialize = "--dst")]
    Destination,
    #[strum(to_string = "-i", serialize = "--in-interface")]
    InIface,
    #[strum(to_string = "-o", serialize = "--out-interface")]
    OutIface,
    #[strum(to_string = "-p", serialize = "--protocol")]
    Protocol,
    #[strum(to_string = "-m", serialize = "--match")]
    Match,
    #[strum(to_string = "-j", serialize = "--jump")]
    Jump,
    #[strum(to_string = "--sport", serialize = "--source-port")]
    SourcePort,
    #[strum(to_string = "--sports", serialize = "--source-ports")]
    SourcePorts,
    #[strum(to_string = "--dport", serialize = "--destination-port")]
    DestPort,
    #[strum(to_string = "--dports", serialize = "--destination-ports")]
    DestPorts,
    #[strum(to_string = "--icmp-type")]
    IcmpType,
    #[strum(to_string = "--state")]
    State,
    #[strum(to_string = "--comment")]
    Comment,
    #[strum(to_string = "--limit")]
    Limit,
    #[strum(to_string = "--limit-burst")]
    LimitBurst,
    #[strum(to_string = "--to-destination")]
    ToDestination,
    #[strum(to_string = "--to-source")]
    ToSource,
    #[strum(to_string = "--to-ports")]
    ToPorts,
    #[strum(to_string = "--reject-with")]
    RejectWith,
    #[strum(to_string = "--log-level")]
    LogLevel,
    #[strum(to_string = "--log-prefix")]
    LogPrefix,
}

/// Builder for canonical rule text
#[derive(Debug, Clone)]
pub struct RuleText {
    out: String,
}

impl RuleText {
    /// Starts a rule appended to `chain` (`-A <chain>`).
    pub fn append(chain: &str) -> Self {
        Self {
            out: format!("{} {chain}", Flag::Append),
        }
    }

    /// Appends `<flag> <value>`. Values are written verbatim, quote them first
    /// when they may contain spaces.
    pub fn flag(&mut self, flag: Flag, value: &str) -> &mut Self {
        let _ = write!(self.out, " {flag} {value}");
        self
    }

    /// Appends a match extension (`-m <module>`).
    pub fn matches(&mut self, module: &str) -> &mut Self {
        self.flag(Flag::Match, module)
    }

    pub fn build(self) -> String {
        self.out
    }
}

/// Quotes a value the way `iptables-save` quotes comments.
///
/// `"` and `\` are backslash-escaped, which is what [`words`] reads back.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Joins words back into rule text.
///
/// Quoted words are re-quoted, and so is the value of `--comment` and
/// `--log-prefix` even when it was listed bare (`--comment ssh`).
pub fn render(words: &[Word]) -> String {
    let mut out = Vec::with_capacity(words.len());
    let mut quote_next = false;
    for word in words {
        if word.quoted || quote_next {
            out.push(quote(&word.text));
            quote_next = false;
        } else {
            quote_next = matches!(word.flag(), Some(Flag::Comment | Flag::LogPrefix));
            out.push(word.text.clone());
        }
    }
    out.join(" ")
}

/// Canonical form of a rule line, independent of how the listing quoted it.
pub fn canonical(line: &str) -> String {
    render(&words(line))
}

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    #[regex(r"[ \t\r\n\f]+")]
    Space,
    #[regex(r#""([^"\\]|\\.)*""#)]
    Quoted,
    #[regex(r#"[^ \t\r\n\f"]+"#)]
    Bare,
}

/// One word of rule text with quotes removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    pub quoted: bool,
}

impl Word {
    /// The flag this word names, if it is an unquoted known flag.
    pub fn flag(&self) -> Option<Flag> {
        if self.quoted {
            None
        } else {
            self.text.parse().ok()
        }
    }

    /// Returns `true` for an unquoted word shaped like an option (`-x`, `--xyz`).
    pub fn looks_like_option(&self) -> bool {
        !self.quoted && self.text.len() > 1 && self.text.starts_with('-')
    }
}

/// Splits rule text into words, honouring double quotes.
///
/// Never fails: an unterminated quote is kept as a bare word.
pub fn words(text: &str) -> Vec<Word> {
    let mut lexer = Lexeme::lexer(text);
    let mut out = Vec::new();

    while let Some(lexeme) = lexer.next() {
        let slice = lexer.slice();
        match lexeme {
            Ok(Lexeme::Space) => {}
            Ok(Lexeme::Quoted) => out.push(Word {
                text: unquote(slice),
                quoted: true,
            }),
            Ok(Lexeme::Bare) | Err(()) => out.push(Word {
                text: slice.to_string(),
                quoted: false,
            }),
        }
    }

    out
}

/// Splits rule text into process arguments (no shell involved).
pub fn split_args(text: &str) -> Vec<String> {
    words(text).into_iter().map(|w| w.text).collect()
}

/// Turns an append rule (`-A ...`) into the matching delete (`-D ...`).
pub fn to_delete_text(rule: &str) -> String {
    rule.replacen(&Flag::Append.to_string(), &Flag::Delete.to_string(), 1)
}

/// Chain named by a leading `-A <chain>`, if any.
pub fn appended_chain(rule: &str) -> Option<String> {
    let words = words(rule);
    match words.as_slice() {
        [first, chain, ..] if first.flag() == Some(Flag::Append) => Some(chain.text.clone()),
        _ => None,
    }
}

fn unquote(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
