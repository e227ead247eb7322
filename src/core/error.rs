use thiserror::Error;

/// Core error types for iptsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A declared rule cannot be compiled; the rule is skipped, the run goes on
    #[error("Invalid rule '{rule}': {message}")]
    Validation { rule: String, message: String },

    /// Malformed address, netmask or listing line; fatal for that value only
    #[error("Format error: {0}")]
    Format(String),

    /// An external iptables/iptables-save/persistence command failed
    #[error("Command failed: {command}: {stderr}")]
    Execution {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Rule manifest could not be loaded
    #[error(transparent)]
    Manifest(#[from] crate::core::manifest::ManifestError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run iptsync as root or configure sudo/run0 for iptables")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall manager may be running (firewalld, ufw, docker)")
                .with_suggestion("Wait a moment and re-run iptsync");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or set \"iptables_dir\" in the iptsync config");
        }

        // Delete of a rule that is already gone
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("The rule to delete no longer exists")
                .with_suggestion("The firewall changed during the run; re-run iptsync to converge");
        }

        if lower.contains("index of deletion too big") {
            return ErrorTranslation::new("Rule position out of range while flushing a chain")
                .with_suggestion("The firewall changed during the run; re-run iptsync to converge");
        }

        // Kernel module or extension missing
        if lower.contains("no chain/target/match by that name")
            || lower.contains("couldn't load target")
            || lower.contains("couldn't load match")
        {
            return ErrorTranslation::new("Unknown chain, target or match extension")
                .with_suggestion("Check that the required kernel modules are loaded (lsmod | grep xt_)")
                .with_suggestion("NAT targets need the 'nat' table (DNAT, SNAT, MASQUERADE)");
        }

        // Table not available
        if lower.contains("table does not exist") || lower.contains("can't initialize iptables table") {
            return ErrorTranslation::new("Firewall table is not available")
                .with_suggestion("Load the table module: sudo modprobe iptable_nat (or iptable_mangle, iptable_raw)");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_bad_rule_on_delete() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        assert!(translation.user_message.contains("no longer exists"));
        assert!(translation.suggestions.iter().any(|s| s.contains("re-run")));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("lock"));
    }

    #[test]
    fn test_unknown_target() {
        let translation =
            IptablesErrorPattern::match_error("iptables: No chain/target/match by that name.");
        assert!(translation.user_message.contains("Unknown chain"));
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = IptablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_validation_display() {
        let err = Error::validation("ssh", "multiport module only accepts <= 15 ports");
        assert_eq!(
            err.to_string(),
            "Invalid rule 'ssh': multiport module only accepts <= 15 ports"
        );
    }
}
