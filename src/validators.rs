//! Input validation for declared rule values
//!
//! Every value that ends up in canonical rule text passes through here first.
//! Rule text is split into process arguments on whitespace and double quotes,
//! so values that would change the word structure are rejected up front.

/// Validates a rule name.
///
/// Names are the declaration identity and are embedded verbatim in the
/// `--comment` clause, so only ASCII alphanumerics, spaces, hyphens and
/// underscores are allowed.
///
/// # Examples
///
/// ```
/// use iptsync::validators::validate_rule_name;
///
/// assert!(validate_rule_name("100_Forward from virts").is_ok());
/// assert!(validate_rule_name("bad\"name").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` for an empty name or one with other characters.
pub fn validate_rule_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Rule name must not be empty".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
    {
        return Err(
            "Not a valid rule name. Use ASCII alphanumerics, spaces, hyphens or underscores"
                .to_string(),
        );
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates one port entry as written in rule text: `22` or `1024:2048`.
///
/// Service names are rejected because the listing command prints them as
/// numbers, which would never compare equal.
///
/// # Errors
///
/// Returns `Err` for anything but a valid port or ascending range.
pub fn validate_port_entry(entry: &str) -> Result<(), String> {
    let parse = |value: &str| {
        value
            .parse::<u16>()
            .map_err(|_| format!("Invalid port '{entry}' (use numbers, not service names)"))
    };

    match entry.split_once(':') {
        Some((start, end)) => validate_port_range(parse(start)?, parse(end)?).map(|_| ()),
        None => validate_port(parse(entry)?).map(|_| ()),
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// iptables additionally accepts a trailing `+` as a prefix wildcard (`br+`).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Interface name must not be empty".to_string());
    }

    let base = name.strip_suffix('+').unwrap_or(name);

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if base == "." || base == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !base
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates a free-form option value (`--to-destination`, `--log-level`, ...).
///
/// # Errors
///
/// Returns `Err` if the value contains whitespace or quotes, either of which
/// would split it into several arguments.
pub fn validate_token(field: &str, value: &str) -> Result<(), String> {
    if value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return Err(format!("'{field}' must not contain whitespace or quotes"));
    }
    Ok(())
}

/// Validates a log prefix before truncation.
///
/// # Errors
///
/// Returns `Err` if the prefix contains quotes or control characters.
pub fn validate_log_prefix(prefix: &str) -> Result<(), String> {
    if prefix.chars().any(|c| c.is_control() || c == '"' || c == '\\') {
        return Err(
            "'log_prefix' must not contain quotes, backslashes or control characters".to_string(),
        );
    }
    Ok(())
}
