//! Privilege elevation for firewall commands
//!
//! iptsync reads and modifies the kernel rule set through `iptables`,
//! `iptables-save` and the platform persistence command, all of which need
//! root. Every invocation is built here.
//!
//! # Elevation Strategy
//!
//! - **Root**: the command runs directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `IPTSYNC_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules in cron jobs or configuration management.
//!   Example: `IPTSYNC_ELEVATION_METHOD=sudo iptsync apply rules.json`
//!
//! - `IPTSYNC_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation; rule text is split
//!   into arguments by the flag tokenizer, never by a shell
//! - Binaries (pkexec/sudo/run0) are checked for availability
//!
//! # Example
//!
//! ```no_run
//! use iptsync::elevation::create_elevated_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command("iptables-save", &[])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::ffi::OsStr;
use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit or run iptsync as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `IPTSYNC_ELEVATION_METHOD`
    #[error("Invalid IPTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(elevator: &str, program: &OsStr, args: &[String]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &OsStr, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a command that runs `program` with root privileges.
///
/// Arguments are passed directly without shell interpretation.
///
/// # Errors
///
/// Returns `Err` if the forced or fallback elevation method is unavailable.
pub fn create_elevated_command(
    program: impl AsRef<OsStr>,
    args: &[String],
) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let program = program.as_ref();

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("IPTSYNC_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("IPTSYNC_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (no SUID), fall back to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}
