//! Backend seam for the iptables command-line tools
//!
//! The convergence engine talks to the kernel only through [`IptablesOps`].
//! Production code uses [`IptablesCommand`], which runs the real binaries
//! through [`crate::elevation`]; tests use a stateful fake.

use super::error::{Error, Result};
use super::firewall::Table;
use super::flags::{split_args, to_delete_text};
use crate::elevation;
use serde::Serialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Operations on the live rule set
#[allow(async_fn_in_trait)]
pub trait IptablesOps {
    /// Output of `iptables --version`.
    async fn version(&self) -> Result<String>;

    /// Full listing as printed by `iptables-save`.
    async fn save(&self) -> Result<String>;

    /// Appends a rule given as `-A <chain> ...` text.
    async fn append(&self, table: Table, rule: &str) -> Result<()>;

    /// Deletes the first rule matching the `-A <chain> ...` text.
    async fn delete(&self, table: Table, rule: &str) -> Result<()>;

    /// Deletes the rule at a 1-based position of a chain.
    async fn delete_at(&self, table: Table, chain: &str, position: usize) -> Result<()>;

    /// Runs the persistence command.
    async fn persist(&self, command: &PersistCommand) -> Result<()>;
}

impl<T: IptablesOps> IptablesOps for &T {
    async fn version(&self) -> Result<String> {
        (**self).version().await
    }

    async fn save(&self) -> Result<String> {
        (**self).save().await
    }

    async fn append(&self, table: Table, rule: &str) -> Result<()> {
        (**self).append(table, rule).await
    }

    async fn delete(&self, table: Table, rule: &str) -> Result<()> {
        (**self).delete(table, rule).await
    }

    async fn delete_at(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        (**self).delete_at(table, chain, position).await
    }

    async fn persist(&self, command: &PersistCommand) -> Result<()> {
        (**self).persist(command).await
    }
}

/// Command that saves the live rule set across reboots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PersistCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// Builds a command from a configured argv (`["service", "iptables", "save"]`).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Resolves the persistence command of the running distribution.
    pub fn detect() -> Option<Self> {
        match std::fs::read_to_string("/etc/os-release") {
            Ok(content) => Self::from_os_release(&content),
            Err(e) => {
                debug!("Cannot read /etc/os-release: {e}");
                None
            }
        }
    }

    /// Resolves the persistence command from `os-release` content.
    ///
    /// `ID` is tried first, then every `ID_LIKE` entry.
    pub fn from_os_release(content: &str) -> Option<Self> {
        let field = |key: &str| {
            content.lines().find_map(|line| {
                let value = line.strip_prefix(key)?.strip_prefix('=')?;
                Some(value.trim().trim_matches('"').trim_matches('\'').to_string())
            })
        };

        let mut ids: Vec<String> = field("ID").into_iter().collect();
        if let Some(like) = field("ID_LIKE") {
            ids.extend(like.split_whitespace().map(ToString::to_string));
        }

        ids.iter().find_map(|id| match id.as_str() {
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "amzn" => {
                Some(Self::new("service", &["iptables", "save"]))
            }
            "debian" | "ubuntu" => Some(Self::new("netfilter-persistent", &["save"])),
            "arch" => Some(Self::new(
                "iptables-save",
                &["-f", "/etc/iptables/iptables.rules"],
            )),
            "gentoo" => Some(Self::new("/etc/init.d/iptables", &["save"])),
            _ => None,
        })
    }
}

impl fmt::Display for PersistCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Arguments of an add command
pub fn append_args(table: Table, rule: &str) -> Vec<String> {
    let mut args = vec!["-t".to_string(), table.to_string()];
    args.extend(split_args(rule));
    args
}

/// Arguments of a delete-by-text command
pub fn delete_args(table: Table, rule: &str) -> Vec<String> {
    append_args(table, &to_delete_text(rule))
}

/// Arguments of a delete-by-position command
pub fn delete_at_args(table: Table, chain: &str, position: usize) -> Vec<String> {
    vec![
        "-t".to_string(),
        table.to_string(),
        "-D".to_string(),
        chain.to_string(),
        position.to_string(),
    ]
}

/// Process backend running `iptables` and `iptables-save`
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    iptables: PathBuf,
    iptables_save: PathBuf,
}

impl Default for IptablesCommand {
    fn default() -> Self {
        Self {
            iptables: PathBuf::from("iptables"),
            iptables_save: PathBuf::from("iptables-save"),
        }
    }
}

impl IptablesCommand {
    /// Binaries resolved through `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binaries taken from one directory (`/usr/sbin`).
    pub fn with_dir(dir: &Path) -> Self {
        Self::with_binaries(dir.join("iptables"), dir.join("iptables-save"))
    }

    pub fn with_binaries(iptables: impl Into<PathBuf>, iptables_save: impl Into<PathBuf>) -> Self {
        Self {
            iptables: iptables.into(),
            iptables_save: iptables_save.into(),
        }
    }

    pub fn iptables(&self) -> &Path {
        &self.iptables
    }

    async fn run(program: &OsStr, args: &[String]) -> Result<String> {
        let command = format!("{} {}", program.to_string_lossy(), args.join(" "))
            .trim_end()
            .to_string();
        debug!("Running: {command}");

        let output = elevation::create_elevated_command(program, args)?
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {command}: {e}");
                Error::Execution {
                    command: command.clone(),
                    stderr: e.to_string(),
                    exit_code: None,
                }
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("Command failed: {command}: {stderr}");
            Err(Error::Execution {
                command,
                stderr,
                exit_code: output.status.code(),
            })
        }
    }
}

impl IptablesOps for IptablesCommand {
    async fn version(&self) -> Result<String> {
        let out = Self::run(self.iptables.as_os_str(), &["--version".to_string()]).await?;
        Ok(out.trim().to_string())
    }

    async fn save(&self) -> Result<String> {
        Self::run(self.iptables_save.as_os_str(), &[]).await
    }

    async fn append(&self, table: Table, rule: &str) -> Result<()> {
        Self::run(self.iptables.as_os_str(), &append_args(table, rule)).await?;
        Ok(())
    }

    async fn delete(&self, table: Table, rule: &str) -> Result<()> {
        Self::run(self.iptables.as_os_str(), &delete_args(table, rule)).await?;
        Ok(())
    }

    async fn delete_at(&self, table: Table, chain: &str, position: usize) -> Result<()> {
        let args = delete_at_args(table, chain, position);
        Self::run(self.iptables.as_os_str(), &args).await?;
        Ok(())
    }

    async fn persist(&self, command: &PersistCommand) -> Result<()> {
        Self::run(OsStr::new(&command.program), &command.args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_id() {
        let debian = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(
            PersistCommand::from_os_release(debian).unwrap().to_string(),
            "netfilter-persistent save"
        );

        let arch = "NAME=\"Arch Linux\"\nID=arch\n";
        assert_eq!(
            PersistCommand::from_os_release(arch).unwrap().to_string(),
            "iptables-save -f /etc/iptables/iptables.rules"
        );

        let gentoo = "ID=gentoo\n";
        assert_eq!(
            PersistCommand::from_os_release(gentoo).unwrap().program,
            "/etc/init.d/iptables"
        );
    }

    #[test]
    fn test_detect_from_id_like() {
        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(
            PersistCommand::from_os_release(rocky).unwrap().to_string(),
            "service iptables save"
        );

        let mint = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(
            PersistCommand::from_os_release(mint).unwrap().program,
            "netfilter-persistent"
        );
    }

    #[test]
    fn test_detect_unknown_platform() {
        assert!(PersistCommand::from_os_release("ID=alpine\n").is_none());
        assert!(PersistCommand::from_os_release("").is_none());
        // VERSION_ID must not be mistaken for ID
        assert!(PersistCommand::from_os_release("VERSION_ID=debian\n").is_none());
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["service".to_string(), "iptables".to_string(), "save".to_string()];
        let cmd = PersistCommand::from_argv(&argv).unwrap();
        assert_eq!(cmd.program, "service");
        assert_eq!(cmd.args, vec!["iptables", "save"]);
        assert!(PersistCommand::from_argv(&[]).is_none());
    }

    #[test]
    fn test_argument_vectors() {
        assert_eq!(
            append_args(
                Table::Filter,
                "-A INPUT -m comment --comment \"Allow DNS\" -j ACCEPT"
            ),
            vec!["-t", "filter", "-A", "INPUT", "-m", "comment", "--comment", "Allow DNS", "-j", "ACCEPT"]
        );
        assert_eq!(
            delete_args(Table::Nat, "-A POSTROUTING -j MASQUERADE"),
            vec!["-t", "nat", "-D", "POSTROUTING", "-j", "MASQUERADE"]
        );
        assert_eq!(
            delete_at_args(Table::Raw, "PREROUTING", 1),
            vec!["-t", "raw", "-D", "PREROUTING", "1"]
        );
    }

    #[test]
    fn test_with_dir() {
        let backend = IptablesCommand::with_dir(Path::new("/usr/sbin"));
        assert_eq!(backend.iptables(), Path::new("/usr/sbin/iptables"));
    }
}
