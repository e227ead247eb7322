//! iptsync - declarative iptables convergence
//!
//! # Usage
//!
//! ```bash
//! iptsync apply rules.json             # Converge the firewall and persist it
//! iptsync apply rules.json --dry-run   # Print the commands a run would issue
//! iptsync check rules.json             # Compile and print the ordered rule set
//! iptsync diff rules.json              # Unified diff of live vs declared rules
//! iptsync show                         # Live rules as JSON
//! iptsync version                      # Build information
//! ```
//!
//! Rules in the pre and post files (default `/etc/iptsync/pre.iptables` and
//! `/etc/iptsync/post.iptables`) are placed before and after the declared
//! rules of each table.

use clap::{Parser, Subcommand};
use iptsync::audit;
use iptsync::config::{AppConfig, load_config};
use iptsync::core::address::AddressMode;
use iptsync::core::converge::{ConvergeOptions, Session};
use iptsync::core::error::IptablesErrorPattern;
use iptsync::core::firewall::{RuleOrigin, RuleSpec, Table};
use iptsync::core::iptables::{IptablesCommand, IptablesOps};
use iptsync::core::registry::{RuleSet, load_rule_file};
use iptsync::core::{listing, manifest};
use iptsync::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tokio::sync::OnceCell;
use tracing::{Level, debug};
use uuid::Uuid;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "iptsync")]
#[command(about = "Declarative iptables rule convergence", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/iptsync/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Rules placed before the declared rules of each table
    #[arg(long, global = true, value_name = "PATH")]
    pre: Option<PathBuf>,

    /// Rules placed after the declared rules of each table
    #[arg(long, global = true, value_name = "PATH")]
    post: Option<PathBuf>,

    /// Address rendering (cidr or legacy); probed from `iptables --version` if unset
    #[arg(long, global = true, value_name = "MODE")]
    address_mode: Option<AddressMode>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the live firewall to a rule manifest
    Apply {
        /// JSON array of rule specs
        manifest: PathBuf,
        /// Report the commands without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Compile a manifest and print the ordered rule set
    Check {
        manifest: PathBuf,
    },
    /// Show a unified diff of live vs declared rules
    Diff {
        manifest: PathBuf,
    },
    /// Print the live rules as JSON
    Show,
    /// Print build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if matches!(cli.command, Commands::Version) {
        print_version();
        return ExitCode::SUCCESS;
    }

    if let Err(e) = iptsync::utils::ensure_dirs() {
        debug!("Cannot create iptsync directories: {e}");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Error::Execution { stderr, .. } = e {
        let translation = IptablesErrorPattern::match_error(stderr);
        eprintln!("{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

fn print_version() {
    println!("iptsync {}", build::PKG_VERSION);
    println!(
        "commit: {}{}",
        build::SHORT_COMMIT,
        if build::GIT_CLEAN { "" } else { " (dirty)" }
    );
    println!("built:  {}", build::BUILD_TIME);
    println!("rustc:  {}", build::RUST_VERSION);
}

/// Settings shared by every subcommand
struct Context {
    config: AppConfig,
    backend: IptablesCommand,
    pre: PathBuf,
    post: PathBuf,
    address_mode: Option<AddressMode>,
    /// Probed at most once per process
    probed_mode: OnceCell<AddressMode>,
}

impl Context {
    /// The forced address mode, else the one the installed iptables supports.
    async fn address_mode(&self) -> Result<AddressMode> {
        if let Some(mode) = self.address_mode {
            return Ok(mode);
        }
        self.probed_mode
            .get_or_try_init(|| async {
                let version = self.backend.version().await?;
                let mode = AddressMode::from_version_output(&version);
                debug!("{version}: using {mode} addresses");
                Ok::<_, Error>(mode)
            })
            .await
            .copied()
    }

    async fn options(&self, dry_run: bool) -> Result<ConvergeOptions> {
        Ok(ConvergeOptions {
            dry_run,
            persist: self.config.persist_command(),
            pre_rules: load_rule_file(&self.pre, RuleOrigin::PreFile).await?,
            post_rules: load_rule_file(&self.post, RuleOrigin::PostFile).await?,
        })
    }

    /// Compiles a manifest without touching the firewall.
    async fn session(
        &self,
        manifest: &Path,
        dry_run: bool,
    ) -> Result<(Session<&IptablesCommand>, Vec<RuleSpec>)> {
        let specs = manifest::load(manifest).await?;
        let mode = self.address_mode().await?;
        let mut session = Session::new(&self.backend, mode, self.options(dry_run).await?);
        session.declare_all(&specs);
        Ok((session, specs))
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref()).await;
    let ctx = Context {
        backend: config.backend(),
        pre: cli.pre.unwrap_or_else(|| config.pre_file.clone()),
        post: cli.post.unwrap_or_else(|| config.post_file.clone()),
        address_mode: cli.address_mode,
        probed_mode: OnceCell::new(),
        config,
    };

    match cli.command {
        Commands::Apply { manifest, dry_run } => apply(&ctx, &manifest, dry_run).await,
        Commands::Check { manifest } => check(&ctx, &manifest).await,
        Commands::Diff { manifest } => diff(&ctx, &manifest).await,
        Commands::Show => show(&ctx).await,
        Commands::Version => {
            print_version();
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn apply(ctx: &Context, manifest: &Path, dry_run: bool) -> Result<ExitCode> {
    let (session, specs) = ctx.session(manifest, dry_run).await?;
    let checksum = session.preview().checksum();
    let run_id = Uuid::new_v4();

    let outcome = session.converge().await;
    if ctx.config.audit {
        audit::log_converge(run_id, &checksum, &outcome).await;
    }
    let report = outcome?;

    if report.dry_run {
        println!("Dry run, {} command(s) would be issued:", report.commands.len());
        for command in &report.commands {
            println!("  {command}");
        }
    } else if report.changed {
        println!(
            "✓ Rules converged: {} added, {} flushed, {} pruned",
            report.added, report.deleted, report.pruned
        );
    } else if report.pruned > 0 {
        println!("✓ Pruned {} undeclared rule(s)", report.pruned);
    } else {
        println!("✓ Rules unchanged");
    }

    if report.persist_unavailable {
        println!("! Rules were not saved: no persistence command known for this platform");
    }
    if !report.rejected.is_empty() {
        println!("! {} of {} spec(s) rejected:", report.rejected.len(), specs.len());
        for rejection in &report.rejected {
            println!("  {}: {}", rejection.name, rejection.reason);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn check(ctx: &Context, manifest: &Path) -> Result<ExitCode> {
    let (session, _) = ctx.session(manifest, true).await?;
    let rules = session.preview();

    for (table, compiled) in rules.tables() {
        println!("*{table}");
        for rule in compiled {
            println!("{}", rule.numbered_key());
        }
    }
    println!("checksum: {}", rules.checksum());

    if session.rejected().is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for rejection in session.rejected() {
        eprintln!("rejected {}: {}", rejection.name, rejection.reason);
    }
    Ok(ExitCode::FAILURE)
}

async fn diff(ctx: &Context, manifest: &Path) -> Result<ExitCode> {
    let (session, _) = ctx.session(manifest, true).await?;
    let declared = session.preview();
    let live = listing::parse(&ctx.backend.save().await?, false, session.mode());

    let mut identical = true;
    for table in Table::iter() {
        let live_text: String = live
            .table(table)
            .map(|state| state.iter().map(|e| format!("{}\n", e.key)).collect())
            .unwrap_or_default();
        let declared_text = declared_lines(&declared, table);
        if live_text == declared_text {
            continue;
        }

        identical = false;
        let diff = similar::TextDiff::from_lines(&live_text, &declared_text);
        print!(
            "{}",
            diff.unified_diff()
                .header(&format!("live/{table}"), &format!("declared/{table}"))
        );
    }

    if identical {
        println!("No differences");
    }
    Ok(ExitCode::SUCCESS)
}

fn declared_lines(rules: &RuleSet, table: Table) -> String {
    rules
        .rules(table)
        .iter()
        .map(|rule| format!("{}\n", rule.text))
        .collect()
}

async fn show(ctx: &Context) -> Result<ExitCode> {
    let mode = ctx.address_mode().await?;
    let live = listing::parse(&ctx.backend.save().await?, true, mode);
    println!("{}", serde_json::to_string_pretty(&live)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "iptsync",
            "apply",
            "rules.json",
            "--dry-run",
            "--address-mode",
            "legacy",
            "--pre",
            "/tmp/pre",
        ])
        .unwrap();

        assert_eq!(cli.address_mode, Some(AddressMode::Legacy));
        assert_eq!(cli.pre, Some(PathBuf::from("/tmp/pre")));
        assert!(matches!(cli.command, Commands::Apply { dry_run: true, .. }));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["iptsync", "-v", "-q", "show"]).is_err());
    }
}
