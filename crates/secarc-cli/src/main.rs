//! secarc: password-protected file and directory containers
//!
//! Commands:
//!   encrypt -i <input> -o <output>     - pack a file or directory into a .secarc container
//!   decrypt -c <container> -o <dir>    - extract a container into a directory
//!   list    -c <container>             - show the entries of a container
//!   verify  -c <container>             - authenticate every byte of a container
//!   passwd  -c <container>             - change the password of a container

mod config;
mod password;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use secarc_core::{EntryKind, ProgressFn, SecarcError};

use crate::config::{load_config, LogFormat, SecarcConfig};
use crate::password::PasswordSource;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "secarc",
    version,
    about = "Password-based file and directory encryption",
    long_about = "secarc: pack files and directory trees into a single encrypted .secarc container, \
                  and extract, list, verify or re-key it later"
)]
struct Cli {
    /// Path to a secarc.toml defaults file
    #[arg(long, global = true, env = "SECARC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "SECARC_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Read passwords from stdin, one per line, without confirmation
    #[arg(long, global = true)]
    password_stdin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file or directory into a new container
    Encrypt {
        /// File or directory to encrypt
        #[arg(long, short = 'i')]
        input: PathBuf,
        /// Container to create
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Replace the output if it already exists
        #[arg(long)]
        force: bool,
        /// PBKDF2 iterations (default from config, else 300000)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        iterations: Option<u32>,
    },

    /// Decrypt a container into a directory
    Decrypt {
        #[arg(long, short = 'c')]
        container: PathBuf,
        /// Directory to extract into (created if missing)
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// List the entries of a container without extracting
    List {
        #[arg(long, short = 'c')]
        container: PathBuf,
    },

    /// Check the integrity of a container (exit status 1 on failure)
    Verify {
        #[arg(long, short = 'c')]
        container: PathBuf,
    },

    /// Change the password of a container in place
    Passwd {
        #[arg(long, short = 'c')]
        container: PathBuf,
        /// PBKDF2 iterations for the new password (default: keep current)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        iterations: Option<u32>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", describe(&e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let (config, found) = load_config(cli.config.as_deref())?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(config.log.format);
    init_logging(&level, &format);

    if let Some(path) = cli.config.as_deref() {
        if !found {
            warn!("config file not found: {}  (using defaults)", path.display());
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "secarc starting");

    let mut passwords = PasswordSource::new(cli.password_stdin);

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            force,
            iterations,
        } => cmd_encrypt(&config, &mut passwords, &input, &output, force, iterations),
        Commands::Decrypt { container, output } => cmd_decrypt(&mut passwords, &container, &output),
        Commands::List { container } => cmd_list(&mut passwords, &container),
        Commands::Verify { container } => cmd_verify(&mut passwords, &container),
        Commands::Passwd {
            container,
            iterations,
        } => cmd_passwd(&config, &mut passwords, &container, iterations),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── `secarc encrypt` ──────────────────────────────────────────────────────────

fn cmd_encrypt(
    config: &SecarcConfig,
    passwords: &mut PasswordSource,
    input: &Path,
    output: &Path,
    force: bool,
    iterations: Option<u32>,
) -> Result<ExitCode> {
    let overwrite = force || config.encrypt.overwrite;
    let iterations = iterations.unwrap_or(config.encrypt.iterations);

    // Fail before asking for a password when the engine would refuse anyway.
    if !input.exists() {
        return Err(SecarcError::SourceNotFound {
            path: input.to_path_buf(),
        }
        .into());
    }
    if !overwrite && output.exists() {
        return Err(SecarcError::DestinationExists {
            path: output.to_path_buf(),
        }
        .into());
    }

    let password = passwords.new_password("Password: ")?;

    let pb = make_progress_bar("encrypt");
    let progress = progress_callback(&pb);
    let summary = secarc_core::encrypt_path_with_progress(
        input,
        output,
        &password,
        iterations,
        overwrite,
        Some(&progress),
    )
    .with_context(|| format!("encrypting {}", input.display()))?;
    pb.finish_and_clear();

    println!("Encrypted {}", input.display());
    println!("  files:   {}", summary.files);
    println!("  entries: {}", summary.entries);
    println!("  bytes:   {}", fmt_bytes(summary.bytes));
    println!("  output:  {}", output.display());
    Ok(ExitCode::SUCCESS)
}

// ── `secarc decrypt` ──────────────────────────────────────────────────────────

fn cmd_decrypt(
    passwords: &mut PasswordSource,
    container: &Path,
    output: &Path,
) -> Result<ExitCode> {
    let password = passwords.existing("Password: ")?;

    let pb = make_progress_bar("decrypt");
    let progress = progress_callback(&pb);
    let summary =
        secarc_core::decrypt_container_with_progress(container, output, &password, Some(&progress))
            .with_context(|| format!("decrypting {}", container.display()))?;
    pb.finish_and_clear();

    println!("Decrypted {}", container.display());
    println!("  files:   {}", summary.files);
    println!("  entries: {}", summary.entries);
    println!("  bytes:   {}", fmt_bytes(summary.bytes));
    println!("  output:  {}", output.display());
    Ok(ExitCode::SUCCESS)
}

// ── `secarc list` ─────────────────────────────────────────────────────────────

fn cmd_list(passwords: &mut PasswordSource, container: &Path) -> Result<ExitCode> {
    let password = passwords.existing("Password: ")?;

    let entries = secarc_core::list_container(container, &password)
        .with_context(|| format!("listing {}", container.display()))?;

    for entry in &entries {
        match entry.kind {
            EntryKind::File => println!("{} ({} bytes)", entry.path, entry.size),
            EntryKind::Directory => println!("{}/", entry.path),
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ── `secarc verify` ───────────────────────────────────────────────────────────

fn cmd_verify(passwords: &mut PasswordSource, container: &Path) -> Result<ExitCode> {
    let password = passwords.existing("Password: ")?;

    let pb = make_progress_bar("verify");
    let progress = progress_callback(&pb);
    let ok = secarc_core::verify_container_with_progress(container, &password, Some(&progress));
    pb.finish_and_clear();

    if ok {
        println!("OK: {}", container.display());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "FAILED: {} (wrong password or corrupted data)",
            container.display()
        );
        Ok(ExitCode::FAILURE)
    }
}

// ── `secarc passwd` ───────────────────────────────────────────────────────────

fn cmd_passwd(
    config: &SecarcConfig,
    passwords: &mut PasswordSource,
    container: &Path,
    iterations: Option<u32>,
) -> Result<ExitCode> {
    let iterations = iterations.or(config.passwd.iterations_override());

    let current = passwords.existing("Current password: ")?;
    let new = passwords.new_password("New password: ")?;

    let pb = make_spinner("passwd");
    let progress: ProgressFn = {
        let pb = pb.clone();
        Box::new(move |_done, _total, msg| pb.set_message(msg.to_string()))
    };
    secarc_core::change_password_with_progress(
        container,
        &current,
        &new,
        iterations,
        Some(&progress),
    )
    .with_context(|| format!("changing password of {}", container.display()))?;
    pb.finish_and_clear();

    println!("Password changed: {}", container.display());
    Ok(ExitCode::SUCCESS)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// User-facing message for a failed command.
///
/// Engine errors get a fixed phrasing per kind; a wrong password and damaged
/// data are never told apart.
fn describe(err: &anyhow::Error) -> String {
    let Some(engine) = err.downcast_ref::<SecarcError>() else {
        return format!("{err:#}");
    };

    let message = match engine {
        SecarcError::SourceNotFound { path } => format!("input not found: {}", path.display()),
        SecarcError::DestinationExists { path } => {
            format!("{} already exists (use --force to replace it)", path.display())
        }
        SecarcError::InvalidContainerFormat(detail) => {
            format!("not a valid secarc container: {detail}")
        }
        SecarcError::WrongPasswordOrCorrupted { entry: None } => {
            "wrong password or corrupted data".to_string()
        }
        SecarcError::WrongPasswordOrCorrupted { entry: Some(entry) } => format!(
            "wrong password or corrupted data in {entry}; extracted output is incomplete"
        ),
        SecarcError::Io { .. } => engine.to_string(),
        SecarcError::Unexpected(e) => format!("internal error: {e:#}"),
    };

    // Keep the command context ("decrypting x.secarc") when there is one.
    let outer = err.to_string();
    if outer != engine.to_string() {
        format!("{outer}: {message}")
    } else {
        message
    }
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {wide_msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_describe_wrong_password_with_context() {
        let err = anyhow::Error::from(SecarcError::WrongPasswordOrCorrupted { entry: None })
            .context("decrypting c.secarc");
        assert_eq!(
            describe(&err),
            "decrypting c.secarc: wrong password or corrupted data"
        );
    }

    #[test]
    fn test_describe_names_entry() {
        let err = anyhow::Error::from(SecarcError::WrongPasswordOrCorrupted {
            entry: Some("sub/b.txt".into()),
        });
        let msg = describe(&err);
        assert!(msg.contains("sub/b.txt"));
        assert!(msg.starts_with("wrong password or corrupted data"));
    }

    #[test]
    fn test_describe_other_errors() {
        let err = anyhow::anyhow!("passwords do not match");
        assert_eq!(describe(&err), "passwords do not match");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "secarc",
            "encrypt",
            "-i",
            "in",
            "-o",
            "out.secarc",
            "--iterations",
            "20000",
            "--password-stdin",
        ])
        .unwrap();
        assert!(cli.password_stdin);
        match cli.command {
            Commands::Encrypt { iterations, force, .. } => {
                assert_eq!(iterations, Some(20_000));
                assert!(!force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_zero_iterations() {
        let result = Cli::try_parse_from([
            "secarc", "passwd", "-c", "x.secarc", "--iterations", "0",
        ]);
        assert!(result.is_err());
    }
}
