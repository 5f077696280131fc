use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use weave_cli::commands::{self, Issue};
use weave_cli::tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};
use weave_plugin_api::Severity;

#[derive(Parser, Debug)]
#[command(name = "weave", version, about = "Author, sign and check weave plugins")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact", global = true, env = "WEAVE_LOG_FORMAT")]
    log_format: TracingFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scaffold a new plugin directory
    Init {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Plugin id (lowercase letters, digits and hyphens)
        #[arg(long)]
        id: String,
        /// Display name; derived from the id when omitted
        #[arg(long)]
        name: Option<String>,
    },
    /// Validate a plugin's manifest and node descriptors
    Validate {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Sign every file of a plugin package
    Sign {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// File holding a base64-encoded 32-byte ed25519 secret key
        #[arg(long, value_name = "FILE")]
        key: PathBuf,
        /// Name recorded as the signer
        #[arg(long)]
        signer: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Verify a package against its signature.json
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Base64 ed25519 public key to trust; repeatable
        #[arg(long = "trusted-key", value_name = "B64")]
        trusted_keys: Vec<String>,
    },
    /// Check an upgrade between two versions
    CheckUpgrade { from: String, to: String },
    /// Validate and pack a plugin for the marketplace
    Publish {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_subscriber_with_config(TracingConfig::from_flags(cli.verbose, cli.log_format));

    let ok = match cli.command {
        Commands::Init { dir, id, name } => {
            let path = commands::init(&dir, &id, name.as_deref())?;
            println!("Created {}", path.display());
            true
        }
        Commands::Validate { dir } => {
            let report = commands::validate(&dir)?;
            print_issues("error", &report.errors);
            print_issues("warning", &report.warnings);
            if report.is_ok() {
                println!("{} is valid", dir.display());
            }
            report.is_ok()
        }
        Commands::Sign {
            dir,
            key,
            signer,
            email,
        } => {
            let signature = commands::sign(&dir, &key, &signer, email.as_deref())?;
            println!(
                "Signed {}@{} ({} files) as {} [{}]",
                signature.plugin_id,
                signature.plugin_version,
                signature.checksums.files.len(),
                signature.signer.name,
                signature.signer.key_id
            );
            true
        }
        Commands::Verify { dir, trusted_keys } => {
            let result = commands::verify(&dir, &trusted_keys)?;
            for error in &result.errors {
                println!("error[{}]: {}", error.code, error.message);
            }
            for warning in &result.warnings {
                println!("warning[{}]: {}", warning.code, warning.message);
            }
            if result.valid {
                let signer = result.signer.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown");
                let trust = if result.trusted { "trusted" } else { "untrusted" };
                println!("Signature valid ({}, signed by {})", trust, signer);
            }
            result.valid
        }
        Commands::CheckUpgrade { from, to } => {
            let result = commands::check_upgrade(&from, &to);
            for issue in &result.issues {
                let level = match issue.severity {
                    Severity::Error => "error",
                    Severity::Warning => "warning",
                };
                match &issue.details {
                    Some(details) => println!("{}: {} ({})", level, issue.message, details),
                    None => println!("{}: {}", level, issue.message),
                }
            }
            if result.compatible {
                println!("{} -> {} is compatible", from, to);
            }
            result.compatible
        }
        Commands::Publish { dir, dry_run } => {
            let result = commands::publish(&dir, dry_run).await?;
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            match (&result.error, &result.plugin_id, &result.version) {
                (Some(error), _, _) => println!("error: {}", error),
                (None, Some(id), Some(version)) => println!("Published {}@{} (dry run)", id, version),
                _ => println!("Published (dry run)"),
            }
            result.success
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_issues(level: &str, issues: &[Issue]) {
    for issue in issues {
        if issue.field.is_empty() {
            println!("{}: {}", level, issue.message);
        } else {
            println!("{}: {}: {}", level, issue.field, issue.message);
        }
    }
}
