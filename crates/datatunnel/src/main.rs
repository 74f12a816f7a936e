//! datatunnel - run DATATUNNEL statements from the command line
//!
//! # Usage
//!
//! ```bash
//! # Run a statement
//! datatunnel run -e 'DATATUNNEL SOURCE("datagen") OPTIONS(rowCount=10) SINK("log") OPTIONS()'
//!
//! # Run a statement stored in a file, with executor settings from YAML
//! datatunnel -c datatunnel.yaml run -f job.sql
//!
//! # Check a statement without running it
//! datatunnel parse -f job.sql
//!
//! # List connector kinds and show the options of one
//! datatunnel connectors
//! datatunnel describe redshift --role sink
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use datatunnel::connectors::create_registry;
use datatunnel::options::OptionSchema;
use datatunnel::{ConnectorRegistry, ConnectorRole, TunnelConfig, TunnelExecutor};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "datatunnel")]
#[command(version, about = "Move data between connectors with a single statement")]
struct Cli {
    /// Path to configuration file (executor, retry and option settings)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and execute a statement
    Run {
        /// Statement text
        #[arg(short = 'e', long = "execute")]
        statement: Option<String>,
        /// Read the statement from a file
        #[arg(short, long, conflicts_with = "statement")]
        file: Option<PathBuf>,
    },
    /// Parse a statement and print its canonical form and plan
    Parse {
        /// Statement text
        #[arg(short = 'e', long = "execute")]
        statement: Option<String>,
        /// Read the statement from a file
        #[arg(short, long, conflicts_with = "statement")]
        file: Option<PathBuf>,
    },
    /// List available connector kinds
    Connectors,
    /// Show the options a connector kind accepts
    Describe {
        /// Connector kind (e.g. memory, file, redshift)
        kind: String,
        /// Which side to describe when a kind is both a source and a sink
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Source,
    Sink,
}

impl From<RoleArg> for ConnectorRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Source => ConnectorRole::Source,
            RoleArg::Sink => ConnectorRole::Sink,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TunnelConfig::default(),
    };
    let registry =
        Arc::new(create_registry().with_unknown_option_policy(config.options.unknown));

    match cli.command {
        Commands::Run { statement, file } => {
            let text = read_statement(statement, file.as_deref())?;
            run_statement(config, registry, &text).await
        }
        Commands::Parse { statement, file } => {
            let text = read_statement(statement, file.as_deref())?;
            parse_statement(&registry, &text)
        }
        Commands::Connectors => list_connectors(&registry),
        Commands::Describe { kind, role, format } => {
            describe_connector(&registry, &kind, role.map(Into::into), &format)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn read_statement(statement: Option<String>, file: Option<&Path>) -> Result<String> {
    match (statement, file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read statement from {}", path.display())),
        (None, None) => anyhow::bail!("Provide a statement with -e or a file with -f"),
    }
}

async fn run_statement(
    config: TunnelConfig,
    registry: Arc<ConnectorRegistry>,
    text: &str,
) -> Result<()> {
    let executor = TunnelExecutor::new(registry).with_config(config.executor_config());
    let cancel = CancellationToken::new();

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling job");
            signal_token.cancel();
        }
    });

    let report = executor
        .run_statement_with_cancel(text, cancel)
        .await
        .context("Tunnel job failed")?;
    info!(job_id = %report.job_id, rows = report.rows_written, "Tunnel job finished");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn parse_statement(registry: &ConnectorRegistry, text: &str) -> Result<()> {
    let plan = datatunnel::parse(text).context("Invalid statement")?;
    let redacted = registry.redact_plan(&plan);

    for spec in [plan.source(), plan.sink()] {
        let known = match spec.role() {
            ConnectorRole::Source => registry.contains_source(spec.kind()),
            ConnectorRole::Sink => registry.contains_sink(spec.kind()),
        };
        if !known {
            warn!("Unknown {} connector kind '{}'", spec.role(), spec.kind());
        }
    }

    println!("{}", redacted);
    println!("{}", serde_json::to_string_pretty(&redacted)?);
    Ok(())
}

fn list_connectors(registry: &ConnectorRegistry) -> Result<()> {
    println!("Sources:");
    for kind in registry.list_sources() {
        println!("  {}", kind);
    }
    println!("\nSinks:");
    for kind in registry.list_sinks() {
        println!("  {}", kind);
    }
    Ok(())
}

fn describe_connector(
    registry: &ConnectorRegistry,
    kind: &str,
    role: Option<ConnectorRole>,
    format: &str,
) -> Result<()> {
    let roles = match role {
        Some(role) => vec![role],
        None => vec![ConnectorRole::Source, ConnectorRole::Sink],
    };
    let schemas: Vec<(ConnectorRole, &OptionSchema)> = roles
        .into_iter()
        .filter_map(|role| registry.schema(role, kind).map(|schema| (role, schema)))
        .collect();

    if schemas.is_empty() {
        anyhow::bail!(
            "Unknown connector kind: '{}'\nUse 'datatunnel connectors' to list available kinds",
            kind
        );
    }

    match format {
        "json" => {
            let described: Vec<_> = schemas
                .iter()
                .map(|(role, schema)| schema_json(*role, schema))
                .collect();
            println!("{}", serde_json::to_string_pretty(&described)?);
        }
        _ => {
            for (role, schema) in schemas {
                print_schema_table(role, schema);
            }
        }
    }
    Ok(())
}

fn schema_json(role: ConnectorRole, schema: &OptionSchema) -> serde_json::Value {
    let options: Vec<_> = schema
        .options()
        .iter()
        .map(|spec| {
            json!({
                "key": spec.key,
                "type": spec.ty.to_string(),
                "required": spec.required,
                "default": spec.default.as_ref().map(|v| v.to_json()),
                "sensitive": spec.sensitive,
                "aliases": spec.aliases,
                "description": spec.description,
            })
        })
        .collect();
    json!({ "kind": schema.kind(), "role": role, "options": options })
}

fn print_schema_table(role: ConnectorRole, schema: &OptionSchema) {
    println!("{} {}", role.keyword(), schema.kind());
    let width = schema
        .options()
        .iter()
        .map(|spec| spec.key.len())
        .max()
        .unwrap_or(0);
    for spec in schema.options() {
        let mut notes = Vec::new();
        if spec.required {
            notes.push("required".to_string());
        }
        if let Some(default) = &spec.default {
            notes.push(format!("default {}", default));
        }
        if spec.sensitive {
            notes.push("sensitive".to_string());
        }
        if !spec.aliases.is_empty() {
            notes.push(format!("alias {}", spec.aliases.join(", ")));
        }
        println!(
            "  {:width$}  {:<16}  {}{}",
            spec.key,
            spec.ty.to_string(),
            spec.description,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join("; "))
            },
            width = width
        );
    }
    println!();
}
