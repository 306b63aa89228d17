//! pgdbs: query collections from the command line
//!
//! # Usage
//!
//! ```bash
//! # Show the SQL a filter compiles to
//! pgdbs --dry-run find users --filter '{"age": {"op": "gt", "val": 30}}'
//!
//! # Run it
//! pgdbs --config ./config.toml find users --filter '{"id": 1}' --format json
//! ```

use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use pgdbs::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgdbs")]
#[command(version)]
#[command(about = "Collection-style queries against PostgreSQL", long_about = None)]
#[command(after_help = "EXAMPLES:
    pgdbs --dry-run find users --filter '{\"id\": {\"op\": \"in\", \"val\": [1, 2]}}'
    pgdbs find events --order created:DESC --limit 10
    pgdbs remove sessions --filter '{\"expired\": true}'
    pgdbs types --wide")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "PGDBS_CONFIG")]
    config: Option<PathBuf>,

    /// Don't connect, just show the generated SQL
    #[arg(short, long)]
    dry_run: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Select rows matching a filter
    Find {
        table: String,
        /// Filter as JSON
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
        /// Sort terms as `key:ASC` or `key:DESC`
        #[arg(long, value_delimiter = ',')]
        order: Vec<String>,
    },
    /// Delete rows matching a filter
    Remove {
        table: String,
        /// Filter as JSON
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Allow an empty filter, deleting every row
        #[arg(long)]
        all: bool,
    },
    /// Show how field types map to column types
    Types {
        /// Map ids to bigint
        #[arg(long)]
        wide: bool,
    },
}

/// Prints statements instead of running them.
struct DryRun;

#[async_trait]
impl Gateway for DryRun {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendError> {
        println!("{}", "Generated SQL:".green().bold());
        println!("{}", sql.white());
        if !params.is_empty() {
            println!();
            println!("{}", "Bindings:".cyan());
            for (i, p) in params.iter().enumerate() {
                println!("  ${} = {}", i + 1, p.to_string().yellow());
            }
        }
        Ok(QueryResult::default())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if cli.verbose {
                "pgdbs=debug"
            } else {
                "pgdbs=warn"
            })),
        )
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    if let Commands::Types { wide } = &cli.command {
        show_types(*wide);
        return Ok(());
    }

    let dbs = open(cli).await?;

    match &cli.command {
        Commands::Find { table, filter, limit, offset, order } => {
            let filter = parse_filter(filter)?;
            let mut opts = FindOptions { limit: *limit, offset: *offset, order: Vec::new() };
            for term in order {
                opts = opts.order_by(parse_order(term)?);
            }
            let rows = dbs.collection(table.as_str()).find_with(&filter, opts)?.to_array().await?;
            if !cli.dry_run {
                format_output(&rows, &cli.format);
            }
        }
        Commands::Remove { table, filter, all } => {
            let filter = parse_filter(filter)?;
            if filter.is_empty() && !all {
                anyhow::bail!("refusing to delete every row of '{}' without --all", table);
            }
            let affected = dbs.collection(table.as_str()).remove(&filter).await?;
            if !cli.dry_run {
                println!("{} {} rows affected", "✓".green(), affected);
            }
        }
        Commands::Types { .. } => unreachable!(), // Handled above
    }

    dbs.shutdown().await;
    Ok(())
}

async fn open(cli: &Cli) -> anyhow::Result<Dbs> {
    let path = cli.config.clone().or_else(Config::default_path);
    let config = match &path {
        Some(p) if p.exists() => Some(Config::load(p)?),
        _ => None,
    };

    if cli.dry_run {
        let flags = config
            .as_ref()
            .and_then(|c| c.postgresql().ok())
            .map(Flags::from)
            .unwrap_or_default();
        return Ok(Dbs::new(Arc::new(DryRun), Arc::new(TracingDiagnostics::default()), flags));
    }

    let Some(config) = config else {
        anyhow::bail!("no configuration found. Use --config or set PGDBS_CONFIG");
    };
    let pg = config.postgresql()?;
    if cli.verbose {
        println!("{} {}:{}/{}", "Connecting to:".dimmed(), pg.host, pg.port, pg.db);
    }
    let gateway = PgGateway::connect(pg).await?.on_error(|e| {
        eprintln!("{} {}", "Connection error:".red().bold(), e);
    });
    Ok(Dbs::from_config(Arc::new(gateway), pg))
}

fn parse_filter(text: &str) -> anyhow::Result<Filter> {
    let value: Value = serde_json::from_str(text)?;
    Ok(Filter::from_json(value)?)
}

fn parse_order(term: &str) -> anyhow::Result<Order> {
    let (key, dir) = term.rsplit_once(':').unwrap_or((term, "ASC"));
    match dir.to_ascii_uppercase().as_str() {
        "ASC" => Ok(Order::asc(key)),
        "DESC" => Ok(Order::desc(key)),
        other => anyhow::bail!("unknown sort direction '{}'", other),
    }
}

fn format_output(results: &[Row], format: &OutputFormat) {
    if results.is_empty() {
        println!("{}", "(no results)".dimmed());
        return;
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results).unwrap_or_default());
        }
        OutputFormat::Table => {
            let columns: Vec<&String> = results[0].keys().collect();

            let widths: Vec<usize> = columns
                .iter()
                .map(|c| {
                    results
                        .iter()
                        .map(|row| row.get(*c).map(val_to_string).unwrap_or_default().len())
                        .max()
                        .unwrap_or(0)
                        .max(c.len())
                })
                .collect();

            let header: Vec<String> = columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:width$}", c, width = w))
                .collect();
            println!("{}", header.join(" │ ").white().bold());

            let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for row in results {
                let cells: Vec<String> = columns
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| {
                        let val = row.get(*c).map(val_to_string).unwrap_or_default();
                        format!("{:width$}", val, width = w)
                    })
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!("{} row(s) returned", results.len().to_string().cyan());
        }
    }
}

fn val_to_string(val: &Value) -> String {
    match val {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => val.to_string(),
    }
}

fn show_types(wide: bool) {
    let flags = Flags { ids_as_big_int: wide, ..Flags::default() };
    let dbs = Dbs::new(Arc::new(DryRun), Arc::new(TracingDiagnostics::default()), flags);

    let kinds = [
        "int", "id", "bool", "float", "string", "email", "time", "bigint", "array_time",
        "array_bigint", "array_int", "array_id",
    ];

    println!("{:16} {}", "Field type".white().bold(), "Column type".white().bold());
    println!("{}", "─".repeat(40).dimmed());
    for name in kinds {
        let Ok(kind) = name.parse::<FieldKind>() else {
            continue;
        };
        let mut ty = FieldType::new(kind);
        if name == "id" {
            ty = ty.auto();
        }
        match dbs.convert_type(&ty) {
            Ok(sql) => println!("{:16} {}", ty.to_string().cyan(), sql.yellow()),
            Err(e) => println!("{:16} {}", name.cyan(), e.to_string().red()),
        }
    }
}
