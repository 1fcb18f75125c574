mod app_error;
mod attachments;
mod config;
mod db;
mod importer;
mod markdown;
mod models;
mod php_serialize;
mod source;

use std::io::Read;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use app_error::AppResult;
use config::{CliSettings, Config};
use db::Db;
use importer::{ImportOptions, Importer, Step};
use source::PhorumSource;

#[derive(Parser)]
#[command(name = "phorum-import", version, about = "Imports a Phorum forum")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log at info level regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the import job
    Import(ImportArgs),
    /// Print the Markdown form of a post body read from FILE or stdin
    Convert(ConvertArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// Path to phorum-import.toml
    #[arg(short, long, env = "PHORUM_IMPORT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite snapshot of the Phorum database
    #[arg(long, env = "PHORUM_SOURCE")]
    source: Option<PathBuf>,

    /// Destination forum database
    #[arg(long, env = "PHORUM_DESTINATION")]
    destination: Option<PathBuf>,

    #[arg(long)]
    table_prefix: Option<String>,

    /// Prefix of the legacy URLs, e.g. "phorum/"
    #[arg(long)]
    base: Option<String>,

    #[arg(long)]
    batch_size: Option<i64>,

    /// Only run these steps (repeatable); all steps run by default
    #[arg(long = "step", value_enum)]
    steps: Vec<Step>,
}

#[derive(Args)]
struct ConvertArgs {
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Import(args) => run_import(args),
        Command::Convert(args) => run_convert(args),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_import(args: ImportArgs) -> AppResult<()> {
    let settings = CliSettings {
        source: args.source,
        destination: args.destination,
        table_prefix: args.table_prefix,
        base: args.base,
        batch_size: args.batch_size,
    };
    let config = Config::load(args.config.as_deref(), &settings)?;

    let source = PhorumSource::open(
        &config.source.path,
        &config.source.table_prefix,
        config.source.custom_field_column.as_deref(),
    )?;
    let destination = config.destination_path()?;
    log::info!("importing {} into {}", config.source.path.display(), destination.display());
    let db = Db::open(&destination)?;

    let options = ImportOptions {
        base: config.import.base.clone(),
        batch_size: config.import.batch_size,
        tmp_dir: config.import.tmp_dir.clone(),
        custom_user_field: config.import.custom_user_field.as_ref().map(|f| f.spec()),
    };
    let steps = if args.steps.is_empty() {
        Step::ALL.to_vec()
    } else {
        args.steps
    };

    let stats = Importer::new(&source, &db, options).perform(&steps)?;
    println!(
        "done: {} created, {} skipped, {} failed",
        stats.created, stats.skipped, stats.failed
    );
    Ok(())
}

fn run_convert(args: ConvertArgs) -> AppResult<()> {
    let raw = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let label = args
        .file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stdin".to_string());
    println!("{}", markdown::phorum_to_markdown(&raw, &label));
    Ok(())
}
