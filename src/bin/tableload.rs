use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use table_loader::config::LoaderConfig;
use table_loader::export::ExportEngine;
use table_loader::ingest::ImportEngine;
use table_loader::schema::{
    ColumnSchema, ExportJobRequest, FileFormat, FormatOptions, ImportJobRequest, ImportMode,
};
use table_loader::store::{
    PgSchemaCatalog, PgTargetStore, SchemaCatalog, TargetStore, run_migrations,
};

#[derive(Parser, Debug)]
#[command(name = "tableload", about = "Load delimited or markup files into PostgreSQL tables and export them back")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a file into a table.
    Import(ImportArgs),
    /// Export a table to a file.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct FormatArgs {
    /// Field delimiter for delimited files.
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// The file has no header line.
    #[arg(long)]
    no_header: bool,

    /// Element wrapping all rows in markup files.
    #[arg(long)]
    root_element: Option<String>,

    /// Element wrapping one row in markup files.
    #[arg(long)]
    row_element: Option<String>,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Target table, optionally schema-qualified.
    #[arg(long)]
    target: String,

    /// JSON file holding the column list.
    #[arg(long)]
    schema: PathBuf,

    /// File to import.
    #[arg(long)]
    file: PathBuf,

    #[command(flatten)]
    format: FormatArgs,

    /// Lines to skip after the header.
    #[arg(long, default_value_t = 0)]
    skip_rows: usize,

    #[arg(long, value_enum, default_value_t = ModeArg::Insert)]
    mode: ModeArg,

    /// Create the target from the schema when it does not exist.
    #[arg(long)]
    new_target: bool,

    /// Recorded as last_modified_by.
    #[arg(long)]
    actor: Option<String>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long)]
    source: String,

    #[arg(long, value_enum)]
    format: FormatArg,

    /// Comma-separated column projection.
    #[arg(long, value_delimiter = ',')]
    columns: Option<Vec<String>>,

    /// SQL predicate appended as a WHERE clause.
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    limit: Option<u64>,

    #[command(flatten)]
    options: FormatArgs,

    #[arg(long)]
    output: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Insert,
    Replace,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Csv,
    Xml,
}

impl FormatArgs {
    fn options(&self, skip_rows: usize) -> FormatOptions {
        FormatOptions {
            delimiter: self.delimiter,
            has_header: !self.no_header,
            skip_rows,
            root_element: self.root_element.clone(),
            row_element: self.row_element.clone(),
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after in-flight batches");
            trigger.cancel();
        }
    });
    token
}

async fn run_import(
    args: ImportArgs,
    store: Arc<dyn TargetStore>,
    catalog: Arc<dyn SchemaCatalog>,
    config: LoaderConfig,
) -> Result<bool, Box<dyn std::error::Error>> {
    let columns: Vec<ColumnSchema> =
        serde_json::from_slice(&tokio::fs::read(&args.schema).await?)?;
    let actor = args.actor.unwrap_or_else(|| config.default_actor.clone());

    let request = ImportJobRequest {
        target: args.target,
        columns,
        options: args.format.options(args.skip_rows),
        mode: match args.mode {
            ModeArg::Insert => ImportMode::Insert,
            ModeArg::Replace => ImportMode::Replace,
        },
        is_new_target: args.new_target,
        actor,
    };

    let file_name = args.file.to_string_lossy().into_owned();
    let input = tokio::fs::File::open(&args.file).await?;
    let engine = ImportEngine::new(store, catalog, config);
    let result = engine
        .run_import(input, Some(&file_name), None, &request, &cancel_on_ctrl_c())
        .await?;

    println!(
        "processed {} rows: {} inserted, {} duplicates, {} errors",
        result.rows_processed, result.rows_inserted, result.rows_skipped, result.error_count
    );
    let mut stderr = io::stderr();
    for error in &result.errors {
        writeln!(
            stderr,
            "row {}: {}{}",
            error.row_number,
            error.column.as_deref().map(|c| format!("{c}: ")).unwrap_or_default(),
            error.message
        )?;
    }
    if let Some(failure) = &result.failure {
        writeln!(stderr, "error: {failure}")?;
    }
    Ok(result.success)
}

async fn run_export(
    args: ExportArgs,
    store: Arc<dyn TargetStore>,
    catalog: Arc<dyn SchemaCatalog>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let request = ExportJobRequest {
        source: args.source,
        columns: args.columns,
        filter: args.filter,
        limit: args.limit,
        format: match args.format {
            FormatArg::Csv => FileFormat::Delimited,
            FormatArg::Xml => FileFormat::Markup,
        },
        options: args.options.options(0),
    };

    let output = tokio::fs::File::create(&args.output).await?;
    let engine = ExportEngine::new(store, catalog);
    let result = engine
        .run_export(&request, output, &cancel_on_ctrl_c())
        .await?;

    println!(
        "exported {} rows ({} bytes) to {}",
        result.rows_exported,
        result.bytes_written,
        args.output.display()
    );
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL")?;
    let config = LoaderConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_parallel_batches as u32 + 2)
        .connect(&database_url)
        .await?;
    run_migrations(&pool).await?;

    let store: Arc<dyn TargetStore> = Arc::new(PgTargetStore::new(pool.clone()));
    let catalog: Arc<dyn SchemaCatalog> = Arc::new(PgSchemaCatalog::new(pool.clone()));

    let succeeded = match cli.command {
        Command::Import(args) => run_import(args, store, catalog, config).await?,
        Command::Export(args) => run_export(args, store, catalog).await?,
    };

    pool.close().await;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
