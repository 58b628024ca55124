use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kira_align_batch::catalog::{CATALOG_QUOTED, dump_catalog};
use kira_align_batch::collection::PreparedCollection;
use kira_align_batch::config::{ConfigLoader, RunOverrides, ToolPaths, resolve_collection};
use kira_align_batch::domain::{CancelPolicy, ColumnSelector, Delimiter, EnrichMode, OrderPolicy};
use kira_align_batch::error::AlignError;
use kira_align_batch::hits;
use kira_align_batch::lineage::{LineageMap, enrich_relation};
use kira_align_batch::output::{EnrichResult, JsonOutput, OutputMode};
use kira_align_batch::run::{Phase, ProgressEvent, ProgressSink, RunAborted, RunSummary, Runner};
use kira_align_batch::tools::{SequenceTools, SystemBlastTools};

#[derive(Parser)]
#[command(name = "kira-ab")]
#[command(about = "Batch fetch-and-align against a local BLAST collection")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch and align every accession, writing one hit relation")]
    Run(RunArgs),
    #[command(about = "Dump every record of the collection with parent taxids")]
    Catalog(CatalogArgs),
    #[command(about = "Append parent taxids to an existing relation")]
    Enrich(EnrichArgs),
    #[command(about = "Show located BLAST+ tools and versions")]
    Tools(ToolsArgs),
}

#[derive(Args, Clone, Default)]
struct CollectionArgs {
    #[arg(long)]
    db: Option<Utf8PathBuf>,

    #[arg(long, conflicts_with = "db")]
    archive: Option<Utf8PathBuf>,

    #[arg(long)]
    extract_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    keep_extracted: bool,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[command(flatten)]
    collection: CollectionArgs,

    #[arg(long)]
    accessions: Option<Utf8PathBuf>,

    #[arg(long)]
    column: Option<ColumnSelector>,

    #[arg(long, value_enum)]
    accessions_delimiter: Option<Delimiter>,

    #[arg(long)]
    header: bool,

    #[arg(long, allow_negative_numbers = true)]
    batch_size: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    workers: Option<i64>,

    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    max_target_seqs: Option<usize>,

    #[arg(long, short)]
    output: Option<Utf8PathBuf>,

    #[arg(long, value_enum)]
    delimiter: Option<Delimiter>,

    #[arg(long, value_enum)]
    enrich: Option<EnrichMode>,

    #[arg(long)]
    lineage: Option<Utf8PathBuf>,

    #[arg(long, value_enum)]
    order: Option<OrderPolicy>,

    #[arg(long, value_enum)]
    cancel_policy: Option<CancelPolicy>,

    #[arg(long)]
    max_failures: Option<usize>,

    #[arg(long)]
    scratch_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CatalogArgs {
    #[arg(long)]
    config: Option<String>,

    #[command(flatten)]
    collection: CollectionArgs,

    #[arg(long, short, default_value = "catalog.tsv")]
    output: Utf8PathBuf,

    #[arg(long)]
    lineage: Option<Utf8PathBuf>,

    #[arg(long)]
    no_lineage: bool,
}

#[derive(Args)]
struct EnrichArgs {
    #[arg(long)]
    input: Utf8PathBuf,

    #[arg(long, short)]
    output: Utf8PathBuf,

    #[arg(long)]
    lineage: Utf8PathBuf,

    #[arg(long, default_value = hits::SUBJECT_TAXID_COLUMN)]
    column: ColumnSelector,

    #[arg(long, value_enum, default_value_t = Delimiter::Tab)]
    delimiter: Delimiter,
}

#[derive(Args)]
struct ToolsArgs {
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(aborted) = report.downcast_ref::<RunAborted>() {
            return ExitCode::from(map_exit_code(&aborted.source));
        }
        if let Some(error) = report.downcast_ref::<AlignError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AlignError) -> u8 {
    match error {
        error if error.is_configuration() => 2,
        AlignError::MissingTool(_) => 3,
        AlignError::OutputWrite(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, mode),
        Commands::Catalog(args) => run_catalog(args, mode),
        Commands::Enrich(args) => run_enrich(args, mode),
        Commands::Tools(args) => run_tools(args, mode),
    }
}

fn system_tools(paths: &ToolPaths, timeout: Option<std::time::Duration>) -> SystemBlastTools {
    SystemBlastTools::with_paths(
        paths.blastdbcmd.clone().map(Utf8PathBuf::into_std_path_buf),
        paths.blastn.clone().map(Utf8PathBuf::into_std_path_buf),
        timeout,
    )
}

fn run_pipeline(args: RunArgs, mode: OutputMode) -> miette::Result<()> {
    let overrides = RunOverrides {
        db: args.collection.db,
        archive: args.collection.archive,
        extract_dir: args.collection.extract_dir,
        keep_extracted: args.collection.keep_extracted,
        accessions: args.accessions,
        column: args.column,
        accessions_delimiter: args.accessions_delimiter,
        header: args.header,
        batch_size: args.batch_size,
        workers: args.workers,
        timeout_secs: args.timeout,
        max_target_seqs: args.max_target_seqs,
        output: args.output,
        delimiter: args.delimiter,
        enrich: args.enrich,
        lineage: args.lineage,
        order: args.order,
        cancel_policy: args.cancel_policy,
        max_failures: args.max_failures,
        scratch_dir: args.scratch_dir,
    };
    let config = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let tools = system_tools(&config.tools, config.timeout);
    tools.require_ready()?;

    let runner = Runner::new(config, tools);
    let token = runner.cancel_token();
    if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
        warn!(error = %err, "interrupt handler not installed");
    }
    let result = match mode {
        OutputMode::Json => runner.run(&JsonOutput),
        OutputMode::Human => {
            let progress = BarProgress::new();
            let result = runner.run(&progress);
            progress.finish();
            result
        }
    };

    let (summary, error) = match result {
        Ok(summary) => (summary, None),
        Err(aborted) => (*aborted.summary.clone(), Some(aborted)),
    };
    match mode {
        OutputMode::Json => JsonOutput::print_run(&summary).into_diagnostic()?,
        OutputMode::Human => print_run_summary(&summary),
    }
    match error {
        Some(aborted) => Err(aborted.into()),
        None if summary.interrupted => {
            miette::bail!("interrupted: {} units were not dispatched", summary.units_cancelled)
        }
        None => Ok(()),
    }
}

fn run_catalog(args: CatalogArgs, mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::load(args.config.as_deref())?;
    let overrides = RunOverrides {
        db: args.collection.db,
        archive: args.collection.archive,
        extract_dir: args.collection.extract_dir,
        keep_extracted: args.collection.keep_extracted,
        ..RunOverrides::default()
    };
    let source = resolve_collection(config.collection.as_ref(), &overrides)?;
    // A full dump can run far longer than any per-accession call.
    let tools = system_tools(&config.tools, None);
    tools.require_ready()?;

    let collection = PreparedCollection::prepare(&source)?;
    let lineage = if args.no_lineage {
        None
    } else {
        match args.lineage.or(config.lineage) {
            Some(path) => Some(path.into_std_path_buf()),
            None => collection.bundled_lineage(),
        }
    };
    let lineage = lineage
        .map(|path| LineageMap::load(&path).map(Arc::new))
        .transpose()?;

    let summary = dump_catalog(
        &tools,
        collection.prefix(),
        args.output.as_std_path(),
        lineage,
    )?;
    match mode {
        OutputMode::Json => JsonOutput::print_catalog(&summary).into_diagnostic()?,
        OutputMode::Human => {
            println!(
                "\x1b[32mCatalog written: {} records -> {}{}\x1b[0m",
                summary.records,
                summary.output,
                if summary.enriched { " (with taxid_parent)" } else { "" }
            );
        }
    }
    Ok(())
}

fn run_enrich(args: EnrichArgs, mode: OutputMode) -> miette::Result<()> {
    let lineage = Arc::new(LineageMap::load(args.lineage.as_std_path())?);
    let mut quoted: Vec<&str> = hits::QUOTED_COLUMNS.to_vec();
    quoted.extend(CATALOG_QUOTED);

    let rows = enrich_relation(
        args.input.as_std_path(),
        args.output.as_std_path(),
        lineage,
        &args.column,
        args.delimiter,
        &quoted,
    )?;
    let result = EnrichResult {
        input: args.input.to_string(),
        output: args.output.to_string(),
        rows,
    };
    match mode {
        OutputMode::Json => JsonOutput::print_enrich(&result).into_diagnostic()?,
        OutputMode::Human => println!(
            "\x1b[32mEnriched {} rows -> {}\x1b[0m",
            result.rows, result.output
        ),
    }
    Ok(())
}

fn run_tools(args: ToolsArgs, mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::load(args.config.as_deref())?;
    let tools = system_tools(&config.tools, None);
    let info = tools.tool_info();
    match mode {
        OutputMode::Json => JsonOutput::print_tools(&info).into_diagnostic()?,
        OutputMode::Human => {
            let line = |name: &str, path: &Option<String>, version: &Option<String>| match path {
                Some(path) => println!(
                    "{name}: {path} ({})",
                    version.as_deref().unwrap_or("version unknown")
                ),
                None => println!("\x1b[31m{name}: not found\x1b[0m"),
            };
            line("blastdbcmd", &info.blastdbcmd, &info.blastdbcmd_version);
            line("blastn", &info.blastn, &info.blastn_version);
        }
    }
    tools.require_ready()?;
    Ok(())
}

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn event(&self, event: ProgressEvent) {
        match (event.phase, event.progress) {
            (Phase::Unit, Some((done, total))) => {
                self.bar.set_length(total as u64);
                self.bar.set_position(done as u64);
                self.bar.set_message(event.message);
            }
            _ => self.bar.set_message(event.message),
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}KIRA-AB summary{reset}");
    println!("{cyan}  collection: {}{reset}", summary.collection);
    println!(
        "{cyan}  started {} / finished {} ({:.1}s){reset}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S"),
        summary.finished_at.format("%Y-%m-%d %H:%M:%S"),
        summary.elapsed_secs
    );
    println!(
        "  units: {} total, {} attempted, {strategy}, {} workers",
        summary.units_total,
        summary.units_attempted,
        summary.workers,
        strategy = summary.strategy
    );
    println!("{green}  completed: {}{reset}", summary.units_completed);
    println!("{yellow}  skipped: {}{reset}", summary.units_skipped);
    println!("{red}  failed: {}{reset}", summary.units_failed);
    if summary.units_abandoned > 0 || summary.units_cancelled > 0 {
        println!(
            "{yellow}  abandoned: {}, cancelled: {}{reset}",
            summary.units_abandoned, summary.units_cancelled
        );
    }
    println!(
        "{green}  rows written: {} -> {} (enrichment: {}){reset}",
        summary.rows_written, summary.output, summary.enrichment
    );
    if !summary.missing_accessions.is_empty() {
        println!(
            "{yellow}  accessions without sequence: {}{reset}",
            summary.missing_accessions.len()
        );
    }
    for failure in &summary.failures {
        println!(
            "{red}  unit {} [{}] {}: {}{reset}",
            failure.unit,
            failure.accessions.join(","),
            failure.stage,
            failure.diagnostic
        );
    }
    if !summary.rejected_accessions.is_empty() {
        println!(
            "{yellow}  unusable accessions skipped: {}{reset}",
            summary.rejected_accessions.join(", ")
        );
    }
    if summary.interrupted {
        println!("{yellow}  stopped early: interrupted{reset}");
    }
    if summary.cancelled {
        println!("{yellow}  stopped early: failure budget exceeded{reset}");
    }
}
