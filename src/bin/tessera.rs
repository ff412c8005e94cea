//! Binary entry point for the Tessera administrative CLI.
#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tessera::{
    primitives::journal::{self, JournalFileSummary},
    storage::journal_dir_for,
    EnvOptions, EnvStats, Environment, FlushReport, PageNumber, TesseraError,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Administrative CLI for Tessera storage environments",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "TESSERA_CONFIG",
        help = "TOML file with environment options"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the page size (bytes)")]
    page_size: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print environment statistics (replays the journal first)")]
    Stats {
        #[arg(value_name = "ENV")]
        env_path: PathBuf,
    },

    #[command(about = "Flush durable pages into the data file")]
    Flush {
        #[arg(value_name = "ENV")]
        env_path: PathBuf,
    },

    #[command(about = "List journal files and records without modifying them")]
    InspectJournal {
        #[arg(value_name = "ENV")]
        env_path: PathBuf,
    },

    #[command(about = "Hex-dump a page as seen by a read transaction")]
    DumpPage {
        #[arg(value_name = "ENV")]
        env_path: PathBuf,

        #[arg(value_name = "PAGE")]
        page: u64,

        #[arg(long, default_value_t = 1, help = "Run length in pages")]
        count: u32,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("failed to load config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: TesseraError,
    },
    #[error(transparent)]
    Storage(#[from] TesseraError),
    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Serialize)]
struct PageDump {
    page: u64,
    pages: u32,
    snapshot: u64,
    hex: String,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let options = load_options(&cli.open)?;

    match cli.command {
        Command::Stats { env_path } => {
            let env = Environment::open(&env_path, options)?;
            let report = env.stats();
            env.close()?;
            emit(cli.format, &report, print_stats_text)?;
        }
        Command::Flush { env_path } => {
            let env = Environment::open(&env_path, options)?;
            let report = env.flush_log_to_data_file()?;
            env.close()?;
            emit(cli.format, &report, print_flush_text)?;
        }
        Command::InspectJournal { env_path } => {
            let files = journal::inspect(&journal_dir_for(&env_path), options.page_size)?;
            emit(cli.format, &files, print_journal_text)?;
        }
        Command::DumpPage {
            env_path,
            page,
            count,
        } => {
            let env = Environment::open(&env_path, options)?;
            let dump = {
                let reader = env.begin_read()?;
                let image = reader.read_pages(PageNumber(page), count)?;
                PageDump {
                    page,
                    pages: count,
                    snapshot: reader.snapshot().0,
                    hex: hex::encode(image.data()),
                }
            };
            env.close()?;
            emit(cli.format, &dump, print_page_text)?;
        }
    }
    Ok(())
}

fn load_options(args: &OpenArgs) -> Result<EnvOptions, CliError> {
    let mut options = match &args.config {
        Some(path) => EnvOptions::from_toml_file(path).map_err(|source| CliError::Config {
            path: path.clone(),
            source,
        })?,
        None => EnvOptions::default(),
    };
    if let Some(page_size) = args.page_size {
        options.page_size = page_size;
    }
    // One-shot commands never need the background flusher.
    options.manual_flushing = true;
    Ok(options)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), CliError>
where
    T: Serialize,
    F: Fn(&mut dyn Write, &T) -> io::Result<()>,
{
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            writeln!(out, "{json}")?;
        }
        OutputFormat::Text => printer(&mut out, value)?,
    }
    Ok(())
}

fn print_stats_text(out: &mut dyn Write, stats: &EnvStats) -> io::Result<()> {
    writeln!(out, "{stats}")
}

fn print_flush_text(out: &mut dyn Write, report: &FlushReport) -> io::Result<()> {
    if report.is_noop() {
        return writeln!(out, "Nothing to flush (flushed up to tx {})", report.flushed_up_to);
    }
    writeln!(
        out,
        "Flushed tx {}..={}: {} run(s) written, {} scratch slot(s) released, {} journal file(s) retired in {} us",
        report.previous + 1,
        report.flushed_up_to,
        report.runs_written,
        report.slots_released,
        report.journal_files_retired,
        report.elapsed_us
    )
}

fn print_journal_text(out: &mut dyn Write, files: &Vec<JournalFileSummary>) -> io::Result<()> {
    if files.is_empty() {
        return writeln!(out, "No journal files");
    }
    for file in files {
        writeln!(
            out,
            "{} ({} bytes, {} record(s))",
            file.path.display(),
            file.bytes,
            file.records.len()
        )?;
        for record in &file.records {
            writeln!(
                out,
                "  @{:<10} tx={:<8} pages={:<5} bytes={:<8}{}",
                record.offset,
                record.tx,
                record.pages,
                record.bytes,
                if record.compressed { " snappy" } else { "" }
            )?;
        }
        if let Some((offset, reason)) = file.damage {
            writeln!(out, "  damaged at {offset}: {reason}")?;
        }
    }
    Ok(())
}

fn print_page_text(out: &mut dyn Write, dump: &PageDump) -> io::Result<()> {
    writeln!(
        out,
        "page {} ({} page(s), snapshot {})",
        dump.page, dump.pages, dump.snapshot
    )?;
    for (line, chunk) in dump.hex.as_bytes().chunks(32).enumerate() {
        let text = std::str::from_utf8(chunk).unwrap_or_default();
        writeln!(out, "{:08x}  {text}", line * 16)?;
    }
    Ok(())
}
