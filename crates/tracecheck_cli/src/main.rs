//! tracecheck CLI
//!
//! Checks a JSON-lines memory trace for invariant violations and reconciles
//! it against canonical schedule files.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use console::style;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracecheck_core::FileType;
use tracecheck_engine::{
    split_by_thread, CheckReport, CheckerConfig, InvariantChecker, TraceReader, X86BranchDecoder,
};
use tracecheck_log::{StreamHeader, TraceRecord};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracecheck")]
#[command(about = "Validate memory-trace invariants and schedule files", long_about = None)]
struct Cli {
    /// Trace file, one JSON record per line
    #[arg(short, long)]
    trace: PathBuf,
    /// Trace was post-processed offline (the default)
    #[arg(long, conflicts_with = "online")]
    offline: bool,
    /// Trace was captured online
    #[arg(long)]
    online: bool,
    /// Increase verbosity; -vvv logs every record
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Known test app whose trace gets extra checks
    #[arg(long)]
    test_name: Option<String>,
    /// Canonical serial schedule file
    #[arg(long)]
    serial_schedule: Option<PathBuf>,
    /// Canonical per-cpu schedule file
    #[arg(long)]
    cpu_schedule: Option<PathBuf>,
    /// Check each thread on its own worker
    #[arg(long)]
    parallel: bool,
    /// Checker configuration as JSON; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep checking after the first violation
    #[arg(long)]
    keep_going: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn checker_config(&self) -> Result<CheckerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("reading config {}", path.display()))?;
                CheckerConfig::from_json(&text)?
            }
            None => CheckerConfig::default(),
        };
        if self.online {
            config.offline = false;
        }
        if self.offline {
            config.offline = true;
        }
        if self.verbose > 0 {
            config.verbose = u32::from(self.verbose);
        }
        if let Some(name) = &self.test_name {
            config.test_name = Some(name.clone());
        }
        if self.keep_going {
            config.stop_on_error = false;
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Feed every record through one checker, shards discovered on the fly
fn run_serial(checker: &mut InvariantChecker, records: Vec<TraceRecord>) {
    let mut reader = TraceReader::from_records(records);
    checker.initialize_stream(reader.stream());
    while let Some(record) = reader.next_record() {
        if checker.process_record(&record).is_err() && checker.config().stop_on_error {
            break;
        }
    }
}

/// One worker per thread, each with its own stream
fn run_parallel(checker: &InvariantChecker, records: Vec<TraceRecord>) {
    // Register up front so shard order does not depend on thread timing.
    let workers: Vec<_> = split_by_thread(records)
        .into_values()
        .enumerate()
        .map(|(index, shard_records)| {
            let reader = TraceReader::from_records(shard_records);
            let shard = checker.init_shard(index, Some(reader.stream()));
            (shard, reader)
        })
        .collect();

    std::thread::scope(|scope| {
        for (shard, mut reader) in workers {
            scope.spawn(move || {
                while let Some(record) = reader.next_record() {
                    if checker.process_shard(&shard, &record).is_err()
                        && checker.config().stop_on_error
                    {
                        break;
                    }
                }
                if !checker.exit_shard(&shard) {
                    tracing::warn!(error = %checker.shard_error(&shard), "shard failed");
                }
            });
        }
    });
}

fn check(cli: &Cli) -> Result<CheckReport> {
    let config = cli.checker_config()?;
    let records = TraceRecord::read_json_lines(open(&cli.trace)?)?;
    tracing::info!(records = records.len(), parallel = cli.parallel, "checking trace");

    let mut checker = InvariantChecker::new(config);
    let header = StreamHeader::scan(&records);
    if !header
        .filetype
        .contains_any(FileType::ARCH_AARCH64 | FileType::ARCH_ARM32)
    {
        checker = checker.with_decoder(X86BranchDecoder);
    }
    if let Some(path) = &cli.serial_schedule {
        checker = checker.with_serial_schedule(open(path)?);
    }
    if let Some(path) = &cli.cpu_schedule {
        checker = checker.with_cpu_schedule(open(path)?);
    }

    if cli.parallel {
        run_parallel(&checker, records);
    } else {
        run_serial(&mut checker, records);
    }
    Ok(checker.print_results())
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let report = check(&cli)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.passed {
        eprintln!("{}", style(report.summary()).green());
    } else {
        eprintln!("{}", style(report.summary()).red().bold());
    }
    Ok(if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
