// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::boxed::Box;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::panic;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use stackwalk::{StackWalker, WalkerOptions, DEFAULT_MAX_FRAMES};

mod output;
mod snapshot;

use output::{Report, ThreadReport};
use snapshot::{parse_address, Snapshot};

/// Walks the threads of a process snapshot and produces a report (either human-readable
/// or JSON).
#[derive(Debug, Parser)]
#[command(name = "stackwalk", version)]
struct Args {
    /// Emit a machine-readable JSON report.
    #[arg(long)]
    json: bool,

    /// Pretty-print --json output.
    #[arg(long, requires = "json")]
    pretty: bool,

    /// Only walk the thread with this id (decimal or 0x hex). May be repeated; by default
    /// every thread in the snapshot is walked.
    #[arg(long = "thread", value_name = "ID", value_parser = parse_address)]
    threads: Vec<u64>,

    /// Give up on a thread after this many frames.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_FRAMES)]
    max_frames: usize,

    /// Walk every thread to its end, however long.
    #[arg(long, conflicts_with = "max_frames")]
    unbounded: bool,

    /// Where to write the output to (if unspecified, stdout is used).
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Where to write logs to (if unspecified, stderr is used).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Set the logging level.
    ///
    /// The walker is heavily instrumented with `trace` logging, so if you want to debug
    /// why a walk went the way it did, --verbose=trace is very useful (unwinder logging
    /// is prefixed with `unwind:`, state transitions with `stackwalk:`).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "error",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"]
    )]
    verbose: String,

    /// Path to the JSON process snapshot to walk.
    snapshot: PathBuf,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let verbosity = match args.verbose.as_str() {
        "off" => LevelFilter::Off,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Make trace logging less noisy
    let mut config = ConfigBuilder::new();
    config
        .set_location_level(LevelFilter::Off)
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off);

    if let Some(log_path) = &args.log_file {
        let log_file = File::create(log_path)
            .with_context(|| format!("while creating log file {}", log_path.display()))?;
        let _ = WriteLogger::init(verbosity, config.build(), log_file);
    } else {
        let _ = TermLogger::init(
            verbosity,
            config.set_level_color(Level::Trace, None).build(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );
    }
    Ok(())
}

fn set_panic_hook() {
    // Redirect panics to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));
}

/// Walk the requested threads and write the report. Returns whether every walk
/// completed.
fn try_main(args: &Args) -> anyhow::Result<bool> {
    let snapshot = Snapshot::read_path(&args.snapshot)?;
    let target = snapshot.target()?;
    let locator = snapshot.code_regions();

    let options = if args.unbounded {
        WalkerOptions::unbounded()
    } else {
        WalkerOptions::with_max_frames(args.max_frames)
    };
    let walker = StackWalker::with_options(&target, &locator, options);

    let threads = snapshot
        .threads(&args.threads)
        .into_iter()
        .map(|thread| {
            let stack = walker.walk_stack(&thread);
            info!(
                "thread {}: {} frames{}",
                stack.thread_id,
                stack.frames.len(),
                if stack.error.is_some() { ", failed" } else { "" }
            );
            ThreadReport::new(&walker, stack)
        })
        .collect();
    let report = Report {
        arch: snapshot.arch,
        threads,
    };

    let mut stdout;
    let mut output_f;
    let mut output: &mut dyn Write = if let Some(output_path) = &args.output_file {
        output_f = File::create(output_path)
            .with_context(|| format!("while creating output file {}", output_path.display()))?;
        &mut output_f
    } else {
        stdout = std::io::stdout();
        &mut stdout
    };

    if args.json {
        report
            .print_json(&mut output, args.pretty)
            .context("while writing JSON report")?;
    } else {
        report.print(&mut output).context("while writing report")?;
    }
    output.flush()?;

    for thread in &report.threads {
        if let Some(err) = &thread.error {
            error!("{} - Error walking thread {}: {}", err.name(), thread.id, err);
        }
    }
    Ok(report.succeeded())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    set_panic_hook();

    match try_main(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}
