//! # Logging Setup
//!
//! Layered tracing configuration: a detailed layer to a rolling file (or
//! stderr), and a clean colorized layer on stdout for user-facing output.
//! Verbosity on both is driven by the repeated `-v` flag; `--quiet`
//! suppresses the stdout layer entirely.

use anyhow::Result;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, Layer};

/// A custom tracing event formatter for colorizing log output based on level.
///
/// The entire line is colored according to its severity, without timestamps
/// or level prefixes, giving clean user-facing output on stdout.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Initialize the subscriber stack.
///
/// `log_file` of `Some("stderr")` sends the detailed layer to stderr; any
/// other value (or `None`) selects a daily-rolling file. The returned guard
/// must stay alive for the duration of the program, or file logging stops.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&str>) -> Result<Option<WorkerGuard>> {
    let log_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_layer;
    if let Some("stderr") = log_file {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match log_file {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("peer-communicator.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "peer-communicator.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing stdout output unless --quiet.
    let stdout_layer = if !quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}

/// The dated file name the daily roller actually writes today.
pub fn dated_log_file(log_file: Option<&str>) -> Option<String> {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    match log_file {
        Some("stderr") => Some("stderr".to_string()),
        Some(path) => Some(format!("{path}.{today}")),
        None => Some(format!("peer-communicator.log.{today}")),
    }
}
