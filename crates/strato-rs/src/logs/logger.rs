//! Logger configuration and structured output formatting.
//!
//! Output is column-aligned for scanning:
//!
//! ```text
//! Aug 01 26 09:14:02 AM | [INFO ] | server.rs:88        | listening on 127.0.0.1:8085
//! Aug 01 26 09:14:03 AM | [WARN ] | rate_limit.rs:201   | scope ip:10.0.0.9 throttled
//! ```
//!
//! `RUST_LOG` controls filtering and `NO_COLOR` disables ANSI styling, so
//! the same format works in terminals and log aggregation.

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;

const LEVEL_FIELD_WIDTH: usize = 7;
const FILE_LINE_FIELD_WIDTH: usize = 22;

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[34m",
        log::Level::Trace => "\x1b[35m",
    }
}

/// Configure and initialize the process-wide logger.
///
/// Call once during startup, in every process role (supervisor, worker,
/// single-process server). Worker processes inherit the parent's stderr, so
/// their lines interleave naturally with the supervisor's; stdout stays
/// reserved for the IPC channel.
pub fn configure_logger() {
    let no_color = env::var("NO_COLOR").is_ok();

    let mut builder = Builder::new();
    builder.format(move |buf, record| {
        let level = record.level();
        // Pad the plain text first so ANSI codes never skew alignment.
        let level_field = format!("[{:<width$}]", level, width = LEVEL_FIELD_WIDTH - 2);
        let level_display = if no_color {
            level_field
        } else {
            format!("{}{}\x1b[0m", level_color(level), level_field)
        };

        let file = record
            .file()
            .map(|f| f.rsplit('/').next().unwrap_or(f))
            .unwrap_or("unknown");
        let file_line = format!("{}:{}", file, record.line().unwrap_or(0));

        writeln!(
            buf,
            "{} | {} | {:<width$} | {}",
            Local::now().format("%b %d %y %I:%M:%S %p"),
            level_display,
            file_line,
            record.args(),
            width = FILE_LINE_FIELD_WIDTH,
        )
    });

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    } else {
        builder.filter_level(LevelFilter::Info);
    }

    // init() panics when called twice; tests and embedded uses re-enter.
    let _ = builder.try_init();
}
