//! `strato` — launcher for the Strato application server.
//!
//! The launcher answers `--version` and `--help` itself and forwards
//! every other argument to the `strato-server` binary, preferring the
//! copy installed next to this executable over one found on PATH. Its
//! exit status mirrors the server's.
//!
//! Exit codes: 0 success, 1 generic error, 2 usage error.

use clap::{Arg, ArgAction, Command};
use console::style;
use std::path::PathBuf;
use std::process::{self, Command as ProcessCommand};

const SERVER_BINARY: &str = "strato-server";

/// Finds the server binary: sibling of this executable first, PATH second.
fn resolve_server_binary() -> PathBuf {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join(SERVER_BINARY);
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from(SERVER_BINARY)
}

fn main() {
    let matches = Command::new("strato")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Strato application server launcher")
        .arg(
            Arg::new("server_args")
                .help("Arguments passed through to the server binary")
                .num_args(0..)
                .allow_hyphen_values(true)
                .trailing_var_arg(true)
                .action(ArgAction::Append),
        )
        .get_matches();

    let args: Vec<String> = matches
        .get_many::<String>("server_args")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let binary = resolve_server_binary();
    let status = ProcessCommand::new(&binary).args(&args).status();

    match status {
        Ok(status) => {
            // Propagate the server's exit code; a signal death maps to
            // the generic failure code.
            process::exit(status.code().unwrap_or(1));
        }
        Err(e) => {
            eprintln!(
                "{} cannot launch {}: {}",
                style("error:").red().bold(),
                binary.display(),
                e
            );
            eprintln!(
                "{}",
                style("is the server binary installed next to this launcher or on PATH?").dim()
            );
            process::exit(1);
        }
    }
}
