/*
 * Copyright 2024 Oxide Computer Company
 */

use atty::Stream;
use slog::Drain;
use std::path::Path;
use std::sync::Mutex;

pub use anyhow::{anyhow, bail, Context, Result};
pub use slog::{debug, error, info, o, trace, warn, Logger};

fn term_log() -> Logger {
    let dec = slog_term::TermDecorator::new().stdout().build();
    if atty::is(Stream::Stdout) {
        let dr = Mutex::new(slog_term::CompactFormat::new(dec).build()).fuse();
        slog::Logger::root(dr, o!())
    } else {
        let dr = Mutex::new(
            slog_term::FullFormat::new(dec).use_original_order().build(),
        )
        .fuse();
        slog::Logger::root(dr, o!())
    }
}

/**
 * Initialise a logger which writes to stdout, and which does the right thing on
 * both an interactive terminal and when stdout is not a tty.
 */
pub fn init_log() -> Logger {
    term_log()
}

/**
 * Initialise the logger used for a provisioning run.  Records are written to
 * stdout as with init_log(), and are also appended to a plain text log file if
 * one was requested, so that there is a record of what was done to the host
 * after the terminal session is gone.
 */
pub fn init_run_log(verbose: bool, logfile: Option<&Path>) -> Result<Logger> {
    let level = if verbose { slog::Level::Debug } else { slog::Level::Info };
    let term = term_log();

    let Some(logfile) = logfile else {
        let dr = slog::LevelFilter::new(term, level).ignore_res();
        return Ok(slog::Logger::root(dr, o!()));
    };

    let f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)
        .with_context(|| format!("opening log file {:?}", logfile))?;
    let dec = slog_term::PlainSyncDecorator::new(f);
    let file = slog_term::FullFormat::new(dec).use_original_order().build();

    let dr = slog::LevelFilter::new(slog::Duplicate::new(term, file), level)
        .ignore_res();
    Ok(slog::Logger::root(dr, o!()))
}

pub trait OutputExt {
    fn info(&self) -> String;
}

impl OutputExt for std::process::Output {
    fn info(&self) -> String {
        let mut out = String::new();

        if let Some(code) = self.status.code() {
            out.push_str(&format!("exit code {}", code));
        }

        /*
         * Attempt to render stderr from the command:
         */
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        let extra = if stderr.is_empty() {
            /*
             * If there is no stderr output, this command might emit its
             * failure message on stdout:
             */
            String::from_utf8_lossy(&self.stdout).trim().to_string()
        } else {
            stderr
        };

        if !extra.is_empty() {
            if !out.is_empty() {
                out.push_str(": ");
            }
            out.push_str(&extra);
        }

        out
    }
}

pub fn sleep(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
