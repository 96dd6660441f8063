/*
 * Copyright 2024 Oxide Computer Company
 */

use std::ffi::OsStr;
use std::io::{BufRead, Write};
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Output};

use crate::common::*;
use crate::file;

/*
 * Commands run with a cleared environment.  Some of the tools we drive (e.g.,
 * apt-get, mdadm, update-initramfs) run helpers of their own, so they still
 * need a sane PATH.
 */
const SAFE_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/**
 * All interaction with the host goes through this handle, so that a dry run can
 * show what would be done without doing it.  Read-only commands (listing
 * devices, querying VM status, etc) run even in a dry run so that the plan
 * reflects the real state of the host.
 */
pub struct Host<'a> {
    log: &'a Logger,
    dry_run: bool,
    assume_yes: bool,
}

fn render<S: AsRef<OsStr>>(prog: &str, args: &[S]) -> String {
    let mut out = prog.to_string();
    for a in args {
        out.push(' ');
        out.push_str(&a.as_ref().to_string_lossy());
    }
    out
}

fn command<S: AsRef<OsStr>>(prog: &str, args: &[S]) -> Command {
    let mut cmd = Command::new(prog);
    cmd.env_clear()
        .env("PATH", SAFE_PATH)
        .env("LC_ALL", "C")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .args(args);
    cmd
}

impl<'a> Host<'a> {
    pub fn new(log: &'a Logger, dry_run: bool, assume_yes: bool) -> Host<'a> {
        Host { log, dry_run, assume_yes }
    }

    pub fn log(&self) -> &Logger {
        self.log
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /**
     * Run a command that does not modify the host and return its output,
     * whether or not it succeeded.
     */
    pub fn query<S: AsRef<OsStr>>(&self, prog: &str, args: &[S]) -> Result<Output> {
        debug!(self.log, "exec: {}", render(prog, args));
        command(prog, args)
            .output()
            .with_context(|| format!("exec {}", render(prog, args)))
    }

    /**
     * Run a command that does not modify the host, and return its stdout.  The
     * command must succeed.
     */
    pub fn read<S: AsRef<OsStr>>(&self, prog: &str, args: &[S]) -> Result<String> {
        let output = self.query(prog, args)?;

        if !output.status.success() {
            bail!("{} failure: {}", render(prog, args), output.info());
        }

        Ok(String::from_utf8(output.stdout)?)
    }

    /**
     * Run a command that modifies the host.  In a dry run the command is only
     * logged.
     */
    pub fn run<S: AsRef<OsStr>>(&self, prog: &str, args: &[S]) -> Result<()> {
        if self.dry_run {
            info!(self.log, "dry-run: {}", render(prog, args));
            return Ok(());
        }

        info!(self.log, "exec: {}", render(prog, args));
        let output = command(prog, args)
            .output()
            .with_context(|| format!("exec {}", render(prog, args)))?;

        if !output.status.success() {
            bail!("{} failure: {}", render(prog, args), output.info());
        }

        Ok(())
    }

    /**
     * Run a command that modifies the host, but for which failure should not
     * end the run (e.g., restarting a service).  Returns true on success.
     */
    pub fn run_soft<S: AsRef<OsStr>>(&self, prog: &str, args: &[S]) -> bool {
        match self.run(prog, args) {
            Ok(()) => true,
            Err(e) => {
                warn!(self.log, "{}", e);
                false
            }
        }
    }

    /**
     * Write a file on the host, unless this is a dry run, in which case the
     * contents are logged instead.
     */
    pub fn write_file(&self, path: &str, data: &str) -> Result<()> {
        if self.dry_run {
            info!(self.log, "dry-run: write {}:\n{}", path, data);
            return Ok(());
        }

        info!(self.log, "write {}", path);
        file::write_file(path, data)
    }

    pub fn write_lines<L>(&self, path: &str, lines: &[L]) -> Result<()>
    where
        L: AsRef<str> + std::fmt::Debug,
    {
        self.write_file(path, &file::join_lines(lines))
    }

    pub fn ensure_dir(&self, path: &str) -> Result<()> {
        if self.dry_run {
            if !file::exists_dir(path)? {
                info!(self.log, "dry-run: mkdir {}", path);
            }
            return Ok(());
        }

        /*
         * System directories (e.g., /etc/caddy) must be traversable by service
         * users.
         */
        file::ensure_dir_mode(self.log, path, 0o755)
    }

    /**
     * Copy a file over another.  The destination keeps the mode it had, or
     * gets 0644 if it is new, rather than taking the mode of the source (e.g.,
     * a 0600 temporary file).
     */
    pub fn copy(&self, from: &str, to: &str) -> Result<()> {
        if self.dry_run {
            info!(self.log, "dry-run: copy {} -> {}", from, to);
            return Ok(());
        }

        info!(self.log, "copy {} -> {}", from, to);
        let mode = std::fs::metadata(to)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644);
        std::fs::copy(from, to)
            .with_context(|| format!("copy {} -> {}", from, to))?;
        file::set_mode(to, mode)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        if self.dry_run {
            info!(self.log, "dry-run: remove {}", path);
            return Ok(());
        }

        info!(self.log, "remove {}", path);
        std::fs::remove_file(path).with_context(|| format!("remove {}", path))
    }

    /**
     * Ask the operator a yes/no question.  The default answer is no.  With
     * --force the answer is always yes.  In a dry run nothing destructive will
     * happen, so we proceed without asking in order to show the full plan.
     */
    pub fn confirm(&self, question: &str) -> Result<bool> {
        if self.assume_yes {
            info!(self.log, "{} [forced yes]", question);
            return Ok(true);
        }
        if self.dry_run {
            info!(self.log, "{} [dry-run, assuming yes]", question);
            return Ok(true);
        }

        if !atty::is(atty::Stream::Stdin) {
            warn!(self.log, "{} [no terminal, assuming no]", question);
            return Ok(false);
        }

        let mut stderr = std::io::stderr();
        write!(stderr, "{} [y/N] ", question)?;
        stderr.flush()?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(is_yes(&answer))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
