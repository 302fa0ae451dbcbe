//! The git remote-helper dialogue on stdin/stdout.
//!
//! git drives the helper with `capabilities`, `option`, `list` and a
//! batch of `import` commands terminated by a blank line. Everything
//! the helper prints before the import batch is dialogue; from the
//! first `import` onwards stdout carries the fast-import stream, which
//! is why `feature done` is printed at that exact moment.

use crate::history;
use crate::RunContext;
use std::io::{BufRead, Write};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A malformed value for a supported option, e.g. a non-positive
    /// depth.
    InvalidOption(String),
    Run(history::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error on helper stream: {}", e),
            Error::InvalidOption(detail) => write!(f, "{}", detail),
            Error::Run(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<history::Error> for Error {
    fn from(e: history::Error) -> Self {
        Error::Run(e)
    }
}

/// The capability advertisement for one package under one remote.
fn capabilities(remote: &str) -> String {
    format!(
        "*import\n*option\n*refspec refs/heads/*:refs/debian/{}/*\n\n",
        remote
    )
}

/// The ref listing: a single branch of unknown value, and HEAD
/// pointing at it.
fn list_refs(package: &str) -> String {
    format!(
        "? refs/heads/{pkg}\n@refs/heads/{pkg} HEAD\n\n",
        pkg = package
    )
}

/// Outcome of an `option` command, in protocol words.
enum OptionReply {
    Ok,
    Unsupported,
    /// Protocol error response; the run aborts after sending it.
    Fatal(String),
}

fn handle_option(depth: &mut Option<usize>, name: &str, value: &str) -> OptionReply {
    match name {
        "depth" => match value.parse::<i64>() {
            Ok(n) if n > 0 => {
                *depth = Some(n as usize);
                OptionReply::Ok
            }
            _ => OptionReply::Fatal(format!("depth must be a positive integer, not {:?}", value)),
        },
        "verbosity" => match value.parse::<i64>() {
            Ok(n) => {
                log::set_max_level(match n {
                    i64::MIN..=0 => log::LevelFilter::Warn,
                    1 => log::LevelFilter::Info,
                    _ => log::LevelFilter::Debug,
                });
                OptionReply::Ok
            }
            Err(_) => OptionReply::Fatal(format!("verbosity must be an integer, not {:?}", value)),
        },
        // Stock git sends this to every helper. Progress means the
        // Info-level import log; an explicit higher verbosity wins.
        "progress" => {
            if value == "true" && log::max_level() < log::LevelFilter::Info {
                log::set_max_level(log::LevelFilter::Info);
            }
            OptionReply::Ok
        }
        _ => OptionReply::Unsupported,
    }
}

/// Serve the dialogue until EOF. Exactly one import per package ref is
/// honored per process; later duplicates are no-ops.
pub fn serve<R: BufRead, W: Write>(
    ctx: &mut RunContext,
    input: R,
    out: &mut W,
) -> Result<(), Error> {
    let own_ref = format!("refs/heads/{}", ctx.package);
    let mut batch: Vec<String> = vec![];
    let mut announced_done = false;
    let mut imported = false;

    for line in input.lines() {
        let line = line?;
        let line = line.trim_end();

        if line.is_empty() {
            if !batch.is_empty() {
                for wanted in std::mem::take(&mut batch) {
                    if wanted != own_ref {
                        log::warn!("ignoring import of unknown ref {}", wanted);
                        continue;
                    }
                    if imported {
                        continue;
                    }
                    history::run(ctx, out)?;
                    imported = true;
                }
                writeln!(out, "done")?;
                out.flush()?;
            }
            continue;
        }

        if line == "capabilities" {
            out.write_all(capabilities(&ctx.remote).as_bytes())?;
            out.flush()?;
        } else if line == "list" {
            out.write_all(list_refs(&ctx.package).as_bytes())?;
            out.flush()?;
        } else if let Some(rest) = line.strip_prefix("option ") {
            let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
            match handle_option(&mut ctx.depth, name, value) {
                OptionReply::Ok => writeln!(out, "ok")?,
                OptionReply::Unsupported => writeln!(out, "unsupported")?,
                OptionReply::Fatal(detail) => {
                    writeln!(out, "error {}", detail)?;
                    out.flush()?;
                    return Err(Error::InvalidOption(detail));
                }
            }
            out.flush()?;
        } else if let Some(wanted) = line.strip_prefix("import ") {
            if !announced_done {
                writeln!(out, "feature done")?;
                out.flush()?;
                announced_done = true;
            }
            batch.push(wanted.to_owned());
        } else {
            log::debug!("ignoring unknown helper command {:?}", line);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert_eq!(
            capabilities("origin"),
            "*import\n*option\n*refspec refs/heads/*:refs/debian/origin/*\n\n"
        );
    }

    #[test]
    fn test_list_refs() {
        assert_eq!(
            list_refs("gzrt"),
            "? refs/heads/gzrt\n@refs/heads/gzrt HEAD\n\n"
        );
    }

    #[test]
    fn test_depth_option() {
        let mut depth = None;
        assert!(matches!(
            handle_option(&mut depth, "depth", "3"),
            OptionReply::Ok
        ));
        assert_eq!(depth, Some(3));
        assert!(matches!(
            handle_option(&mut depth, "depth", "0"),
            OptionReply::Fatal(_)
        ));
        assert!(matches!(
            handle_option(&mut depth, "depth", "-1"),
            OptionReply::Fatal(_)
        ));
        assert!(matches!(
            handle_option(&mut depth, "depth", "many"),
            OptionReply::Fatal(_)
        ));
    }

    #[test]
    fn test_unknown_option_is_unsupported() {
        let mut depth = None;
        assert!(matches!(
            handle_option(&mut depth, "dry-run", "true"),
            OptionReply::Unsupported
        ));
    }

    // One test for everything touching the global log level, so the
    // assertions cannot race each other.
    #[test]
    fn test_progress_and_verbosity_levels() {
        let mut depth = None;
        assert!(matches!(
            handle_option(&mut depth, "progress", "true"),
            OptionReply::Ok
        ));
        assert!(log::max_level() >= log::LevelFilter::Info);
        assert!(matches!(
            handle_option(&mut depth, "verbosity", "2"),
            OptionReply::Ok
        ));
        assert_eq!(log::max_level(), log::LevelFilter::Debug);
        // Progress must not lower an explicitly raised verbosity.
        assert!(matches!(
            handle_option(&mut depth, "progress", "true"),
            OptionReply::Ok
        ));
        assert_eq!(log::max_level(), log::LevelFilter::Debug);
    }
}
