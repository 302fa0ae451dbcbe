//! Expanding dscs into working trees with `dpkg-source`.
//!
//! Every version gets a fully patched tree for the main branch. A
//! non-native version additionally gets an upstream-only tree, shared
//! across versions with the same `orig_key` so one upstream tarball is
//! only ever exploded once per run.

use crate::source::SourcePackage;
use crate::tags;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// `dpkg-source` exited with a failure status.
    Extract {
        dsc: PathBuf,
        detail: String,
    },
    /// A component named by the dsc has no resolved content hash.
    UnresolvedComponent {
        name: String,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Extract { dsc, detail } => {
                write!(f, "dpkg-source failed on {}: {}", dsc.display(), detail)
            }
            Error::UnresolvedComponent { name } => {
                write!(f, "component {} has no content hash", name)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub struct Unpacker {
    workdir: PathBuf,
    /// orig_key → (orig_mtime, odir): versions sharing an upstream
    /// reuse the first extraction.
    memo: HashMap<Vec<String>, (i64, PathBuf)>,
}

impl Unpacker {
    pub fn new(workdir: &Path) -> Self {
        Unpacker {
            workdir: workdir.to_owned(),
            memo: HashMap::new(),
        }
    }

    /// Expand `src` into its working trees, filling `xdir`, and for
    /// non-native packages `odir`, `orig_mtime` and `orig_key`.
    pub fn unpack(&mut self, src: &mut SourcePackage) -> Result<(), Error> {
        let quoted = tags::quote_tag(&src.version);

        let xdir = self.workdir.join(format!("{}.patched", quoted));
        extract(&src.dsc_path, &xdir, false)?;
        src.xdir = Some(xdir);

        if src.native {
            return Ok(());
        }

        let mut key = vec![];
        let orig_name = src.orig_name.as_ref().expect("non-native has an orig");
        for name in std::iter::once(orig_name).chain(src.comp_names.iter()) {
            match src.file_hashes.get(name) {
                Some(hash) => key.push(hash.clone()),
                None => {
                    return Err(Error::UnresolvedComponent { name: name.clone() });
                }
            }
        }

        if let Some((orig_mtime, odir)) = self.memo.get(&key) {
            log::debug!("reusing upstream tree for {}", src.version);
            src.orig_mtime = Some(*orig_mtime);
            src.odir = Some(odir.clone());
        } else {
            let odir = self.workdir.join(format!("{}.upstream", quoted));
            extract(&src.dsc_path, &odir, true)?;
            let orig_mtime = max_mtime(&odir)?;
            self.memo.insert(key.clone(), (orig_mtime, odir.clone()));
            src.orig_mtime = Some(orig_mtime);
            src.odir = Some(odir);
        }
        src.orig_key = Some(key);
        Ok(())
    }
}

/// Run `dpkg-source -x`. Signature checking already happened at the
/// gate, and `--no-copy` spares a duplicate of every tarball.
fn extract(dsc: &Path, dest: &Path, skip_debianisation: bool) -> Result<(), Error> {
    let mut command = Command::new("dpkg-source");
    command.arg("--no-check").arg("--no-copy");
    if skip_debianisation {
        command.arg("--skip-debianisation");
    }
    let output = command.arg("-x").arg(dsc).arg(dest).output()?;
    if !output.status.success() {
        return Err(Error::Extract {
            dsc: dsc.to_owned(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

/// The newest file mtime underneath a tree, in unix seconds. Used as
/// the commit timestamp for upstream imports. Directory mtimes are
/// left out; they reflect the extraction, not the tarball.
fn max_mtime(dir: &Path) -> Result<i64, Error> {
    let mut newest = 0i64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let md = entry.metadata()?;
        if md.is_dir() {
            newest = newest.max(max_mtime(&entry.path())?);
        } else if let Ok(modified) = md.modified() {
            let dt: chrono::DateTime<chrono::Utc> = modified.into();
            newest = newest.max(dt.timestamp());
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_mtime_picks_newest() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir(td.path().join("sub")).unwrap();
        fs::write(td.path().join("a"), b"x").unwrap();
        fs::write(td.path().join("sub/b"), b"y").unwrap();
        let now: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        let got = max_mtime(td.path()).unwrap();
        assert!((got - now.timestamp()).abs() < 60);
    }
}
