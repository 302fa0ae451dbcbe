//! Subprocess-level access to the host git repository.
//!
//! Only two primitives are needed: resolving an existing tag to a
//! commit (for idempotent re-runs) and turning a working tree into a
//! tree object under a scratch index. Everything else goes through the
//! fast-import stream.

use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// `GIT_DIR` (or `.git`) does not point at a repository.
    NoRepository(PathBuf),
    CommandFailed {
        args: Vec<String>,
        detail: String,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::NoRepository(path) => {
                write!(f, "{} is not a git repository", path.display())
            }
            Error::CommandFailed { args, detail } => {
                write!(f, "git {} failed: {}", args.join(" "), detail)
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

pub struct GitRepo {
    git_dir: PathBuf,
}

impl GitRepo {
    /// Locate the repository the way git hands it to a remote helper:
    /// `GIT_DIR` in the environment, `.git` as a fallback.
    pub fn open_from_env() -> Result<Self, Error> {
        let dir = std::env::var_os("GIT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".git"));
        let git_dir = dir
            .canonicalize()
            .map_err(|_| Error::NoRepository(dir.clone()))?;
        Ok(GitRepo { git_dir })
    }

    #[cfg(test)]
    pub fn at(git_dir: PathBuf) -> Self {
        GitRepo { git_dir }
    }

    fn run(&self, args: &[&str], envs: &[(&str, &Path)], cwd: Option<&Path>) -> Result<String, Error> {
        let mut command = Command::new("git");
        command.arg("--git-dir").arg(&self.git_dir).args(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                args: args.iter().map(|a| a.to_string()).collect(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Resolve a tag name to a commit id, if the tag exists.
    pub fn tag_commit(&self, tag: &str) -> Option<String> {
        let spec = format!("refs/tags/{}^{{commit}}", tag);
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.git_dir)
            .args(["rev-parse", "--verify", "--quiet", &spec])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        (!id.is_empty()).then_some(id)
    }

    /// Write `worktree` as a tree object: empty the scratch index,
    /// stage everything under it, then `write-tree`. Returns the tree
    /// id. The scratch index is reused across calls; `read-tree
    /// --empty` clears out the previous version's entries and fails
    /// loudly if it cannot.
    pub fn write_tree(&self, worktree: &Path, scratch_index: &Path) -> Result<String, Error> {
        self.run(
            &["read-tree", "--empty"],
            &[("GIT_INDEX_FILE", scratch_index)],
            None,
        )?;
        // -f: the imported tree's own gitignore files must not hide
        // anything from the import.
        self.run(
            &["add", "-Af", "."],
            &[
                ("GIT_INDEX_FILE", scratch_index),
                ("GIT_WORK_TREE", worktree),
            ],
            Some(worktree),
        )?;
        self.run(
            &["write-tree"],
            &[("GIT_INDEX_FILE", scratch_index)],
            None,
        )
    }
}
