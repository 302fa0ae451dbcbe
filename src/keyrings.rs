//! Locating, loading and acquiring the verification keyrings.
//!
//! Keyrings live as flat `.gpg` files under
//! `~/.local/share/public-keyrings/`, installed there by
//! `deb-fetch-keyrings`. A per-run `local` keyring can be added on top
//! from `trust=` key ids, exported out of the caller's default gnupg
//! keyring.

use crate::sig::Keyring;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A subprocess exited with a failure status.
    CommandFailed {
        program: String,
        detail: String,
    },
    /// A pool download failed.
    Http {
        url: String,
        detail: String,
    },
    /// `gpg --export` produced nothing for the requested key ids.
    TrustExportEmpty {
        key_ids: Vec<String>,
    },
    /// The downloaded keyring packages contained no keyring files.
    NoKeyringsInPackages,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::CommandFailed { program, detail } => {
                write!(f, "{} failed: {}", program, detail)
            }
            Error::Http { url, detail } => {
                write!(f, "cannot download {}: {}", url, detail)
            }
            Error::TrustExportEmpty { key_ids } => write!(
                f,
                "gpg exported no keys for {}; are they in your default keyring?",
                key_ids.join(", ")
            ),
            Error::NoKeyringsInPackages => {
                write!(f, "keyring packages contained no usable keyring files")
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

/// The default install directory, honoring `XDG_DATA_HOME`.
pub fn default_keyring_dir() -> PathBuf {
    let data_home = if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".local").join("share")
    } else {
        PathBuf::from(".local/share")
    };
    data_home.join("public-keyrings")
}

/// Enumerate the installed keyrings, sorted by file name. An absent
/// directory is just an empty set; the signature gate turns that into
/// its fatal no-keyrings error with guidance.
pub fn load_keyrings(dir: &Path) -> Result<Vec<Keyring>, Error> {
    let mut keyrings = vec![];
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("gpg") | Some("pgp") => (),
            _ => continue,
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        keyrings.push(Keyring { name, path });
    }
    keyrings.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(keyrings)
}

/// Build the ephemeral `local` keyring from the caller's default gnupg
/// keyring, covering the `trust=` key ids for this run.
pub fn export_trust_keyring(key_ids: &[String], dir: &Path) -> Result<Keyring, Error> {
    let output = Command::new("gpg")
        .arg("--export")
        .args(key_ids)
        .output()?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: "gpg".to_owned(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    if output.stdout.is_empty() {
        return Err(Error::TrustExportEmpty {
            key_ids: key_ids.to_vec(),
        });
    }
    let path = dir.join("local.gpg");
    fs::write(&path, &output.stdout)?;
    Ok(Keyring {
        name: "local".to_owned(),
        path,
    })
}

const KEYRING_PACKAGES: &[&str] = &["debian-archive-keyring", "debian-keyring"];
const POOL_URL: &str = "https://deb.debian.org/debian/pool/main";
const USER_AGENT: &str = concat!("git-remote-deb/", env!("CARGO_PKG_VERSION"));

/// Download the distribution keyring packages and install their
/// keyring files into `target`. Returns the installed paths.
///
/// `apt-get download` gets the package from whatever mirror the host
/// is configured for; hosts without apt fall back to fetching the
/// newest binary package straight from the archive pool.
pub fn fetch_keyrings(target: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(target)?;
    let workdir = tempfile::tempdir()?;
    for package in KEYRING_PACKAGES {
        log::info!("downloading {}", package);
        if let Err(e) = apt_download(package, workdir.path()) {
            log::warn!(
                "apt-get download of {} failed ({}); fetching it from the pool",
                package,
                e
            );
            pool_download(package, workdir.path())?;
        }
    }

    let extract = workdir.path().join("extract");
    for entry in fs::read_dir(workdir.path())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("deb") {
            continue;
        }
        let output = Command::new("dpkg-deb")
            .arg("-x")
            .arg(&path)
            .arg(&extract)
            .output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: "dpkg-deb".to_owned(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
    }

    let mut installed = vec![];
    collect_keyring_files(&extract.join("usr/share/keyrings"), target, &mut installed)?;
    if installed.is_empty() {
        return Err(Error::NoKeyringsInPackages);
    }
    Ok(installed)
}

fn apt_download(package: &str, dest: &Path) -> Result<(), Error> {
    let output = Command::new("apt-get")
        .arg("download")
        .arg(package)
        .current_dir(dest)
        .output()?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: "apt-get download".to_owned(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

/// Fetch the newest `_all.deb` of a package straight from the archive
/// pool, going by the pool directory index.
fn pool_download(package: &str, dest: &Path) -> Result<(), Error> {
    let http = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Http {
            url: POOL_URL.to_owned(),
            detail: e.to_string(),
        })?;
    let dir_url = format!("{}/{}/{}/", POOL_URL, pool_section(package), package);
    let index = http
        .get(&dir_url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| Error::Http {
            url: dir_url.clone(),
            detail: e.to_string(),
        })?;
    let name = newest_pool_deb(package, &index).ok_or_else(|| Error::Http {
        url: dir_url.clone(),
        detail: "no binary package in the pool index".to_owned(),
    })?;
    let url = format!("{}{}", dir_url, name);
    log::info!("downloading {}", url);
    let bytes = http
        .get(&url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| Error::Http {
            url: url.clone(),
            detail: e.to_string(),
        })?;
    fs::write(dest.join(&name), &bytes)?;
    Ok(())
}

/// Pool sharding: `lib*` packages live under their first four letters,
/// everything else under the first one.
fn pool_section(package: &str) -> &str {
    if package.starts_with("lib") && package.len() >= 4 {
        &package[..4]
    } else {
        &package[..1]
    }
}

/// The newest `<package>_<version>_all.deb` named by a pool directory
/// index, by Debian version order.
fn newest_pool_deb(package: &str, index: &str) -> Option<String> {
    let re = lazy_regex::regex!(r"([a-z0-9.+-]+)_([0-9][A-Za-z0-9.+~-]*)_all\.deb");
    let mut best: Option<(debversion::Version, String)> = None;
    for cap in re.captures_iter(index) {
        if &cap[1] != package {
            continue;
        }
        let Ok(version) = cap[2].parse::<debversion::Version>() else {
            continue;
        };
        if best.as_ref().map_or(true, |(b, _)| version > *b) {
            best = Some((version, cap[0].to_string()));
        }
    }
    best.map(|(_, name)| name)
}

fn collect_keyring_files(
    from: &Path,
    target: &Path,
    installed: &mut Vec<PathBuf>,
) -> Result<(), Error> {
    let entries = match fs::read_dir(from) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("gpg") | Some("pgp") => (),
            _ => continue,
        }
        let dest = target.join(path.file_name().expect("keyring file has a name"));
        fs::copy(&path, &dest)?;
        log::info!("installed {}", dest.display());
        installed.push(dest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_keyrings_sorted_and_filtered() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("b-keyring.gpg"), b"x").unwrap();
        fs::write(td.path().join("a-keyring.gpg"), b"x").unwrap();
        fs::write(td.path().join("notes.txt"), b"x").unwrap();
        let keyrings = load_keyrings(td.path()).unwrap();
        let names: Vec<&str> = keyrings.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["a-keyring", "b-keyring"]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let td = tempfile::tempdir().unwrap();
        let keyrings = load_keyrings(&td.path().join("nope")).unwrap();
        assert!(keyrings.is_empty());
    }

    #[test]
    fn test_pool_section() {
        assert_eq!(pool_section("debian-keyring"), "d");
        assert_eq!(pool_section("gzrt"), "g");
        assert_eq!(pool_section("libxml2"), "libx");
    }

    #[test]
    fn test_newest_pool_deb() {
        let index = r#"
<a href="debian-keyring_2022.12.24_all.deb">debian-keyring_2022.12.24_all.deb</a>
<a href="debian-keyring_2024.01.05_all.deb">debian-keyring_2024.01.05_all.deb</a>
<a href="debian-keyring_2023.05.28_all.deb">debian-keyring_2023.05.28_all.deb</a>
<a href="other_9999.9_all.deb">other_9999.9_all.deb</a>
"#;
        assert_eq!(
            newest_pool_deb("debian-keyring", index).as_deref(),
            Some("debian-keyring_2024.01.05_all.deb")
        );
        assert_eq!(newest_pool_deb("absent", index), None);
    }
}
