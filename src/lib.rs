//! Import the complete publication history of a Debian source package
//! into git.
//!
//! The crate backs the `git-remote-deb` remote helper: given
//! `deb::<package>`, it asks snapshot.debian.org for every version
//! ever published, downloads and verifies each signed dsc, unpacks the
//! sources, chains the versions along their changelogs and streams the
//! resulting commit graph to git over the fast-import protocol. The
//! companion binary `deb-fetch-keyrings` provisions the keyrings the
//! signature check needs.

pub mod changelog;
pub mod fastimport;
pub mod git;
pub mod helper;
pub mod history;
pub mod keyrings;
pub mod sig;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod tags;
pub mod unpack;

use snapshot::SnapshotClient;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// The remote address is not a usable `deb::` URL.
    InvalidUrl(String),
    Store(store::Error),
    Snapshot(snapshot::Error),
    Keyrings(keyrings::Error),
    Signature(sig::Error),
    Git(git::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidUrl(detail) => write!(f, "invalid remote URL: {}", detail),
            Error::Store(e) => write!(f, "{}", e),
            Error::Snapshot(e) => write!(f, "{}", e),
            Error::Keyrings(e) => write!(f, "{}", e),
            Error::Signature(e) => write!(f, "{}", e),
            Error::Git(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Error::Store(e)
    }
}

impl From<snapshot::Error> for Error {
    fn from(e: snapshot::Error) -> Self {
        Error::Snapshot(e)
    }
}

impl From<keyrings::Error> for Error {
    fn from(e: keyrings::Error) -> Self {
        Error::Keyrings(e)
    }
}

impl From<sig::Error> for Error {
    fn from(e: sig::Error) -> Self {
        Error::Signature(e)
    }
}

impl From<git::Error> for Error {
    fn from(e: git::Error) -> Self {
        Error::Git(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// The parsed `deb::` remote address:
/// `deb::<package>[?skip=v,…&trust=kid,…&email=kid addr,…]`.
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteUrl {
    pub package: String,
    /// Versions excluded from the working set, in canonical form.
    pub skip: Vec<String>,
    /// 16-hex key ids to accept from the caller's gnupg keyring.
    pub trust: Vec<String>,
    /// Key id → fallback email for identities lacking one.
    pub email: HashMap<String, String>,
}

impl RemoteUrl {
    pub fn parse(address: &str) -> Result<Self, Error> {
        // git hands over either the bare address from `deb::<addr>` or
        // a scheme-qualified URL; normalize both into the latter.
        let candidate = match address.strip_prefix("deb::") {
            Some(rest) => format!("deb:{}", rest),
            None if address.starts_with("deb:") => address.to_owned(),
            None => format!("deb:{}", address),
        };
        let url = url::Url::parse(&candidate)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", address, e)))?;
        if url.host_str().map_or(false, |host| !host.is_empty()) {
            return Err(Error::InvalidUrl(format!(
                "unexpected network location {:?}",
                url.host_str().unwrap_or("")
            )));
        }
        let package = url.path().trim_start_matches('/');
        if package.is_empty() {
            return Err(Error::InvalidUrl("empty package name".to_owned()));
        }
        if !package
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
        {
            return Err(Error::InvalidUrl(format!(
                "{:?} is not a Debian source package name",
                package
            )));
        }

        let mut parsed = RemoteUrl {
            package: package.to_owned(),
            skip: vec![],
            trust: vec![],
            email: HashMap::new(),
        };
        // Repeated keys concatenate with the comma-separated values.
        for (key, value) in url.query_pairs() {
            for item in value.split(',').filter(|i| !i.is_empty()) {
                match key.as_ref() {
                    "skip" => {
                        let version: debversion::Version = item.parse().map_err(|_| {
                            Error::InvalidUrl(format!("unparsable skip version {:?}", item))
                        })?;
                        parsed.skip.push(version.to_string());
                    }
                    "trust" => parsed.trust.push(parse_key_id(item)?),
                    "email" => {
                        let (kid, addr) = item.split_once(' ').ok_or_else(|| {
                            Error::InvalidUrl(format!(
                                "email value {:?} is not \"<keyid> <address>\"",
                                item
                            ))
                        })?;
                        parsed.email.insert(parse_key_id(kid)?, addr.to_owned());
                    }
                    other => {
                        return Err(Error::InvalidUrl(format!("unknown query key {:?}", other)))
                    }
                }
            }
        }
        Ok(parsed)
    }
}

fn parse_key_id(item: &str) -> Result<String, Error> {
    if item.len() == 16 && item.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(item.to_ascii_uppercase())
    } else {
        Err(Error::InvalidUrl(format!(
            "{:?} is not a 16-hex key id",
            item
        )))
    }
}

/// Everything one import run needs, built once by the binary at
/// startup and threaded through builder and emitter.
pub struct RunContext {
    pub package: String,
    pub remote: String,
    /// Canonical version strings to leave out of the working set.
    pub skip: HashSet<String>,
    /// Depth from `option depth`, set by the shim before the import.
    pub depth: Option<usize>,
    pub snapshot: SnapshotClient,
    pub gate: sig::SignatureGate,
    pub unpacker: unpack::Unpacker,
    pub git: git::GitRepo,
    workdir: tempfile::TempDir,
}

impl RunContext {
    pub fn new(remote: &str, address: &str) -> Result<Self, Error> {
        let url = RemoteUrl::parse(address)?;
        let workdir = tempfile::tempdir()?;

        let mut keyring_set = keyrings::load_keyrings(&keyrings::default_keyring_dir())?;
        if !url.trust.is_empty() {
            keyring_set.push(keyrings::export_trust_keyring(&url.trust, workdir.path())?);
        }
        let gate = sig::SignatureGate::new(&keyring_set, url.email)?;

        let store = store::Store::open(store::default_root())?;
        let snapshot = SnapshotClient::new(None, store)?;
        let git = git::GitRepo::open_from_env()?;
        let unpacker = unpack::Unpacker::new(workdir.path());

        Ok(RunContext {
            package: url.package,
            remote: remote.to_owned(),
            skip: url.skip.into_iter().collect(),
            depth: None,
            snapshot,
            gate,
            unpacker,
            git,
            workdir,
        })
    }

    /// The scratch index the emitter materializes trees under; lives
    /// and dies with the run's temporary directory.
    pub fn scratch_index(&self) -> PathBuf {
        self.workdir.path().join("scratch.index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn test_plain_package() {
        let url = RemoteUrl::parse("gzrt").unwrap();
        assert_eq!(url.package, "gzrt");
        assert!(url.skip.is_empty() && url.trust.is_empty() && url.email.is_empty());
    }

    #[test]
    fn test_scheme_prefixes() {
        assert_eq!(RemoteUrl::parse("deb::gzrt").unwrap().package, "gzrt");
        assert_eq!(RemoteUrl::parse("deb:gzrt").unwrap().package, "gzrt");
    }

    #[test]
    fn test_full_query() {
        let url = RemoteUrl::parse(
            "deb::gnupg?skip=1.4.6-2.1&trust=6908386ec98fe2a1&email=6908386EC98FE2A1%20wk%40gnupg.org",
        )
        .unwrap();
        assert_eq!(url.package, "gnupg");
        assert_eq!(url.skip, vec!["1.4.6-2.1"]);
        assert_eq!(url.trust, vec!["6908386EC98FE2A1"]);
        assert_eq!(
            url.email,
            hashmap! { "6908386EC98FE2A1".to_string() => "wk@gnupg.org".to_string() }
        );
    }

    #[test]
    fn test_comma_and_repeat_concatenate() {
        let url = RemoteUrl::parse("deb::sudo?skip=1.6.2p2-2.2,1.6.2p2-1&skip=1.7.0-1").unwrap();
        assert_eq!(url.skip, vec!["1.6.2p2-2.2", "1.6.2p2-1", "1.7.0-1"]);
    }

    #[test]
    fn test_skip_with_epoch() {
        let url = RemoteUrl::parse("deb::x?skip=1%3A1.0-1").unwrap();
        assert_eq!(url.skip, vec!["1:1.0-1"]);
    }

    #[test]
    fn test_rejections() {
        assert!(RemoteUrl::parse("deb::").is_err());
        assert!(RemoteUrl::parse("deb::Has/Slash").is_err());
        assert!(RemoteUrl::parse("deb::gzrt?frob=1").is_err());
        assert!(RemoteUrl::parse("deb::gzrt?trust=xyz").is_err());
        assert!(RemoteUrl::parse("deb::gzrt?email=deadbeef").is_err());
    }
}
