//! Client for the snapshot.debian.org machine-readable API.
//!
//! Two endpoints matter: `/mr/package/<pkg>/` for the version list and
//! `/mr/package/<pkg>/<ver>/srcfiles?fileinfo=1` for the per-version
//! file manifest. File bytes are fetched by content hash from
//! `/file/<hash>` and land in the local [Store].

use crate::sig::SignatureGate;
use crate::source::{self, DscWitness, SourcePackage};
use crate::store::{self, Store};
use debversion::Version;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const SNAPSHOT_URL: &str = "https://snapshot.debian.org";
const USER_AGENT: &str = concat!("git-remote-deb/", env!("CARGO_PKG_VERSION"));
const VERSIONS_MAX_AGE: Duration = Duration::from_secs(600);

/// One entry of the snapshot manifest, resolved to its content hash.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub archive_name: String,
    /// Timestamp in the archive's `YYYYMMDDThhmmssZ` form; the fixed
    /// width makes lexicographic order chronological.
    pub first_seen: String,
    pub name: String,
    pub path: String,
    pub size: u64,
    #[serde(skip)]
    pub hash: String,
}

impl FileInfo {
    /// Upload precedence: the minimum under this key is the
    /// deterministic representative of a set of equivalent files.
    pub fn precedence_key(&self) -> (&str, &str, &str, &str) {
        (&self.first_seen, &self.name, &self.archive_name, &self.path)
    }
}

#[derive(Debug, Deserialize)]
struct VersionList {
    result: Vec<VersionEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    version: Version,
}

#[derive(Debug, Deserialize)]
struct SrcFiles {
    fileinfo: HashMap<String, Vec<FileInfo>>,
}

#[derive(Debug)]
pub enum Error {
    Http { url: String, error: reqwest::Error },
    Status { url: String, status: u16 },
    Decode { url: String, error: serde_json::Error },
    /// 404 on the srcfiles endpoint: the archive has no source for
    /// this version. Warned and dropped by the caller.
    MissingSource { package: String, version: Version },
    /// The version has no dsc among its files. Treated like a missing
    /// source.
    NoDsc { version: Version },
    /// FileInfos sharing one hash disagree on size or extension.
    HeterogeneousFileInfo { hash: String },
    /// One file location was observed with two different hashes.
    PathKeyConflict {
        archive: String,
        path: String,
        name: String,
        old: String,
        new: String,
    },
    /// Two dscs for one version decode to different cleartexts.
    DivergentDscs { version: Version },
    Store(store::Error),
    Signature(crate::sig::Error),
    Source(source::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Http { url, error } => write!(f, "request to {} failed: {}", url, error),
            Error::Status { url, status } => write!(f, "{} returned HTTP {}", url, status),
            Error::Decode { url, error } => write!(f, "cannot decode response from {}: {}", url, error),
            Error::MissingSource { package, version } => {
                write!(f, "no source for {} {} in the snapshot archive", package, version)
            }
            Error::NoDsc { version } => write!(f, "version {} has no dsc file", version),
            Error::HeterogeneousFileInfo { hash } => {
                write!(f, "snapshot metadata for hash {} is inconsistent", hash)
            }
            Error::PathKeyConflict {
                archive,
                path,
                name,
                old,
                new,
            } => write!(
                f,
                "{}:{}/{} observed with two hashes ({} and {})",
                archive, path, name, old, new
            ),
            Error::DivergentDscs { version } => {
                write!(f, "dscs for version {} have divergent contents", version)
            }
            Error::Store(e) => write!(f, "{}", e),
            Error::Signature(e) => write!(f, "{}", e),
            Error::Source(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Error::Store(e)
    }
}

impl From<crate::sig::Error> for Error {
    fn from(e: crate::sig::Error) -> Self {
        Error::Signature(e)
    }
}

impl From<source::Error> for Error {
    fn from(e: source::Error) -> Self {
        Error::Source(e)
    }
}

pub struct SnapshotClient {
    http: reqwest::blocking::Client,
    base: String,
    store: Store,
    /// PathKey → hash; set-exclusive, a second write with a different
    /// hash is a hard error.
    path_keys: HashMap<(String, String, String), String>,
}

impl SnapshotClient {
    pub fn new(base: Option<String>, store: Store) -> Result<Self, Error> {
        let base = base.unwrap_or_else(|| SNAPSHOT_URL.to_owned());
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| Error::Http {
                url: base.clone(),
                error,
            })?;
        Ok(SnapshotClient {
            http,
            base,
            store,
            path_keys: HashMap::new(),
        })
    }

    /// Fetch a JSON endpoint through the response cache.
    fn cached_get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        cache_name: &str,
        max_age: Option<Duration>,
    ) -> Result<T, Error> {
        if let Some(hit) = self.store.cached_json(cache_name, max_age) {
            return Ok(hit);
        }
        let response = self.http.get(url).send().map_err(|error| Error::Http {
            url: url.to_owned(),
            error,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().map_err(|error| Error::Http {
            url: url.to_owned(),
            error,
        })?;
        let decoded = serde_json::from_slice(&body).map_err(|error| Error::Decode {
            url: url.to_owned(),
            error,
        })?;
        self.store.store_json(cache_name, &body)?;
        Ok(decoded)
    }

    /// The version list, latest-first as published by the archive.
    /// The order reflects publication, not Debian version order.
    pub fn list_versions(&self, package: &str) -> Result<Vec<Version>, Error> {
        let url = format!("{}/mr/package/{}/", self.base, package);
        let list: VersionList = self.cached_get(
            &url,
            &format!("{}_versions.json", package),
            Some(VERSIONS_MAX_AGE),
        )?;
        Ok(list.result.into_iter().map(|e| e.version).collect())
    }

    /// Fetch every file of one version into the store, verify its
    /// dsc(s), and build the [SourcePackage].
    pub fn fetch_srcfiles(
        &mut self,
        package: &str,
        version: &Version,
        gate: &SignatureGate,
    ) -> Result<SourcePackage, Error> {
        let url = format!(
            "{}/mr/package/{}/{}/srcfiles?fileinfo=1",
            self.base, package, version
        );
        let manifest: SrcFiles = match self.cached_get(
            &url,
            &format!("{}_{}.srcfiles.json", package, version),
            None,
        ) {
            Ok(m) => m,
            Err(Error::Status { status: 404, .. }) => {
                return Err(Error::MissingSource {
                    package: package.to_owned(),
                    version: version.clone(),
                })
            }
            Err(e) => return Err(e),
        };

        let mut files: Vec<FileInfo> = vec![];
        for (hash, infos) in &manifest.fileinfo {
            check_homogeneous(hash, infos)?;
            for info in infos {
                let key = (
                    info.archive_name.clone(),
                    info.path.clone(),
                    info.name.clone(),
                );
                if let Some(old) = self.path_keys.get(&key) {
                    if old != hash {
                        return Err(Error::PathKeyConflict {
                            archive: key.0,
                            path: key.1,
                            name: key.2,
                            old: old.clone(),
                            new: hash.clone(),
                        });
                    }
                } else {
                    self.path_keys.insert(key, hash.clone());
                }
                let mut info = info.clone();
                info.hash = hash.clone();
                files.push(info);
            }
        }
        files.sort_by(|a, b| a.precedence_key().cmp(&b.precedence_key()));

        // Download each distinct hash once; the precedence sort above
        // makes the representative FileInfo name the download.
        let mut fetched: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for info in &files {
            if !fetched.insert(&info.hash) {
                continue;
            }
            if !self.store.has_blob(&info.hash, info.size)? {
                self.download_blob(&info.hash, info.size, &info.name)?;
            }
        }

        // Materialize the pool layout. Names from other packages are
        // left out: empty compressed placeholders are shared under
        // many names and must not collide in the mirror.
        let mut dsc_path = None;
        let mut file_hashes: HashMap<String, String> = HashMap::new();
        for info in &files {
            if !info.name.starts_with(&format!("{}_", package)) {
                continue;
            }
            let dest =
                self.store
                    .mirror(&info.hash, &info.archive_name, &info.path, &info.name)?;
            file_hashes.entry(info.name.clone()).or_insert_with(|| info.hash.clone());
            if info.name.ends_with(".dsc") && dsc_path.is_none() {
                dsc_path = Some(dest);
            }
        }

        // Verify every distinct dsc and make sure all of them agree.
        let dsc_infos: Vec<&FileInfo> = files
            .iter()
            .filter(|i| i.name.starts_with(&format!("{}_", package)) && i.name.ends_with(".dsc"))
            .collect();
        let dsc_path = match dsc_path {
            Some(p) => p,
            None => {
                return Err(Error::NoDsc {
                    version: version.clone(),
                })
            }
        };
        let mut verified: HashMap<&str, (crate::sig::DscSignature, Vec<u8>)> = HashMap::new();
        let mut cleartext: Option<Vec<u8>> = None;
        for info in &dsc_infos {
            if verified.contains_key(info.hash.as_str()) {
                continue;
            }
            let raw = std::fs::read(self.store.blob_path(&info.hash)).map_err(store::Error::Io)?;
            let (sig, text) = gate.verify(&raw)?;
            if let Some(existing) = &cleartext {
                if *existing != text {
                    return Err(Error::DivergentDscs {
                        version: version.clone(),
                    });
                }
            } else {
                cleartext = Some(text);
            }
            verified.insert(&info.hash, (sig, raw));
        }

        let witnesses: Vec<DscWitness> = dsc_infos
            .iter()
            .map(|info| {
                let (sig, raw) = &verified[info.hash.as_str()];
                DscWitness {
                    file: (*info).clone(),
                    raw: raw.clone(),
                    sig: sig.clone(),
                }
            })
            .collect();

        Ok(SourcePackage::new(
            package,
            version.clone(),
            witnesses,
            cleartext.expect("at least one dsc was verified"),
            dsc_path,
            file_hashes,
        )?)
    }

    fn download_blob(&self, hash: &str, size: u64, name: &str) -> Result<(), Error> {
        let url = format!("{}/file/{}", self.base, hash);
        log::info!("downloading {} ({})", name, hash);
        let mut response = self.http.get(&url).send().map_err(|error| Error::Http {
            url: url.clone(),
            error,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        self.store.ingest_blob(hash, size, &mut response)?;
        Ok(())
    }
}

/// All FileInfos of one hash must agree on size and file extension;
/// anything else means the snapshot metadata is corrupt.
fn check_homogeneous(hash: &str, infos: &[FileInfo]) -> Result<(), Error> {
    let mut sizes = infos.iter().map(|i| i.size);
    let mut exts = infos.iter().map(|i| i.name.rsplit('.').next().unwrap_or(""));
    let size = sizes.next();
    let ext = exts.next();
    if sizes.any(|s| Some(s) != size) || exts.any(|e| Some(e) != ext) {
        return Err(Error::HeterogeneousFileInfo {
            hash: hash.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(first_seen: &str, name: &str, archive: &str, size: u64) -> FileInfo {
        FileInfo {
            archive_name: archive.into(),
            first_seen: first_seen.into(),
            name: name.into(),
            path: "/pool/main/g/gzrt".into(),
            size,
            hash: String::new(),
        }
    }

    #[test]
    fn test_version_list_decoding() {
        let body = br#"{"_comment": "foo", "package": "gzrt",
            "result": [{"version": "0.8-1"}, {"version": "0.5-1"}]}"#;
        let list: VersionList = serde_json::from_slice(body).unwrap();
        let versions: Vec<String> = list.result.iter().map(|e| e.version.to_string()).collect();
        assert_eq!(versions, vec!["0.8-1", "0.5-1"]);
    }

    #[test]
    fn test_srcfiles_decoding_ignores_unknown_fields() {
        let body = br#"{"_comment": "x", "package": "gzrt", "version": "0.8-1",
            "result": [{"hash": "ab"}],
            "fileinfo": {"ab": [{"archive_name": "debian",
                "first_seen": "20080101T000000Z", "name": "gzrt_0.8-1.dsc",
                "path": "/pool/main/g/gzrt", "size": 700, "run": "x"}]}}"#;
        let manifest: SrcFiles = serde_json::from_slice(body).unwrap();
        assert_eq!(manifest.fileinfo["ab"][0].name, "gzrt_0.8-1.dsc");
        assert_eq!(manifest.fileinfo["ab"][0].size, 700);
    }

    #[test]
    fn test_precedence_order() {
        let mut files = vec![
            info("20080101T000000Z", "b.dsc", "debian", 1),
            info("20070101T000000Z", "b.dsc", "debian-archive", 1),
            info("20070101T000000Z", "a.dsc", "debian", 1),
        ];
        files.sort_by(|a, b| a.precedence_key().cmp(&b.precedence_key()));
        assert_eq!(files[0].name, "a.dsc");
        assert_eq!(files[1].archive_name, "debian-archive");
        assert_eq!(files[2].first_seen, "20080101T000000Z");
    }

    #[test]
    fn test_homogeneity() {
        assert!(check_homogeneous(
            "ab",
            &[info("x", "a.gz", "debian", 1), info("y", "b.gz", "ports", 1)]
        )
        .is_ok());
        assert!(check_homogeneous(
            "ab",
            &[info("x", "a.gz", "debian", 1), info("y", "b.gz", "ports", 2)]
        )
        .is_err());
        assert!(check_homogeneous(
            "ab",
            &[info("x", "a.gz", "debian", 1), info("y", "b.bz2", "ports", 1)]
        )
        .is_err());
    }
}
