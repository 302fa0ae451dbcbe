//! The source package model: one record per distinct version.

use crate::changelog::Attribution;
use crate::sig::DscSignature;
use crate::snapshot::FileInfo;
use crate::tags;
use debversion::Version;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// The dsc cleartext has no parsable Files field.
    NoFiles { version: Version },
    /// A component file name contains a path separator.
    UnsafeName { name: String },
    /// A component file name does not match any of the permitted
    /// patterns for this package and version.
    BadName { version: Version, name: String },
    /// A non-native package without exactly one orig tarball.
    BadOrigSet { version: Version, count: usize },
    /// A non-native package without a Debian delta component.
    NoDelta { version: Version },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NoFiles { version } => {
                write!(f, "dsc for {} lists no component files", version)
            }
            Error::UnsafeName { name } => {
                write!(f, "component name {:?} contains a path separator", name)
            }
            Error::BadName { version, name } => {
                write!(f, "component {:?} does not belong to version {}", name, version)
            }
            Error::BadOrigSet { version, count } => {
                write!(f, "version {} has {} orig tarballs, expected 1", version, count)
            }
            Error::NoDelta { version } => {
                write!(f, "non-native version {} has no Debian delta component", version)
            }
        }
    }
}

impl std::error::Error for Error {}

/// One dsc file witnessing a version: where the archive stored it, the
/// raw clear-signed bytes, and the gate's verdict on them.
#[derive(Debug, Clone)]
pub struct DscWitness {
    pub file: FileInfo,
    pub raw: Vec<u8>,
    pub sig: DscSignature,
}

/// A source package revision, accreting state as it moves through the
/// pipeline: manifest and signatures from the snapshot client,
/// working trees from the unpacker, attribution and predecessor from
/// the changelog pass.
#[derive(Debug)]
pub struct SourcePackage {
    pub package: String,
    pub version: Version,
    /// Every dsc witnessing this version, in upload-precedence order.
    pub witnesses: Vec<DscWitness>,
    /// The verified dsc cleartext.
    pub cleartext: Vec<u8>,
    /// Mirrored path of the representative dsc, with its components
    /// alongside.
    pub dsc_path: PathBuf,
    /// All component file names from the Files field.
    pub components: Vec<String>,
    /// Component name → content hash, by upload precedence.
    pub file_hashes: HashMap<String, String>,
    pub native: bool,
    /// Set when the package is structurally odd but still importable.
    pub malformed: Option<String>,
    pub orig_name: Option<String>,
    pub comp_names: Vec<String>,

    // Filled in by the unpacker.
    pub xdir: Option<PathBuf>,
    pub odir: Option<PathBuf>,
    pub orig_mtime: Option<i64>,
    pub orig_key: Option<Vec<String>>,

    // Filled in by the history pass.
    pub attribution: Option<Attribution>,
}

impl SourcePackage {
    pub fn new(
        package: &str,
        version: Version,
        witnesses: Vec<DscWitness>,
        cleartext: Vec<u8>,
        dsc_path: PathBuf,
        file_hashes: HashMap<String, String>,
    ) -> Result<Self, Error> {
        let components = parse_files_field(&cleartext);
        if components.is_empty() {
            return Err(Error::NoFiles { version });
        }
        let mut sp = SourcePackage {
            package: package.to_owned(),
            version,
            witnesses,
            cleartext,
            dsc_path,
            components,
            file_hashes,
            native: false,
            malformed: None,
            orig_name: None,
            comp_names: vec![],
            xdir: None,
            odir: None,
            orig_mtime: None,
            orig_key: None,
            attribution: None,
        };
        sp.classify()?;
        Ok(sp)
    }

    /// Classify as native or non-native and enforce the component name
    /// discipline.
    fn classify(&mut self) -> Result<(), Error> {
        for name in &self.components {
            if name.contains('/') {
                return Err(Error::UnsafeName { name: name.clone() });
            }
        }

        let epochless = tags::epochless(&self.version);
        let upstream = self.version.upstream_version.clone();

        if self.components.len() == 1 {
            self.native = true;
            let name = &self.components[0];
            let expected = format!("{}_{}.tar.", self.package, epochless);
            if !(name.starts_with(&expected) && is_ext(&name[expected.len()..])) {
                return Err(Error::BadName {
                    version: self.version.clone(),
                    name: name.clone(),
                });
            }
            if epochless.contains('-') {
                self.malformed = Some("native package with a Debian revision".to_owned());
            }
            return Ok(());
        }

        let no_revision = self.version.debian_revision.is_none();
        if no_revision {
            self.malformed = Some("non-native package without a Debian revision".to_owned());
        }

        let orig_prefix = format!("{}_{}.orig.", self.package, upstream);
        let comp_prefix = format!("{}_{}.orig-", self.package, upstream);
        let delta_prefix = format!("{}_{}.", self.package, epochless);
        // Fallback orig name for revisionless non-native packages; the
        // orig/delta split is then up to dpkg-source.
        let bare_prefix = format!("{}_{}.tar.", self.package, upstream);

        let mut origs = vec![];
        let mut deltas = 0usize;
        for name in &self.components {
            if let Some(rest) = name.strip_prefix(&comp_prefix) {
                if rest.contains('.') && is_ext(rest.splitn(2, '.').nth(1).unwrap_or("")) {
                    self.comp_names.push(name.clone());
                    continue;
                }
            }
            if let Some(rest) = name.strip_prefix(&orig_prefix) {
                if is_ext(rest) {
                    origs.push(name.clone());
                    continue;
                }
            }
            if let Some(rest) = name.strip_prefix(&delta_prefix) {
                if rest
                    .strip_prefix("diff.")
                    .or_else(|| rest.strip_prefix("debian.tar."))
                    .map(is_ext)
                    .unwrap_or(false)
                {
                    deltas += 1;
                    continue;
                }
            }
            if no_revision {
                if let Some(rest) = name.strip_prefix(&bare_prefix) {
                    if is_ext(rest) {
                        origs.push(name.clone());
                        continue;
                    }
                }
            }
            return Err(Error::BadName {
                version: self.version.clone(),
                name: name.clone(),
            });
        }

        if origs.len() != 1 {
            return Err(Error::BadOrigSet {
                version: self.version.clone(),
                count: origs.len(),
            });
        }
        if deltas == 0 {
            return Err(Error::NoDelta {
                version: self.version.clone(),
            });
        }
        self.comp_names.sort();
        self.orig_name = Some(origs.remove(0));
        Ok(())
    }
}

/// Whether a file name remainder looks like a tarball/compression
/// suffix (`gz`, `tar.xz`, ...).
fn is_ext(rest: &str) -> bool {
    !rest.is_empty()
        && !rest.starts_with('.')
        && !rest.ends_with('.')
        && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}

/// Pull the component file names out of a dsc cleartext's Files field.
/// Each continuation line is `<md5> <size> <name>`.
fn parse_files_field(cleartext: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(cleartext);
    let mut names = vec![];
    let mut in_files = false;
    for line in text.lines() {
        if line.starts_with("Files:") {
            in_files = true;
            continue;
        }
        if in_files {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(name) = line.split_whitespace().nth(2) {
                    names.push(name.to_owned());
                }
            } else if !line.trim().is_empty() {
                in_files = false;
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::SigStatus;

    const DSC: &str = "\
Format: 1.0
Source: gzrt
Version: 0.8-1
Files:
 0123456789abcdef0123456789abcdef 1000 gzrt_0.8.orig.tar.gz
 fedcba9876543210fedcba9876543210 200 gzrt_0.8-1.diff.gz
";

    fn witness() -> DscWitness {
        DscWitness {
            file: FileInfo {
                archive_name: "debian".into(),
                first_seen: "20080101T000000Z".into(),
                name: "gzrt_0.8-1.dsc".into(),
                path: "/pool/main/g/gzrt".into(),
                size: 700,
                hash: "a".repeat(40),
            },
            raw: DSC.into(),
            sig: DscSignature {
                keyring: "debian-keyring".into(),
                key_id: "0123456789ABCDEF".into(),
                signer_name: Some("Jane Doe".into()),
                signer_email: "jane@debian.org".into(),
                time: 1_200_000_000,
                status: SigStatus::Good,
            },
        }
    }

    fn build(package: &str, version: &str, dsc: &str) -> Result<SourcePackage, Error> {
        SourcePackage::new(
            package,
            version.parse().unwrap(),
            vec![witness()],
            dsc.as_bytes().to_vec(),
            PathBuf::from("/nonexistent"),
            HashMap::new(),
        )
    }

    #[test]
    fn test_parse_files_field() {
        assert_eq!(
            parse_files_field(DSC.as_bytes()),
            vec!["gzrt_0.8.orig.tar.gz", "gzrt_0.8-1.diff.gz"]
        );
    }

    #[test]
    fn test_non_native() {
        let sp = build("gzrt", "0.8-1", DSC).unwrap();
        assert!(!sp.native);
        assert_eq!(sp.orig_name.as_deref(), Some("gzrt_0.8.orig.tar.gz"));
        assert!(sp.comp_names.is_empty());
        assert!(sp.malformed.is_none());
    }

    #[test]
    fn test_native() {
        let sp = build(
            "atop",
            "1.23",
            "Files:\n 0123 100 atop_1.23.tar.gz\n",
        )
        .unwrap();
        assert!(sp.native);
        assert!(sp.malformed.is_none());
    }

    #[test]
    fn test_native_with_revision_is_flagged() {
        let sp = build(
            "odd",
            "1.0-1",
            "Files:\n 0123 100 odd_1.0-1.tar.gz\n",
        )
        .unwrap();
        assert!(sp.native);
        assert!(sp.malformed.is_some());
    }

    #[test]
    fn test_component_tarballs() {
        let sp = build(
            "big",
            "2.0-3",
            "Files:\n 01 1 big_2.0.orig.tar.gz\n 02 1 big_2.0.orig-docs.tar.gz\n 03 1 big_2.0-3.debian.tar.xz\n",
        )
        .unwrap();
        assert!(!sp.native);
        assert_eq!(sp.comp_names, vec!["big_2.0.orig-docs.tar.gz"]);
    }

    #[test]
    fn test_epoch_is_ignored_in_names() {
        let sp = build(
            "gnupg",
            "1:1.4.6-2",
            "Files:\n 01 1 gnupg_1.4.6.orig.tar.gz\n 02 1 gnupg_1.4.6-2.diff.gz\n",
        )
        .unwrap();
        assert_eq!(sp.orig_name.as_deref(), Some("gnupg_1.4.6.orig.tar.gz"));
    }

    #[test]
    fn test_foreign_name_is_fatal() {
        let err = build(
            "gzrt",
            "0.8-1",
            "Files:\n 01 1 other_0.8.orig.tar.gz\n 02 1 gzrt_0.8-1.diff.gz\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadName { .. }));
    }

    #[test]
    fn test_path_separator_is_fatal() {
        let err = build(
            "gzrt",
            "0.8-1",
            "Files:\n 01 1 ../evil.tar.gz\n 02 1 gzrt_0.8-1.diff.gz\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsafeName { .. }));
    }

    #[test]
    fn test_revisionless_non_native() {
        let sp = build(
            "atop",
            "1.23",
            "Files:\n 01 1 atop_1.23.tar.gz\n 02 1 atop_1.23.diff.gz\n",
        )
        .unwrap();
        assert!(!sp.native);
        assert!(sp.malformed.is_some());
        assert_eq!(sp.orig_name.as_deref(), Some("atop_1.23.tar.gz"));
    }

    #[test]
    fn test_missing_delta_is_fatal() {
        let err = build(
            "gzrt",
            "0.8-1",
            "Files:\n 01 1 gzrt_0.8.orig.tar.gz\n 02 1 gzrt_0.8.orig-extra.tar.gz\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoDelta { .. }));
    }
}
