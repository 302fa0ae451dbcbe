//! Writing the fast-import stream.
//!
//! The emitter owns two refs per run: the main branch
//! `refs/debian/<remote>/<pkg>`, grown in graph order, and the
//! upstream branch `refs/upstream/<remote>/<pkg>`, grown by one commit
//! per distinct upstream tarball set. Every main commit is anchored by
//! a lightweight per-version tag and one annotated upload tag per
//! witnessing dsc. Trees are materialized through the host repository
//! first; the stream only ever references tree ids.

use crate::git::{self, GitRepo};
use crate::history::Plan;
use crate::sig::SigStatus;
use crate::source::SourcePackage;
use crate::tags;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Git(git::Error),
    /// A planned version is missing its working tree; an internal
    /// inconsistency between builder and emitter.
    NotUnpacked { version: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "cannot write import stream: {}", e),
            Error::Git(e) => write!(f, "{}", e),
            Error::NotUnpacked { version } => {
                write!(f, "version {} was planned but never unpacked", version)
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

impl From<git::Error> for Error {
    fn from(e: git::Error) -> Self {
        Error::Git(e)
    }
}

/// Committer identity for upstream tarball imports.
const TAR_IMPORTER: &str = "<tar-importer>";
/// Committer identity when a changelog yielded no usable attribution.
const MALFORMED_CHANGELOG: &str = "<malformed-changelog>";

pub struct Emitter<'a, W: Write> {
    out: &'a mut W,
    git: &'a GitRepo,
    scratch_index: PathBuf,
    debian_ref: String,
    upstream_ref: String,
    package: String,
    next_mark: usize,
}

impl<'a, W: Write> Emitter<'a, W> {
    pub fn new(
        out: &'a mut W,
        git: &'a GitRepo,
        scratch_index: PathBuf,
        remote: &str,
        package: &str,
    ) -> Self {
        Emitter {
            out,
            git,
            scratch_index,
            debian_ref: format!("refs/debian/{}/{}", remote, package),
            upstream_ref: format!("refs/upstream/{}/{}", remote, package),
            package: package.to_owned(),
            next_mark: 0,
        }
    }

    fn fresh_mark(&mut self) -> usize {
        self.next_mark += 1;
        self.next_mark
    }

    /// Emit the whole plan: upstream commits first, then main commits
    /// with their tags, then the final branch anchor.
    pub fn emit(
        &mut self,
        plan: &Plan,
        packages: &HashMap<String, SourcePackage>,
    ) -> Result<(), Error> {
        // version → committish, seeded with pre-existing tag commits
        // and extended with marks as commits are written.
        let mut ids: HashMap<String, String> = plan.resolved.clone();

        let upstream_marks = self.emit_upstream_phase(plan, packages)?;

        for vs in &plan.order {
            let sp = packages.get(vs).ok_or_else(|| Error::NotUnpacked {
                version: vs.clone(),
            })?;
            let xdir = sp.xdir.as_ref().ok_or_else(|| Error::NotUnpacked {
                version: vs.clone(),
            })?;
            let tree = self.git.write_tree(xdir, &self.scratch_index)?;
            let mark = self.fresh_mark();
            let quoted = tags::quote_tag(&sp.version);

            let from = plan
                .prev
                .get(vs)
                .filter(|ps| plan.in_window.contains(*ps))
                .and_then(|ps| ids.get(ps))
                .cloned();

            writeln!(self.out, "commit {}", self.debian_ref)?;
            writeln!(self.out, "mark :{}", mark)?;
            match &sp.attribution {
                Some(a) => writeln!(self.out, "committer {} {} {}", a.ident, a.secs, a.tz)?,
                None => writeln!(self.out, "committer {} 0 +0000", MALFORMED_CHANGELOG)?,
            }
            self.data(format!("Import {}", sp.version).as_bytes())?;
            if let Some(from) = from {
                writeln!(self.out, "from {}", from)?;
            }
            if let Some(upstream_mark) = upstream_marks.get(vs) {
                writeln!(self.out, "merge :{}", upstream_mark)?;
            }
            writeln!(self.out, "deleteall")?;
            writeln!(self.out, "M 040000 {} \"\"", tree)?;
            writeln!(self.out)?;
            ids.insert(vs.clone(), format!(":{}", mark));

            writeln!(self.out, "reset refs/tags/{}", quoted)?;
            writeln!(self.out, "from :{}", mark)?;
            writeln!(self.out)?;

            self.emit_upload_tags(sp, &quoted, mark)?;
            self.out.flush()?;
            log::info!("imported {} {}", self.package, sp.version);
        }

        if let Some(newest) = &plan.newest {
            if let Some(id) = ids.get(newest) {
                writeln!(self.out, "reset {}", self.debian_ref)?;
                writeln!(self.out, "from {}", id)?;
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    /// One upstream commit per distinct `orig_key`, in emission order.
    /// Returns the mark each version merges, set only on the first
    /// version owning a key.
    fn emit_upstream_phase(
        &mut self,
        plan: &Plan,
        packages: &HashMap<String, SourcePackage>,
    ) -> Result<HashMap<String, usize>, Error> {
        let mut marks: HashMap<String, usize> = HashMap::new();
        let mut seen: HashSet<&[String]> = HashSet::new();
        for vs in &plan.order {
            let Some(sp) = packages.get(vs) else { continue };
            let (Some(key), Some(odir), Some(orig_mtime)) =
                (sp.orig_key.as_deref(), sp.odir.as_ref(), sp.orig_mtime)
            else {
                continue;
            };
            if !seen.insert(key) {
                continue;
            }
            let tree = self.git.write_tree(odir, &self.scratch_index)?;
            let mark = self.fresh_mark();
            writeln!(self.out, "commit {}", self.upstream_ref)?;
            writeln!(self.out, "mark :{}", mark)?;
            writeln!(self.out, "committer {} {} +0000", TAR_IMPORTER, orig_mtime)?;
            self.data(format!("Import {}", sp.version.upstream_version).as_bytes())?;
            writeln!(self.out, "deleteall")?;
            writeln!(self.out, "M 040000 {} \"\"", tree)?;
            writeln!(self.out)?;
            self.out.flush()?;
            marks.insert(vs.clone(), mark);
        }
        Ok(marks)
    }

    /// Annotated tags carrying the signed dsc, one per witnessing
    /// archive. Duplicate tag names within a version are skipped, so
    /// the upload-precedence-first witness wins.
    fn emit_upload_tags(
        &mut self,
        sp: &SourcePackage,
        quoted: &str,
        mark: usize,
    ) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for witness in &sp.witnesses {
            let name = format!("{}/{}", witness.file.archive_name, quoted);
            if !seen.insert(name.clone()) {
                continue;
            }
            let sig = &witness.sig;
            let mut headline = format!("Upload {}", sp.version);
            if sig.keyring == "local" || sig.status != SigStatus::Good {
                headline.push_str(&format!(
                    " ({}/{} {})",
                    sig.keyring, sig.key_id, sig.status
                ));
            }
            let mut body = headline.into_bytes();
            body.extend_from_slice(b"\n\n");
            body.extend_from_slice(&witness.raw);

            writeln!(self.out, "tag {}", name)?;
            writeln!(self.out, "from :{}", mark)?;
            writeln!(self.out, "tagger {} {} +0000", sig.tagger_ident(), sig.time)?;
            self.data(&body)?;
            writeln!(self.out)?;
        }
        Ok(())
    }

    /// A `data` record: byte-exact length, raw payload, newline.
    fn data(&mut self, payload: &[u8]) -> Result<(), Error> {
        writeln!(self.out, "data {}", payload.len())?;
        self.out.write_all(payload)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::Attribution;
    use crate::sig::DscSignature;
    use crate::snapshot::FileInfo;
    use crate::source::DscWitness;

    fn emitter<'a>(out: &'a mut Vec<u8>, git: &'a GitRepo) -> Emitter<'a, Vec<u8>> {
        Emitter::new(out, git, PathBuf::from("/tmp/index"), "origin", "gzrt")
    }

    fn sample_package() -> SourcePackage {
        let witness = DscWitness {
            file: FileInfo {
                archive_name: "debian".into(),
                first_seen: "20080101T000000Z".into(),
                name: "gzrt_0.8-1.dsc".into(),
                path: "/pool/main/g/gzrt".into(),
                size: 3,
                hash: "ab".into(),
            },
            raw: b"DSC BYTES".to_vec(),
            sig: DscSignature {
                keyring: "debian-keyring".into(),
                key_id: "0123456789ABCDEF".into(),
                signer_name: Some("Jane Doe".into()),
                signer_email: "jane@debian.org".into(),
                time: 1_200_000_000,
                status: SigStatus::Good,
            },
        };
        SourcePackage {
            package: "gzrt".into(),
            version: "0.8-1".parse().unwrap(),
            witnesses: vec![witness],
            cleartext: vec![],
            dsc_path: PathBuf::new(),
            components: vec![],
            file_hashes: HashMap::new(),
            native: false,
            malformed: None,
            orig_name: Some("gzrt_0.8.orig.tar.gz".into()),
            comp_names: vec![],
            xdir: None,
            odir: None,
            orig_mtime: None,
            orig_key: None,
            attribution: Some(Attribution {
                ident: "Jane Doe <jane@debian.org>".into(),
                secs: 1_200_301_200,
                tz: "+0100".into(),
            }),
        }
    }

    #[test]
    fn test_data_record_is_byte_exact() {
        let mut out = vec![];
        let git = GitRepo::at(PathBuf::from("/nonexistent"));
        let mut emitter = emitter(&mut out, &git);
        emitter.data("Import 0.8-1".as_bytes()).unwrap();
        assert_eq!(out, b"data 12\nImport 0.8-1\n");
    }

    #[test]
    fn test_upload_tag_record() {
        let mut out = vec![];
        let git = GitRepo::at(PathBuf::from("/nonexistent"));
        let mut emitter = emitter(&mut out, &git);
        let sp = sample_package();
        emitter.emit_upload_tags(&sp, "0.8-1", 7).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("tag debian/0.8-1\nfrom :7\n"));
        assert!(text.contains("tagger Jane Doe <jane@debian.org> 1200000000 +0000\n"));
        // 12 ("Upload 0.8-1") + 2 + 9 ("DSC BYTES") bytes of body.
        assert!(text.contains("data 23\nUpload 0.8-1\n\nDSC BYTES\n"));
        // A good signature from a distribution keyring is unannotated.
        assert!(!text.contains('('));
    }

    #[test]
    fn test_upload_tag_annotation() {
        let mut out = vec![];
        let git = GitRepo::at(PathBuf::from("/nonexistent"));
        let mut emitter = emitter(&mut out, &git);
        let mut sp = sample_package();
        sp.witnesses[0].sig.keyring = "local".into();
        emitter.emit_upload_tags(&sp, "0.8-1", 7).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Upload 0.8-1 (local/0123456789ABCDEF GOODSIG)\n"));
    }

    #[test]
    fn test_duplicate_upload_tags_are_skipped() {
        let mut out = vec![];
        let git = GitRepo::at(PathBuf::from("/nonexistent"));
        let mut emitter = emitter(&mut out, &git);
        let mut sp = sample_package();
        let mut second = sp.witnesses[0].clone();
        second.file.first_seen = "20080202T000000Z".into();
        sp.witnesses.push(second);
        let mut third = sp.witnesses[0].clone();
        third.file.archive_name = "debian-archive".into();
        sp.witnesses.push(third);
        emitter.emit_upload_tags(&sp, "0.8-1", 7).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("tag debian/0.8-1\n").count(), 1);
        assert_eq!(text.matches("tag debian-archive/0.8-1\n").count(), 1);
    }

    #[test]
    fn test_expired_key_is_annotated() {
        let mut out = vec![];
        let git = GitRepo::at(PathBuf::from("/nonexistent"));
        let mut emitter = emitter(&mut out, &git);
        let mut sp = sample_package();
        sp.witnesses[0].sig.status = SigStatus::ExpiredKey;
        emitter.emit_upload_tags(&sp, "0.8-1", 7).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("(debian-keyring/0123456789ABCDEF EXPKEYSIG)\n"));
    }
}
