//! Reading debian/changelog out of an unpacked tree.
//!
//! The importer needs two things from a changelog: the declared
//! version sequence (newest-first) and the newest entry's author and
//! date. Decades-old changelogs are frequently not UTF-8 and sometimes
//! not even well-formed, so the bytes are decoded defensively and a
//! line-level scan backs up the real parser.

use debian_changelog::ChangeLog;
use debversion::Version;
use lazy_regex::{regex_captures, regex_find};
use std::path::Path;

/// Author identity and date of the newest changelog entry.
#[derive(Debug, Clone)]
pub struct Attribution {
    /// `Name <email>`.
    pub ident: String,
    /// Unix seconds.
    pub secs: i64,
    /// Timezone in `+HHMM` form.
    pub tz: String,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Nothing recognizable as a changelog entry was found.
    Unparseable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "cannot read changelog: {}", e),
            Error::Unparseable => write!(f, "changelog has no parsable entries"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// What the importer learns from one changelog.
#[derive(Debug)]
pub struct ChangelogInfo {
    /// Entry versions, newest first. The first one should be the
    /// package's own version.
    pub versions: Vec<Version>,
    /// Author and date of the newest entry, when its trailer parses.
    pub attribution: Option<Attribution>,
}

/// Read `debian/changelog` underneath an unpacked source tree.
pub fn read_package_changelog(xdir: &Path) -> Result<ChangelogInfo, Error> {
    let bytes = std::fs::read(xdir.join("debian").join("changelog"))?;
    parse_changelog(&bytes)
}

fn parse_changelog(bytes: &[u8]) -> Result<ChangelogInfo, Error> {
    let text = decode(bytes);

    let mut versions: Vec<Version> = match ChangeLog::read_relaxed(text.as_bytes()) {
        Ok(cl) => cl.iter().filter_map(|entry| entry.version()).collect(),
        Err(_) => vec![],
    };
    if versions.is_empty() {
        versions = scan_versions(&text);
    }
    if versions.is_empty() {
        return Err(Error::Unparseable);
    }

    Ok(ChangelogInfo {
        attribution: scan_attribution(&text),
        versions,
    })
}

/// Decode changelog bytes: UTF-8 when valid, Latin-1 otherwise. Every
/// byte sequence decodes under Latin-1, so this never fails; it merely
/// garbles truly foreign encodings, which is acceptable for an
/// attribution line.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Line-level fallback: collect versions from anything shaped like an
/// entry header.
fn scan_versions(text: &str) -> Vec<Version> {
    let mut versions = vec![];
    for line in text.lines() {
        if let Some((_, _, version)) = regex_captures!(r"^(\S+) \(([^()\s]+)\)", line) {
            if let Ok(version) = version.parse() {
                versions.push(version);
            }
        }
    }
    versions
}

/// Pull author and date out of the first entry trailer
/// (` -- Name <email>  date`).
fn scan_attribution(text: &str) -> Option<Attribution> {
    for line in text.lines() {
        let Some((_, name, email, date)) =
            regex_captures!(r"^ -- (.*?) <([^<>]*)>\s+(.+?)\s*$", line)
        else {
            continue;
        };
        let date = normalize_date(date);
        let parsed = chrono::DateTime::parse_from_rfc2822(&date).ok()?;
        return Some(Attribution {
            ident: format!("{} <{}>", name.trim(), email),
            secs: parsed.timestamp(),
            tz: parsed.format("%z").to_string(),
        });
    }
    None
}

/// Old changelogs wrote dates in several near-RFC-2822 shapes; strip
/// the most common deviation (a trailing zone name in parentheses).
fn normalize_date(date: &str) -> String {
    match regex_find!(r"\s*\([A-Za-z ]+\)$", date) {
        Some(suffix) => date[..date.len() - suffix.len()].to_owned(),
        None => date.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGELOG: &str = "\
gzrt (0.8-1) unstable; urgency=low

  * New upstream release.

 -- Jane Doe <jane@debian.org>  Mon, 14 Jan 2008 10:00:00 +0100

gzrt (0.5-1) unstable; urgency=low

  * Initial release.

 -- Jane Doe <jane@debian.org>  Tue, 01 May 2007 09:30:00 +0200
";

    #[test]
    fn test_versions_newest_first() {
        let info = parse_changelog(CHANGELOG.as_bytes()).unwrap();
        let versions: Vec<String> = info.versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(versions, vec!["0.8-1", "0.5-1"]);
    }

    #[test]
    fn test_attribution() {
        let info = parse_changelog(CHANGELOG.as_bytes()).unwrap();
        let attribution = info.attribution.unwrap();
        assert_eq!(attribution.ident, "Jane Doe <jane@debian.org>");
        assert_eq!(attribution.tz, "+0100");
        assert_eq!(attribution.secs, 1_200_301_200);
    }

    #[test]
    fn test_latin1_changelog() {
        let mut bytes = CHANGELOG.as_bytes().to_vec();
        // "Jane Doe" -> "Jane Do\xe9", invalid as UTF-8.
        let pos = CHANGELOG.find("Doe <").unwrap() + 2;
        bytes[pos] = 0xe9;
        let info = parse_changelog(&bytes).unwrap();
        assert_eq!(info.versions.len(), 2);
        assert!(info.attribution.unwrap().ident.contains('\u{e9}'));
    }

    #[test]
    fn test_garbage_is_unparseable() {
        assert!(matches!(
            parse_changelog(b"not a changelog at all\n"),
            Err(Error::Unparseable)
        ));
    }

    #[test]
    fn test_scan_versions_fallback() {
        // The line scan recovers the version sequence from entry
        // headers even when the body around them is garbage.
        let text = "pkg (1.2-3) unstable; urgency=low\nbroken body\npkg (1.2-2) unstable;\n";
        let versions: Vec<String> = scan_versions(text).iter().map(|v| v.to_string()).collect();
        assert_eq!(versions, vec!["1.2-3", "1.2-2"]);
    }

    #[test]
    fn test_zone_name_suffix() {
        let text = "\
pkg (1.0-1) unstable; urgency=low

 -- Joe <joe@example.org>  Mon, 14 Jan 2008 10:00:00 +0100 (CET)
";
        let info = parse_changelog(text.as_bytes()).unwrap();
        assert_eq!(info.attribution.unwrap().tz, "+0100");
    }
}
