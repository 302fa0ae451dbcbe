//! Version forms used for tag names and file name matching.

use debversion::Version;

/// Turn a version into its canonical tag form.
///
/// `:` and `~` are not usable in git ref names, so they are mapped to
/// `%` and `_`. Neither replacement character is legal inside a Debian
/// version, which keeps the mapping reversible.
pub fn quote_tag(version: &Version) -> String {
    version.to_string().replace(':', "%").replace('~', "_")
}

/// Reverse [quote_tag].
pub fn unquote_tag(tag: &str) -> Result<Version, <Version as std::str::FromStr>::Err> {
    tag.replace('%', ":").replace('_', "~").parse()
}

/// The version without its epoch, `upstream[-revision]`. This is the
/// form that appears in source package file names.
pub fn epochless(version: &Version) -> String {
    let mut version = version.clone();
    version.epoch = None;
    version.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_tag() {
        let v: Version = "1:1.0-1".parse().unwrap();
        assert_eq!(quote_tag(&v), "1%1.0-1");
        let v: Version = "0.97-16.1~bpo.1".parse().unwrap();
        assert_eq!(quote_tag(&v), "0.97-16.1_bpo.1");
        let v: Version = "2.4.7-1".parse().unwrap();
        assert_eq!(quote_tag(&v), "2.4.7-1");
    }

    #[test]
    fn test_quote_round_trip() {
        for s in [
            "1.0-1",
            "1:1.0-1",
            "0.97-16.1~bpo.1",
            "1:2.30.2-1~bpo10+1",
            "1.23",
        ] {
            let v: Version = s.parse().unwrap();
            assert_eq!(unquote_tag(&quote_tag(&v)).unwrap(), v);
        }
    }

    #[test]
    fn test_epochless() {
        let v: Version = "1:1.4.6-2.1".parse().unwrap();
        assert_eq!(epochless(&v), "1.4.6-2.1");
        let v: Version = "1.23".parse().unwrap();
        assert_eq!(epochless(&v), "1.23");
    }
}
