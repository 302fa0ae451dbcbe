//! The local content-addressed store backing the snapshot client.
//!
//! Three zones live under the store root (`~/.cache/debsnap` by
//! default):
//!
//! * `by-hash/<sha1>` — raw file bytes, written once, trusted only
//!   while their size matches the manifest.
//! * `archive/<archive>/<path>/<name>` — hard links into `by-hash`,
//!   reconstructing the pool layout so `dpkg-source` finds a dsc's
//!   components next to it.
//! * `json/<name>` — cached API responses with a per-file freshness
//!   policy.

use sha1::Digest;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// The streamed bytes did not hash to the announced value.
    HashMismatch {
        expected: String,
        actual: String,
    },
    /// The streamed bytes had the wrong length.
    SizeMismatch {
        hash: String,
        expected: u64,
        actual: u64,
    },
    /// A mirror path already exists and is not a link to the by-hash
    /// entry it should point at.
    MirrorCollision(PathBuf),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {} but got {}", expected, actual)
            }
            Error::SizeMismatch {
                hash,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for {}: expected {} bytes, got {}",
                hash, expected, actual
            ),
            Error::MirrorCollision(path) => {
                write!(f, "mirror path {} exists with different content", path.display())
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

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Resolve the default store root, honoring `XDG_CACHE_HOME`.
pub fn default_root() -> PathBuf {
    let cache_home = if let Ok(xdg_cache_home) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache_home)
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".cache")
    } else {
        PathBuf::from(".cache")
    };
    cache_home.join("debsnap")
}

impl Store {
    /// Open a store, creating its zones if absent.
    pub fn open(root: PathBuf) -> Result<Self, Error> {
        for zone in ["by-hash", "archive", "json"] {
            fs::create_dir_all(root.join(zone))?;
        }
        Ok(Store { root })
    }

    /// The by-hash path of a blob.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("by-hash").join(hash)
    }

    /// Whether a blob is present and of the expected size. An entry of
    /// the wrong size is deleted so the caller re-fetches it.
    pub fn has_blob(&self, hash: &str, size: u64) -> Result<bool, Error> {
        let path = self.blob_path(hash);
        match fs::metadata(&path) {
            Ok(md) if md.len() == size => Ok(true),
            Ok(md) => {
                log::warn!(
                    "cached {} has size {}, expected {}; refetching",
                    hash,
                    md.len(),
                    size
                );
                fs::remove_file(&path)?;
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream a blob into the store. The bytes are hashed while they
    /// are written to a temporary; only a verified blob is renamed into
    /// place, so a crash or mismatch never leaves a bad by-hash entry.
    pub fn ingest_blob<R: Read>(
        &self,
        hash: &str,
        size: u64,
        reader: &mut R,
    ) -> Result<PathBuf, Error> {
        let final_path = self.blob_path(hash);
        let tmp_path = self.root.join("by-hash").join(format!(".tmp-{}", hash));
        let result = self.stream_to(&tmp_path, hash, size, reader);
        match result {
            Ok(()) => {
                fs::rename(&tmp_path, &final_path)?;
                Ok(final_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn stream_to<R: Read>(
        &self,
        tmp_path: &Path,
        hash: &str,
        size: u64,
        reader: &mut R,
    ) -> Result<(), Error> {
        let mut file = fs::File::create(tmp_path)?;
        let mut hasher = sha1::Sha1::new();
        let mut written = 0u64;
        let mut buf = [0u8; 65536];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            written += n as u64;
        }
        file.flush()?;
        if written != size {
            return Err(Error::SizeMismatch {
                hash: hash.to_owned(),
                expected: size,
                actual: written,
            });
        }
        let actual = hex::encode(hasher.finalize());
        if actual != hash {
            return Err(Error::HashMismatch {
                expected: hash.to_owned(),
                actual,
            });
        }
        Ok(())
    }

    /// Hard-link a blob into the namespaced mirror. An existing link to
    /// the same inode is fine; anything else at that path is fatal.
    pub fn mirror(&self, hash: &str, archive: &str, path: &str, name: &str) -> Result<PathBuf, Error> {
        let blob = self.blob_path(hash);
        let dir = self
            .root
            .join("archive")
            .join(archive)
            .join(path.trim_start_matches('/'));
        fs::create_dir_all(&dir)?;
        let dest = dir.join(name);
        match fs::hard_link(&blob, &dest) {
            Ok(()) => Ok(dest),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let a = fs::metadata(&blob)?;
                let b = fs::metadata(&dest)?;
                if a.dev() == b.dev() && a.ino() == b.ino() {
                    Ok(dest)
                } else {
                    Err(Error::MirrorCollision(dest))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a cached JSON response. `max_age` of `None` means a hit
    /// never goes stale. Corrupt or unreadable cache files are misses.
    pub fn cached_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        max_age: Option<Duration>,
    ) -> Option<T> {
        let path = self.root.join("json").join(name);
        if let Some(max_age) = max_age {
            let modified = fs::metadata(&path).and_then(|md| md.modified()).ok()?;
            match modified.elapsed() {
                Ok(age) if age < max_age => (),
                _ => return None,
            }
        }
        let body = fs::read(&path).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Store a raw JSON response body. Written on miss; hits are never
    /// refreshed.
    pub fn store_json(&self, name: &str, body: &[u8]) -> Result<(), Error> {
        fs::write(self.root.join("json").join(name), body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let td = tempfile::tempdir().unwrap();
        let store = Store::open(td.path().join("cache")).unwrap();
        (td, store)
    }

    // sha1("hello\n")
    const HELLO_SHA1: &str = "f572d396fae9206628714fb2ce00f72e94f2258f";

    #[test]
    fn test_ingest_and_reuse() {
        let (_td, store) = store();
        let path = store
            .ingest_blob(HELLO_SHA1, 6, &mut "hello\n".as_bytes())
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello\n");
        assert!(store.has_blob(HELLO_SHA1, 6).unwrap());
        // A size mismatch on reuse drops the entry.
        assert!(!store.has_blob(HELLO_SHA1, 7).unwrap());
        assert!(!store.blob_path(HELLO_SHA1).exists());
    }

    #[test]
    fn test_ingest_rejects_bad_hash() {
        let (_td, store) = store();
        let err = store
            .ingest_blob(&"0".repeat(40), 6, &mut "hello\n".as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        assert!(!store.blob_path(&"0".repeat(40)).exists());
    }

    #[test]
    fn test_ingest_rejects_short_stream() {
        let (_td, store) = store();
        let err = store
            .ingest_blob(HELLO_SHA1, 600, &mut "hello\n".as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));
    }

    #[test]
    fn test_mirror_tolerates_same_inode() {
        let (_td, store) = store();
        store
            .ingest_blob(HELLO_SHA1, 6, &mut "hello\n".as_bytes())
            .unwrap();
        store
            .mirror(HELLO_SHA1, "debian", "/pool/main/h/hello", "hello_1.0.dsc")
            .unwrap();
        // Linking again is a no-op.
        store
            .mirror(HELLO_SHA1, "debian", "/pool/main/h/hello", "hello_1.0.dsc")
            .unwrap();
    }

    #[test]
    fn test_mirror_rejects_foreign_file() {
        let (_td, store) = store();
        store
            .ingest_blob(HELLO_SHA1, 6, &mut "hello\n".as_bytes())
            .unwrap();
        let dest = store.mirror(HELLO_SHA1, "debian", "pool", "f").unwrap();
        fs::remove_file(&dest).unwrap();
        fs::write(&dest, b"other").unwrap();
        let err = store.mirror(HELLO_SHA1, "debian", "pool", "f").unwrap_err();
        assert!(matches!(err, Error::MirrorCollision(_)));
    }

    #[test]
    fn test_json_cache_round_trip() {
        let (_td, store) = store();
        assert!(store
            .cached_json::<serde_json::Value>("x.json", None)
            .is_none());
        store.store_json("x.json", br#"{"a": 1}"#).unwrap();
        let v: serde_json::Value = store.cached_json("x.json", None).unwrap();
        assert_eq!(v["a"], 1);
        // Fresh enough for a generous max-age, too.
        let v: serde_json::Value = store
            .cached_json("x.json", Some(Duration::from_secs(600)))
            .unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_corrupt_json_is_a_miss() {
        let (_td, store) = store();
        store.store_json("x.json", b"{not json").unwrap();
        assert!(store
            .cached_json::<serde_json::Value>("x.json", None)
            .is_none());
    }
}
