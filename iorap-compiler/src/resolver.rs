//! Inode → filename resolution (C2): disk-scan, text-cache, and
//! out-of-process data sources, with an optional `stat(2)` verification
//! pass.

use iorap_core::error::Result;
use iorap_core::inode::{InodeKey, ResolveErrorKind, ResolveResult};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyKind {
    None,
    Stat,
}

/// Where candidate `(inode, filename)` pairs come from.
pub enum DataSource {
    /// Walk `root_directories` and `stat(2)` every file.
    DiskScan { root_directories: Vec<PathBuf> },
    /// Parse a pre-built `"dev ino size filename"` text cache, the format
    /// produced by `system/extras/pagecache/pagecache.py`.
    TextCache { path: PathBuf },
    /// Delegate to an external process implementing the same contract;
    /// modeled as a trait so tests can substitute a fake without forking.
    OutOfProcess(Box<dyn OutOfProcessResolver>),
}

/// Contract for the `kOutOfProcessIpc` mode: a separate process performs
/// the scan and returns results over some transport. Not spawned by this
/// crate directly (spec places the RPC layer out of scope); `iorapd` wires
/// a real implementation in.
pub trait OutOfProcessResolver: Send + Sync {
    fn resolve_all(&self) -> Result<Vec<(InodeKey, String)>>;
}

/// Parse one text-cache line: `"$device_number $inode $filesize $filename"`.
/// Leading whitespace on the filename is trimmed (the format always emits
/// at least one separating space); an unparsable or short line is skipped.
fn parse_textcache_line(line: &str) -> Option<(InodeKey, String)> {
    let mut parts = line.splitn(4, char::is_whitespace);
    let dev: u64 = parts.next()?.parse().ok()?;
    let ino: u64 = parts.next()?.parse().ok()?;
    let _size = parts.next()?;
    let filename = parts.next()?.trim_start();
    if filename.is_empty() {
        return None;
    }
    Some((InodeKey::from_dev_ino(dev, ino), filename.to_string()))
}

fn load_textcache(path: &Path) -> Result<HashMap<InodeKey, String>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if let Some((key, name)) = parse_textcache_line(&line) {
            map.insert(key, name);
        }
    }
    Ok(map)
}

fn scan_disk(root_directories: &[PathBuf]) -> Result<HashMap<InodeKey, String>> {
    let mut map = HashMap::new();
    for root in root_directories {
        walk(root, &mut map)?;
    }
    Ok(map)
}

fn walk(dir: &Path, out: &mut HashMap<InodeKey, String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // root may not exist on a given device; skip silently
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.is_dir() {
            walk(&path, out)?;
        } else if metadata.is_file() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                let key = InodeKey::new(
                    ((metadata.dev() >> 8) & 0xfff) as u32,
                    (metadata.dev() & 0xff) as u32,
                    metadata.ino(),
                );
                out.insert(key, path.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

/// Confirms a resolved filename's inode still matches via `stat(2)`. Only
/// meaningful for `VerifyKind::Stat`; `DiskScan` already stats every file
/// during the walk, so this only has work to do for `TextCache` and
/// `OutOfProcess` sources. `Ok(true)` matches, `Ok(false)` is a stale
/// candidate (the path exists but now points at a different inode),
/// `Err(errno)` is a `stat(2)` failure in its own right (e.g. the path no
/// longer exists at all).
fn verify(key: InodeKey, filename: &str) -> std::result::Result<bool, i32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(filename) {
            Ok(metadata) => {
                let found = InodeKey::new(
                    ((metadata.dev() >> 8) & 0xfff) as u32,
                    (metadata.dev() & 0xff) as u32,
                    metadata.ino(),
                );
                Ok(found == key)
            }
            Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (key, filename);
        Ok(true)
    }
}

/// Look a single key up against an already-loaded candidate set and apply
/// verification, producing the per-key outcome `FindFilenamesFromInodes`
/// and `EmitAll` both hand back (spec.md §4.2).
fn resolve_candidate(verify_kind: VerifyKind, name: &str, key: InodeKey) -> ResolveResult {
    if verify_kind == VerifyKind::Stat {
        match verify(key, name) {
            Ok(true) => Ok(name.to_string()),
            Ok(false) => Err(ResolveErrorKind::VerificationFailed),
            Err(errno) => Err(ResolveErrorKind::IoError(errno)),
        }
    } else {
        Ok(name.to_string())
    }
}

pub struct InodeResolver {
    source: DataSource,
    verify_kind: VerifyKind,
}

impl InodeResolver {
    pub fn new(source: DataSource, verify_kind: VerifyKind) -> Self {
        Self { source, verify_kind }
    }

    fn load_candidates(&self) -> Result<HashMap<InodeKey, String>> {
        match &self.source {
            DataSource::DiskScan { root_directories } => scan_disk(root_directories),
            DataSource::TextCache { path } => load_textcache(path),
            DataSource::OutOfProcess(resolver) => {
                Ok(resolver.resolve_all()?.into_iter().collect())
            }
        }
    }

    /// `FindFilenamesFromInodes` (spec.md §4.2): exactly one result per
    /// input inode, in input order. Success carries the resolved path;
    /// failure carries a `ResolveErrorKind` distinguishing an unknown
    /// inode from a candidate that failed verification from a `stat(2)`
    /// error encountered while verifying.
    pub fn resolve(&self, inodes: &[InodeKey]) -> Result<Vec<(InodeKey, ResolveResult)>> {
        let candidates = self.load_candidates()?;
        Ok(inodes
            .iter()
            .map(|&key| {
                let result = match candidates.get(&key) {
                    Some(name) => resolve_candidate(self.verify_kind, name, key),
                    None => Err(ResolveErrorKind::NotFound),
                };
                (key, result)
            })
            .collect())
    }

    /// `EmitAll` (spec.md §4.2): every inode the data source currently
    /// knows about, each run through the same verification the targeted
    /// lookup applies. Diagnostic use only (e.g. `dumpsys --list-inodes`);
    /// never called on the hot compile path.
    pub fn emit_all(&self) -> Result<Vec<(InodeKey, ResolveResult)>> {
        let candidates = self.load_candidates()?;
        Ok(candidates
            .into_iter()
            .map(|(key, name)| {
                let result = resolve_candidate(self.verify_kind, &name, key);
                (key, result)
            })
            .collect())
    }

    pub fn resolve_one(&self, key: InodeKey) -> Result<ResolveResult> {
        let mut results = self.resolve(&[key])?;
        Ok(results.remove(0).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_textcache_line() {
        let line = "2049 1234 4096 /product/app/Foo/Foo.apk";
        let (key, name) = parse_textcache_line(line).unwrap();
        assert_eq!(key.inode, 1234);
        assert_eq!(name, "/product/app/Foo/Foo.apk");
    }

    #[test]
    fn ignores_blank_filename() {
        assert!(parse_textcache_line("2049 1234 4096 ").is_none());
        assert!(parse_textcache_line("garbage").is_none());
    }

    #[test]
    fn resolves_from_textcache_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textcache");
        std::fs::write(
            &path,
            "2049 1234 4096 /product/app/Foo/Foo.apk\n2049 5678 10 /system/lib/libc.so\n",
        )
        .unwrap();

        let resolver = InodeResolver::new(
            DataSource::TextCache { path },
            VerifyKind::None,
        );
        let key = InodeKey::from_dev_ino(2049, 1234);
        let resolved = resolver.resolve(&[key]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].0, key);
        assert_eq!(resolved[0].1.as_deref(), Ok("/product/app/Foo/Foo.apk"));
    }

    #[test]
    fn unresolved_inode_yields_not_found_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textcache");
        std::fs::write(&path, "2049 1234 4096 /a\n").unwrap();
        let resolver = InodeResolver::new(DataSource::TextCache { path }, VerifyKind::None);
        let missing = InodeKey::from_dev_ino(2049, 9999);
        let resolved = resolver.resolve(&[missing]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, Err(ResolveErrorKind::NotFound));
    }

    #[test]
    fn resolve_emits_exactly_one_result_per_input_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textcache");
        std::fs::write(&path, "2049 1 4096 /a\n").unwrap();
        let resolver = InodeResolver::new(DataSource::TextCache { path }, VerifyKind::None);
        let known = InodeKey::from_dev_ino(2049, 1);
        let unknown = InodeKey::from_dev_ino(2049, 2);
        let resolved = resolver.resolve(&[known, unknown, known]).unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].0, known);
        assert_eq!(resolved[1].0, unknown);
        assert_eq!(resolved[2].0, known);
    }

    #[test]
    fn emit_all_lists_every_known_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textcache");
        std::fs::write(&path, "2049 1 4096 /a\n2049 2 10 /b\n").unwrap();
        let resolver = InodeResolver::new(DataSource::TextCache { path }, VerifyKind::None);
        let mut all = resolver.emit_all().unwrap();
        all.sort_by_key(|(key, _)| key.inode);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.as_deref(), Ok("/a"));
        assert_eq!(all[1].1.as_deref(), Ok("/b"));
    }

    struct FakeOutOfProcess(Vec<(InodeKey, String)>);
    impl OutOfProcessResolver for FakeOutOfProcess {
        fn resolve_all(&self) -> Result<Vec<(InodeKey, String)>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn out_of_process_source_resolves() {
        let key = InodeKey::from_dev_ino(1, 7);
        let resolver = InodeResolver::new(
            DataSource::OutOfProcess(Box::new(FakeOutOfProcess(vec![(key, "/x".to_string())]))),
            VerifyKind::None,
        );
        let resolved = resolver.resolve(&[key]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1.as_deref(), Ok("/x"));
    }
}
