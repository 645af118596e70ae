//! The prefetch session engine (C4): per-session file registration and
//! readahead, backed directly by `open(2)`/`posix_fadvise(2)`/`mmap(2)`/
//! `mlock(2)` rather than a higher-level abstraction, matching how the
//! session this is modeled on talks to the kernel. The syscalls themselves
//! go through `nix`'s typed wrappers rather than raw `libc` calls.

use iorap_protocol::ReadAheadKind;
use nix::fcntl::{open, posix_fadvise, OFlag, PosixFadviseAdvice};
use nix::sys::mman::{mlock, mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Instant;

/// Sentinel used in place of a real fd when `open(2)` fails; subsequent
/// `ReadAhead` calls against the path still get recorded, just always as
/// failures, instead of aborting the session.
const BAD_FD: RawFd = -1;

#[derive(Debug, Clone, Copy)]
struct EntryMapping {
    path_id: u32,
    kind: ReadAheadKind,
    length: u64,
    offset: u64,
    /// Address of the `mmap` region, when `kind` mapped one.
    address: Option<usize>,
    success: bool,
}

struct PathRegistration {
    file_path: String,
    fd: i32,
}

/// One prefetch session: a set of registered file paths plus the readahead
/// entries issued against them, tracked regardless of success so `Dump`
/// reflects the true hit rate.
pub struct Session {
    id: u32,
    description: String,
    paths: HashMap<u32, PathRegistration>,
    entries: HashMap<u32, Vec<EntryMapping>>,
    started_at: Instant,
}

impl Session {
    pub fn new(id: u32, description: String) -> Self {
        Self {
            id,
            description,
            paths: HashMap::new(),
            entries: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// `open(path, O_RDONLY)`. A failed open still records the path with a
    /// bad-fd sentinel so the session keeps functioning; only subsequent
    /// `ReadAhead`s against it are counted as failures.
    pub fn register_file_path(&mut self, path_id: u32, file_path: String) {
        let fd = match open(file_path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => {
                log::warn!("register_file_path: open({file_path}) failed, path_id={path_id}: {e}");
                BAD_FD
            }
        };

        self.paths.insert(path_id, PathRegistration { file_path, fd });
        self.entries.entry(path_id).or_default();
    }

    /// Unmaps every mapping for `path_id` (releasing any `MAP_LOCKED`/
    /// `mlock`-ed pages) and closes its descriptor. No-op if the path isn't
    /// registered, so callers can call this unconditionally during
    /// `DestroySession`.
    pub fn unregister_file_path(&mut self, path_id: u32) {
        if let Some(mappings) = self.entries.remove(&path_id) {
            for mapping in &mappings {
                unmap(mapping);
            }
        }
        if let Some(registration) = self.paths.remove(&path_id) {
            if registration.fd >= 0 {
                if let Err(e) = close(registration.fd) {
                    log::warn!("unregister_file_path: close failed for path_id={path_id}: {e}");
                }
            }
        }
    }

    /// Perform one readahead. Always appends an `EntryMapping`, win or lose,
    /// per §4.4's "Dump reflects both successes and failures".
    pub fn read_ahead(&mut self, path_id: u32, kind: ReadAheadKind, length: u64, offset: u64) -> bool {
        let Some(registration) = self.paths.get(&path_id) else {
            log::error!("read_ahead: no registered path for path_id={path_id}");
            return false;
        };

        let mut mapping = EntryMapping {
            path_id,
            kind,
            length,
            offset,
            address: None,
            success: true,
        };

        if registration.fd < 0 {
            mapping.success = false;
            self.entries.entry(path_id).or_default().push(mapping);
            return false;
        }

        let borrowed_fd = unsafe { BorrowedFd::borrow_raw(registration.fd) };

        match kind {
            ReadAheadKind::Fadvise => {
                if let Err(e) = posix_fadvise(
                    registration.fd,
                    offset as libc::off_t,
                    length as libc::off_t,
                    PosixFadviseAdvice::POSIX_FADV_WILLNEED,
                ) {
                    log::error!("read_ahead: posix_fadvise failed for path_id={path_id}, errno={e}");
                    mapping.success = false;
                }
            }
            ReadAheadKind::MmapLocked | ReadAheadKind::MmapMlock => {
                let need_mlock = kind == ReadAheadKind::MmapMlock;
                let mut flags = MapFlags::MAP_SHARED;
                if !need_mlock {
                    // Best-effort hint; the page can still be faulted in later.
                    flags |= MapFlags::MAP_LOCKED;
                }

                let Some(len) = NonZeroUsize::new(length as usize) else {
                    log::error!("read_ahead: zero-length mmap requested for path_id={path_id}");
                    mapping.success = false;
                    self.entries.entry(path_id).or_default().push(mapping);
                    return false;
                };

                match unsafe {
                    mmap(
                        None,
                        len,
                        ProtFlags::PROT_READ,
                        flags,
                        borrowed_fd,
                        offset as libc::off_t,
                    )
                } {
                    Ok(addr) => {
                        mapping.address = Some(addr.as_ptr() as usize);
                        if need_mlock {
                            if let Err(e) = unsafe { mlock(addr, len.get()) } {
                                log::error!("read_ahead: mlock failed for path_id={path_id}: {e}");
                                mapping.success = false;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("read_ahead: mmap failed for path_id={path_id}: {e}");
                        mapping.success = false;
                    }
                }
            }
        }

        let success = mapping.success;
        self.entries.entry(path_id).or_default().push(mapping);
        success
    }

    /// Per-path and aggregate statistics (§4.4 "DumpSession").
    pub fn dump(&self) -> String {
        let path_count = self.paths.len();
        let good_fds = self.paths.values().filter(|p| p.fd >= 0).count();
        let good_fd_rate = percent(good_fds, path_count);

        let mut entry_count = 0usize;
        let mut entry_success = 0usize;
        let mut byte_count = 0u64;
        let mut byte_success = 0u64;
        for mappings in self.entries.values() {
            for m in mappings {
                entry_count += 1;
                byte_count += m.length;
                if m.success {
                    entry_success += 1;
                    byte_success += m.length;
                }
            }
        }

        format!(
            "Session(id={}, description={:?}, duration={:?}, paths={} (good fd: {:.1}%), \
             entries={} (ok: {:.1}%), bytes={} (ok: {:.1}%))",
            self.id,
            self.description,
            self.started_at.elapsed(),
            path_count,
            good_fd_rate,
            entry_count,
            percent(entry_success, entry_count),
            byte_count,
            percent(byte_success as usize, byte_count as usize),
        )
    }
}

fn percent(n: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        n as f64 * 100.0 / total as f64
    }
}

fn unmap(mapping: &EntryMapping) {
    if let Some(addr) = mapping.address {
        let Some(ptr) = std::ptr::NonNull::new(addr as *mut std::ffi::c_void) else {
            return;
        };
        if let Err(e) = unsafe { munmap(ptr, mapping.length as usize) } {
            log::warn!("unmap: munmap failed for address {addr:#x}: {e}");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let path_ids: Vec<u32> = self.paths.keys().copied().collect();
        for path_id in path_ids {
            self.unregister_file_path(path_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn register_missing_path_is_bad_fd_but_not_fatal() {
        let mut session = Session::new(1, "test".to_string());
        session.register_file_path(0, "/definitely/not/a/real/path".to_string());
        let ok = session.read_ahead(0, ReadAheadKind::Fadvise, 4096, 0);
        assert!(!ok);
        assert!(session.dump().contains("good fd: 0.0%"));
    }

    #[test]
    fn fadvise_readahead_on_real_file_succeeds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 8192]).unwrap();

        let mut session = Session::new(1, "test".to_string());
        session.register_file_path(0, file.path().to_string_lossy().into_owned());
        let ok = session.read_ahead(0, ReadAheadKind::Fadvise, 4096, 0);
        assert!(ok);
    }

    #[test]
    fn unregister_closes_fd_and_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let mut session = Session::new(1, "test".to_string());
        session.register_file_path(0, file.path().to_string_lossy().into_owned());
        session.unregister_file_path(0);
        session.unregister_file_path(0); // idempotent
    }

    #[test]
    fn mmap_locked_readahead_succeeds_and_unregister_unmaps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; 4096]).unwrap();

        let mut session = Session::new(1, "test".to_string());
        session.register_file_path(0, file.path().to_string_lossy().into_owned());
        let ok = session.read_ahead(0, ReadAheadKind::MmapLocked, 4096, 0);
        assert!(ok);
        session.unregister_file_path(0);
    }

    #[test]
    fn dump_reports_zero_entries_without_dividing_by_zero() {
        let session = Session::new(1, "empty".to_string());
        let text = session.dump();
        assert!(text.contains("entries=0"));
    }
}
