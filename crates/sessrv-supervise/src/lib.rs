//! Persisted worker state: the pidfile and the epitaph file (§6
//! "Persisted state").
//!
//! Small, undesigned wrappers around two POSIX filesystem facts,
//! in the spirit of `ksvc_module::eventfd_notifier`'s thin owned-fd
//! wrapper around a single kernel primitive: no retry policy, no
//! abstraction over the filesystem, just the syscalls the protocol
//! needs and an owned cleanup on `Drop`.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use sessrv_error::{Error, Result};
use sessrv_log::slog_warn;

fn cleanup_sibling(pidfile_path: &Path) -> PathBuf {
    let mut name = pidfile_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".CLEANUP");
    pidfile_path.with_file_name(name)
}

fn errno_result<T>(ok: T, ret: libc::c_int) -> Result<T> {
    if ret == 0 {
        Ok(ok)
    } else {
        Err(Error::Os(std::io::Error::last_os_error()))
    }
}

/// A pidfile created via the link-then-unlink atomic-exclusive-create
/// protocol: the pid is written to a `.CLEANUP`-suffixed sibling file,
/// which is then hard-linked onto the target path. `link(2)` fails
/// with `EEXIST` if the target already exists, so the link is the
/// actual exclusivity check; the write is just staging.
pub struct Pidfile {
    path: PathBuf,
    armed: bool,
}

impl Pidfile {
    /// Claim `path` for `pid`. Fails with `Error::Os` (errno `EEXIST`)
    /// if another live pidfile already occupies `path`.
    pub fn create(path: impl Into<PathBuf>, pid: u32) -> Result<Self> {
        let path = path.into();
        let cleanup = cleanup_sibling(&path);

        let mut f = fs::File::create(&cleanup).map_err(Error::Os)?;
        write!(f, "{pid}\n").map_err(Error::Os)?;
        f.sync_all().map_err(Error::Os)?;
        drop(f);

        let link_result = link_path(&cleanup, &path);
        let _ = fs::remove_file(&cleanup);
        link_result?;

        Ok(Pidfile { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the pidfile now, rather than waiting for `Drop`.
    pub fn remove(mut self) -> Result<()> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        fs::remove_file(&self.path).map_err(Error::Os)
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = self.remove_inner() {
            slog_warn!("pidfile {:?} cleanup failed: {e}", self.path);
        }
    }
}

fn link_path(from: &Path, to: &Path) -> Result<()> {
    let from_c = path_to_cstring(from)?;
    let to_c = path_to_cstring(to)?;
    let ret = unsafe { libc::link(from_c.as_ptr(), to_c.as_ptr()) };
    errno_result((), if ret == 0 { 0 } else { -1 })
}

fn path_to_cstring(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Internal("path contains an interior NUL byte"))
}

/// Write a one-line `<pidfile>.RIP` epitaph: `pid exit_code message`.
/// Called on fatal exit, after the pidfile itself has been (or is
/// about to be) removed, so a supervisor sees the epitaph appear the
/// instant the pidfile disappears.
pub fn write_epitaph(pidfile_path: impl AsRef<Path>, pid: u32, exit_code: i32, message: &str) -> Result<()> {
    let pidfile_path = pidfile_path.as_ref();
    let mut name = pidfile_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".RIP");
    let rip_path = pidfile_path.with_file_name(name);

    let mut f = fs::File::create(&rip_path).map_err(Error::Os)?;
    writeln!(f, "{pid} {exit_code} {message}").map_err(Error::Os)?;
    f.sync_all().map_err(Error::Os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path(label: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "sessrv-supervise-test-{}-{}-{}.pid",
            std::process::id(),
            label,
            n
        ))
    }

    #[test]
    fn create_then_remove_round_trips() {
        let path = scratch_path("roundtrip");
        let pidfile = Pidfile::create(&path, 4242).unwrap();
        assert_eq!(pidfile.path(), path.as_path());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "4242");
        pidfile.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn create_twice_is_exclusive() {
        let path = scratch_path("exclusive");
        let first = Pidfile::create(&path, 1).unwrap();
        let second = Pidfile::create(&path, 2);
        assert!(second.is_err());
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn drop_cleans_up_the_cleanup_sibling() {
        let path = scratch_path("sibling");
        let pidfile = Pidfile::create(&path, 99).unwrap();
        assert!(!cleanup_sibling(&path).exists());
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn epitaph_carries_pid_code_and_message() {
        let path = scratch_path("epitaph");
        let pidfile = Pidfile::create(&path, 7).unwrap();
        write_epitaph(pidfile.path(), 7, 1, "out of memory").unwrap();
        let rip = path.with_file_name(format!(
            "{}.RIP",
            path.file_name().unwrap().to_string_lossy()
        ));
        let contents = fs::read_to_string(&rip).unwrap();
        assert_eq!(contents.trim(), "7 1 out of memory");
        fs::remove_file(&rip).unwrap();
        drop(pidfile);
    }
}
