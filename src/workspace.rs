#![forbid(unsafe_code)]

//! Scratch directories for downloads and uploaded cookie files.
//!
//! Every request that needs disk space acquires its own directory under the
//! configured temp root and holds a [`ScratchDir`] for as long as the files are
//! needed. Dropping the guard removes the directory, whichever way the request
//! ended. The workspace also remembers which directories are live so the
//! periodic sweep only ever deletes leftovers from crashed or killed processes.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Every directory we create starts with this, so the sweep never touches
/// unrelated entries when the temp root is shared.
pub const SCRATCH_PREFIX: &str = "tubegrab-";

const COOKIES_FILE: &str = "cookies.txt";

#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

struct WorkspaceInner {
    root: PathBuf,
    /// File names (not full paths) of live directories, so a relative root
    /// and tempfile's absolutized paths still compare equal.
    active: Mutex<HashSet<OsString>>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(WorkspaceInner {
                root: root.into(),
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Creates the temp root if needed. Called once at startup.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.inner.root)
            .with_context(|| format!("creating {}", self.inner.root.display()))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Creates a fresh, uniquely named directory for one request.
    pub fn acquire(&self, purpose: &str) -> Result<ScratchDir, FetchError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{SCRATCH_PREFIX}{purpose}-"))
            .tempdir_in(&self.inner.root)
            .map_err(|err| FetchError::storage("creating scratch directory", err))?;
        self.inner.active.lock().insert(scratch_key(dir.path()));
        debug!(path = %dir.path().display(), "acquired scratch directory");
        Ok(ScratchDir {
            dir: Some(dir),
            owner: self.inner.clone(),
        })
    }

    /// Number of scratch directories currently held by live requests.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Removes scratch directories that no live request holds and that have
    /// not been modified for at least `stale_after`. Returns how many were
    /// removed. Blocking; run it off the async workers.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        let entries = match fs::read_dir(&self.inner.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(root = %self.inner.root.display(), "could not scan temp root: {err}");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(SCRATCH_PREFIX) {
                continue;
            }
            if self.inner.active.lock().contains(&name) {
                continue;
            }
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < stale_after {
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    removed += 1;
                    info!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        "removed stale scratch directory"
                    );
                }
                Err(err) => warn!(
                    path = %path.display(),
                    "could not remove stale scratch directory: {err}"
                ),
            }
        }
        removed
    }
}

/// A directory owned by exactly one request. Removed on drop.
pub struct ScratchDir {
    dir: Option<TempDir>,
    owner: Arc<WorkspaceInner>,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    /// Drops the guard on tokio's blocking pool when called from inside a
    /// runtime, inline otherwise. The directory stays marked active until it
    /// is actually gone.
    pub fn release(self) -> Option<tokio::task::JoinHandle<()>> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn_blocking(move || drop(self))),
            Err(_) => {
                drop(self);
                None
            }
        }
    }
}

impl std::fmt::Debug for ScratchDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScratchDir").field(&self.path()).finish()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!(path = %path.display(), "released scratch directory"),
            // The sweep retries once the path is no longer marked active.
            Err(err) => warn!(
                path = %path.display(),
                "could not remove scratch directory: {err}"
            ),
        }
        self.owner.active.lock().remove(&scratch_key(&path));
    }
}

fn scratch_key(path: &Path) -> OsString {
    path.file_name().map(OsString::from).unwrap_or_default()
}

/// An uploaded Netscape cookie file, kept in its own scratch directory for as
/// long as the owning probe job lives.
#[derive(Debug)]
pub struct CookieJar {
    path: PathBuf,
    _scratch: ScratchDir,
}

impl CookieJar {
    /// Stores `contents` as `cookies.txt`. The client's file name is ignored.
    pub async fn store(workspace: &Workspace, contents: &[u8]) -> Result<Self, FetchError> {
        let scratch = workspace.acquire("cookies")?;
        let path = scratch.path().join(COOKIES_FILE);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|err| FetchError::storage("writing cookie file", err))?;
        Ok(Self {
            path,
            _scratch: scratch,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_unique_directories_and_drop_removes_them() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());

        let first = workspace.acquire("dl").unwrap();
        let second = workspace.acquire("dl").unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().is_dir());
        assert!(
            first
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tubegrab-dl-")
        );
        assert_eq!(workspace.active_count(), 2);

        let first_path = first.path().to_path_buf();
        fs::write(first_path.join("video.mp4"), b"data").unwrap();
        drop(first);
        assert!(!first_path.exists());
        assert_eq!(workspace.active_count(), 1);

        drop(second);
        assert_eq!(workspace.active_count(), 0);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn acquire_reports_storage_failure_for_missing_root() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path().join("missing"));
        let err = workspace.acquire("dl").unwrap_err();
        assert!(matches!(err, FetchError::Storage { .. }));
        assert_eq!(workspace.active_count(), 0);
    }

    #[test]
    fn prepare_creates_root() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path().join("nested").join("tmp"));
        workspace.prepare().unwrap();
        assert!(workspace.root().is_dir());
        assert!(workspace.acquire("dl").is_ok());
    }

    #[test]
    fn sweep_removes_only_unowned_scratch_directories() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());

        let live = workspace.acquire("dl").unwrap();
        let orphan = root.path().join("tubegrab-dl-orphan");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("partial.mp4.part"), b"x").unwrap();
        let unrelated = root.path().join("someone-else");
        fs::create_dir_all(&unrelated).unwrap();
        let stray_file = root.path().join("tubegrab-note.txt");
        fs::write(&stray_file, b"x").unwrap();

        let removed = workspace.sweep(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
        assert!(live.path().is_dir());
        assert!(unrelated.exists());
        assert!(stray_file.exists());
    }

    #[test]
    fn sweep_keeps_fresh_directories() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let orphan = root.path().join("tubegrab-dl-recent");
        fs::create_dir_all(&orphan).unwrap();

        assert_eq!(workspace.sweep(Duration::from_secs(3600)), 0);
        assert!(orphan.exists());
    }

    #[test]
    fn sweep_tolerates_missing_root() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path().join("missing"));
        assert_eq!(workspace.sweep(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn release_inside_runtime_removes_directory_off_thread() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let scratch = workspace.acquire("dl").unwrap();
        let path = scratch.path().to_path_buf();
        fs::write(path.join("video.mp4"), b"data").unwrap();

        let handle = scratch.release().expect("runtime present");
        handle.await.unwrap();
        assert!(!path.exists());
        assert_eq!(workspace.active_count(), 0);
    }

    #[test]
    fn release_outside_runtime_removes_directory_inline() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let scratch = workspace.acquire("dl").unwrap();
        let path = scratch.path().to_path_buf();

        assert!(scratch.release().is_none());
        assert!(!path.exists());
        assert_eq!(workspace.active_count(), 0);
    }

    #[tokio::test]
    async fn cookie_jar_lives_in_its_own_directory() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());

        let jar = CookieJar::store(&workspace, b"# Netscape HTTP Cookie File\n")
            .await
            .unwrap();
        assert!(jar.path().ends_with("cookies.txt"));
        assert_eq!(
            fs::read_to_string(jar.path()).unwrap(),
            "# Netscape HTTP Cookie File\n"
        );
        let dir = jar.path().parent().unwrap().to_path_buf();
        assert_eq!(workspace.active_count(), 1);

        drop(jar);
        assert!(!dir.exists());
        assert_eq!(workspace.active_count(), 0);
    }
}
