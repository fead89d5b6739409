use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use sandbox::DiskUsageProvider;
use tracing::{info, warn};

use crate::paths::{WorkspacePaths, backup_path};

/// Subtrees never copied when seeding a sandbox: dependency caches and
/// version-control metadata.
pub const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".hg", ".svn", ".next"];

/// A sandbox directory found on disk by [`WorkspaceStore::stale_sandbox_dirs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDir {
    pub user_id: String,
    pub sandbox_id: String,
    pub path: PathBuf,
}

/// Filesystem operations scoped to the workspace root.
pub struct WorkspaceStore {
    paths: WorkspacePaths,
    disk: Arc<dyn DiskUsageProvider>,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf, disk: Arc<dyn DiskUsageProvider>) -> Self {
        Self {
            paths: WorkspacePaths::new(root),
            disk,
        }
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Create `<root>/<user>/sandboxes/<id>` and its parents.
    pub async fn create_sandbox_dir(&self, user_id: &str, sandbox_id: &str) -> io::Result<PathBuf> {
        let path = self.paths.sandbox(user_id, sandbox_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Recursively copy `src` into `dest`, skipping [`IGNORED_DIRS`].
    ///
    /// Returns the number of files copied. A missing `src` is an
    /// `io::ErrorKind::NotFound` error.
    pub async fn copy_workspace(&self, src: &Path, dest: &Path) -> io::Result<u64> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .map_err(io::Error::other)?
    }

    /// Forced recursive removal. Failures are logged, never returned.
    /// Returns `true` when nothing remains at `path`.
    pub async fn remove_sandbox_dir(&self, path: &Path) -> bool {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "sandbox directory removed");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove sandbox directory");
                false
            }
        }
    }

    /// Used space in MB; 0 when it cannot be measured.
    pub async fn disk_usage(&self, path: &Path) -> u64 {
        self.disk.usage_mb(path).await
    }

    /// Move `src` to `dest`, first moving any existing `dest` aside to
    /// `<dest>.backup.<epoch-ms>`.
    ///
    /// Uses `rename(2)`; falls back to copy-and-remove across filesystems.
    /// Returns the backup path, if one was made.
    pub async fn relocate(&self, src: &Path, dest: &Path) -> io::Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(src).await? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("relocate source missing: {}", src.display()),
            ));
        }

        let mut backup = None;
        if tokio::fs::try_exists(dest).await? {
            let aside = backup_path(dest, chrono::Utc::now().timestamp_millis());
            tokio::fs::rename(dest, &aside).await?;
            info!(from = %dest.display(), to = %aside.display(), "existing directory moved aside");
            backup = Some(aside);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let moved = match tokio::fs::rename(src, dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
                self.copy_workspace_all(src, dest).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = moved {
            // Put the previous directory back so the target is left as found.
            if let Some(aside) = &backup
                && let Err(restore_err) = tokio::fs::rename(aside, dest).await
            {
                warn!(backup = %aside.display(), error = %restore_err, "failed to restore backup");
            }
            return Err(e);
        }

        info!(from = %src.display(), to = %dest.display(), "directory relocated");
        Ok(backup)
    }

    /// Full copy (no exclusions) followed by removal of `src`.
    async fn copy_workspace_all(&self, src: &Path, dest: &Path) -> io::Result<()> {
        let from = src.to_path_buf();
        let to = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree_filtered(&from, &to, |_| false))
            .await
            .map_err(io::Error::other)??;
        tokio::fs::remove_dir_all(src).await
    }

    /// Sandbox directories under every user whose modification time is older
    /// than `max_age`.
    pub async fn stale_sandbox_dirs(&self, max_age: Duration) -> Vec<SandboxDir> {
        let mut stale = Vec::new();
        let Ok(mut users) = tokio::fs::read_dir(self.paths.root()).await else {
            return stale;
        };
        let now = SystemTime::now();

        while let Ok(Some(user)) = users.next_entry().await {
            let user_id = user.file_name().to_string_lossy().into_owned();
            let Ok(mut sandboxes) = tokio::fs::read_dir(self.paths.sandboxes(&user_id)).await
            else {
                continue;
            };
            while let Ok(Some(entry)) = sandboxes.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if !meta.is_dir() {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age >= max_age {
                    stale.push(SandboxDir {
                        user_id: user_id.clone(),
                        sandbox_id: entry.file_name().to_string_lossy().into_owned(),
                        path: entry.path(),
                    });
                }
            }
        }
        stale
    }
}

fn is_excluded(name: &OsStr) -> bool {
    IGNORED_DIRS.iter().any(|x| name == OsStr::new(x))
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    copy_tree_filtered(src, dest, is_excluded)
}

/// Iterative recursive copy. Symlinks are recreated, not followed.
fn copy_tree_filtered(src: &Path, dest: &Path, skip: fn(&OsStr) -> bool) -> io::Result<u64> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source workspace missing: {}", src.display()),
        ));
    }

    std::fs::create_dir_all(dest)?;
    let mut copied = 0;
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let name = entry.file_name();
            if skip(&name) {
                continue;
            }
            let file_type = entry.file_type()?;
            let target = to.join(&name);
            if file_type.is_dir() {
                std::fs::create_dir_all(&target)?;
                stack.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
                copied += 1;
            } else {
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct FixedDisk(u64);

    #[async_trait]
    impl DiskUsageProvider for FixedDisk {
        async fn usage_mb(&self, _path: &Path) -> u64 {
            self.0
        }
    }

    fn store(root: &Path) -> WorkspaceStore {
        WorkspaceStore::new(root.to_path_buf(), Arc::new(FixedDisk(7)))
    }

    #[tokio::test]
    async fn create_sandbox_dir_makes_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let path = store.create_sandbox_dir("u1", "sbx-1").await.unwrap();
        assert_eq!(path, tmp.path().join("u1/sandboxes/sbx-1"));
        assert!(path.is_dir());
        // Idempotent.
        store.create_sandbox_dir("u1", "sbx-1").await.unwrap();
    }

    #[tokio::test]
    async fn copy_skips_excluded_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("lib/nested")).unwrap();
        std::fs::create_dir_all(src.join("node_modules/left-pad")).unwrap();
        std::fs::create_dir_all(src.join(".git/objects")).unwrap();
        std::fs::write(src.join("index.js"), "console.log(1)").unwrap();
        std::fs::write(src.join("lib/nested/util.js"), "module.exports = {}").unwrap();
        std::fs::write(src.join("node_modules/left-pad/index.js"), "x").unwrap();
        std::fs::write(src.join(".git/HEAD"), "ref").unwrap();

        let dest = tmp.path().join("dest");
        let copied = store(tmp.path()).copy_workspace(&src, &dest).await.unwrap();

        assert_eq!(copied, 2);
        assert!(dest.join("index.js").is_file());
        assert!(dest.join("lib/nested/util.js").is_file());
        assert!(!dest.join("node_modules").exists());
        assert!(!dest.join(".git").exists());
    }

    #[tokio::test]
    async fn copy_recreates_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        let dest = tmp.path().join("dest");
        store(tmp.path()).copy_workspace(&src, &dest).await.unwrap();

        let link = std::fs::read_link(dest.join("link.txt")).unwrap();
        assert_eq!(link, PathBuf::from("real.txt"));
    }

    #[tokio::test]
    async fn copy_missing_source_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = store(tmp.path())
            .copy_workspace(&tmp.path().join("nope"), &tmp.path().join("dest"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let path = store.create_sandbox_dir("u1", "sbx-1").await.unwrap();
        std::fs::write(path.join("file"), "x").unwrap();

        assert!(store.remove_sandbox_dir(&path).await);
        assert!(!path.exists());
        assert!(store.remove_sandbox_dir(&path).await);
    }

    #[tokio::test]
    async fn disk_usage_delegates_to_provider() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(store(tmp.path()).disk_usage(tmp.path()).await, 7);
    }

    #[tokio::test]
    async fn relocate_moves_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("sbx");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("app.js"), "new").unwrap();
        let dest = tmp.path().join("u1/projects/calc");

        let backup = store(tmp.path()).relocate(&src, &dest).await.unwrap();

        assert!(backup.is_none());
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(dest.join("app.js")).unwrap(), "new");
    }

    #[tokio::test]
    async fn relocate_backs_up_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("sbx");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("app.js"), "new").unwrap();
        let dest = tmp.path().join("calc");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("app.js"), "old").unwrap();

        let backup = store(tmp.path())
            .relocate(&src, &dest)
            .await
            .unwrap()
            .unwrap();

        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("calc.backup."), "backup named {name}");
        assert_eq!(std::fs::read_to_string(backup.join("app.js")).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(dest.join("app.js")).unwrap(), "new");
    }

    #[tokio::test]
    async fn relocate_missing_source_leaves_target_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("calc");
        std::fs::create_dir_all(&dest).unwrap();

        let err = store(tmp.path())
            .relocate(&tmp.path().join("gone"), &dest)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn stale_dirs_respect_age() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.create_sandbox_dir("u1", "sbx-a").await.unwrap();
        store.create_sandbox_dir("u2", "sbx-b").await.unwrap();

        assert!(store.stale_sandbox_dirs(Duration::from_secs(3600)).await.is_empty());

        let mut stale = store.stale_sandbox_dirs(Duration::ZERO).await;
        stale.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        let ids: Vec<_> = stale.iter().map(|d| d.sandbox_id.as_str()).collect();
        assert_eq!(ids, ["sbx-a", "sbx-b"]);
        assert_eq!(stale[0].user_id, "u1");
    }

    #[tokio::test]
    async fn stale_dirs_of_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp.path().join("missing"));
        assert!(store.stale_sandbox_dirs(Duration::ZERO).await.is_empty());
    }
}
