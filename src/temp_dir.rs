//! A scoped, auto-cleaning staging directory used to assemble the files a
//! container or image build needs before they are handed to the daemon.
//!
//! Grounded on the "include a source path at a destination, reject escaping
//! destinations, track what's already there" shape of a host-side staging
//! directory; this crate additionally rejects colliding basenames, which a
//! bare tempdir helper does not need to care about but a build context
//! assembler does (two distinct `run`/`libs` entries must not silently
//! clobber each other).

use std::{
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
};

use stacked_errors::{bail_locationless, Result, StackableErr};
use tracing::{debug, warn};

use crate::misc::random_name;

/// A temporary directory on the host filesystem that is removed when
/// dropped (or explicitly via [`TempResourceDirectory::cleanup`]).
#[derive(Debug)]
pub struct TempResourceDirectory {
    path: PathBuf,
    basenames_copied: HashSet<OsString>,
    cleaned_up: bool,
}

impl TempResourceDirectory {
    /// Creates a fresh, empty directory under the system temp directory.
    pub async fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(random_name("dockyard"));
        tokio::fs::create_dir_all(&path)
            .await
            .stack_err_with_locationless(|| {
                format!("TempResourceDirectory::new() could not create {path:?}")
            })?;
        debug!("created temp resource directory at {path:?}");
        Ok(Self {
            path,
            basenames_copied: HashSet::new(),
            cleaned_up: false,
        })
    }

    /// Absolute path to the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies `source` (a file or directory) into this directory at
    /// `dest_rel`, a path relative to [`path`](Self::path). Rejects `..`
    /// components in `dest_rel` (nothing may escape the staging directory)
    /// and rejects a basename already copied in under a different relative
    /// path (this crate never silently overwrites a previous `include`).
    /// When `executable` is set, the owner/group/other execute bits are
    /// added on the copied file (ignored for directories).
    pub async fn include(
        &mut self,
        source: impl AsRef<Path>,
        dest_rel: impl AsRef<Path>,
        executable: bool,
    ) -> Result<()> {
        let source = source.as_ref();
        let dest_rel = dest_rel.as_ref();
        if dest_rel.components().any(|c| c == std::path::Component::ParentDir) {
            bail_locationless!(
                "TempResourceDirectory::include({source:?}, {dest_rel:?}) -> destination \
                 escapes the staging directory with '..'"
            )
        }
        let basename = dest_rel
            .file_name()
            .stack_err_with_locationless(|| {
                format!("TempResourceDirectory::include({source:?}, {dest_rel:?}) -> no basename")
            })?
            .to_owned();
        if !self.basenames_copied.insert(basename.clone()) {
            bail_locationless!(
                "TempResourceDirectory::include({source:?}, {dest_rel:?}) -> basename {basename:?} \
                 was already included under a different path"
            )
        }

        let dest_abs = self.path.join(dest_rel);
        if let Some(parent) = dest_abs.parent() {
            tokio::fs::create_dir_all(parent).await.stack_err_with_locationless(|| {
                format!("TempResourceDirectory::include -> could not create parent {parent:?}")
            })?;
        }

        let meta = tokio::fs::metadata(source)
            .await
            .stack_err_with_locationless(|| {
                format!("TempResourceDirectory::include -> source {source:?} does not exist")
            })?;
        if meta.is_dir() {
            copy_dir_recursive(source, &dest_abs)
                .await
                .stack_err_with_locationless(|| {
                    format!("TempResourceDirectory::include({source:?}, {dest_rel:?})")
                })?;
        } else {
            tokio::fs::copy(source, &dest_abs)
                .await
                .stack_err_with_locationless(|| {
                    format!("TempResourceDirectory::include({source:?}, {dest_rel:?})")
                })?;
            if executable {
                set_executable(&dest_abs).await.stack_err_with_locationless(|| {
                    format!("TempResourceDirectory::include({source:?}, {dest_rel:?}) -> chmod")
                })?;
            }
        }
        Ok(())
    }

    /// Removes the directory and everything under it. Idempotent; calling
    /// this more than once, or letting `Drop` run afterwards, is a no-op.
    pub async fn cleanup(mut self) -> Result<()> {
        self.cleanup_inner().await
    }

    async fn cleanup_inner(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).stack_err_with_locationless(|| {
                format!("TempResourceDirectory::cleanup() could not remove {:?}", self.path)
            }),
        }
    }
}

impl Drop for TempResourceDirectory {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("leaked temp resource directory {:?}: {e}", self.path);
            }
        }
    }
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst)
            .await
            .stack_err_with_locationless(|| format!("copy_dir_recursive -> create_dir_all({dst:?})"))?;
        let mut entries = tokio::fs::read_dir(src)
            .await
            .stack_err_with_locationless(|| format!("copy_dir_recursive -> read_dir({src:?})"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .stack_err_locationless("copy_dir_recursive -> next_entry")?
        {
            let file_type = entry
                .file_type()
                .await
                .stack_err_locationless("copy_dir_recursive -> file_type")?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&src_path, &dst_path).await?;
            } else {
                tokio::fs::copy(&src_path, &dst_path).await.stack_err_with_locationless(|| {
                    format!("copy_dir_recursive -> copy({src_path:?}, {dst_path:?})")
                })?;
            }
        }
        Ok(())
    })
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path).await.stack()?;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o111);
    tokio::fs::set_permissions(path, perms).await.stack()?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn include_rejects_parent_dir_escape() {
        let mut tmp = TempResourceDirectory::new().await.unwrap();
        let src = tmp.path().join("src_marker");
        tokio::fs::write(&src, b"x").await.unwrap();
        let res = tmp.include(&src, "../escape", false).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn include_rejects_duplicate_basename() {
        let mut tmp = TempResourceDirectory::new().await.unwrap();
        let src_dir = std::env::temp_dir().join(random_name("src"));
        tokio::fs::create_dir_all(&src_dir).await.unwrap();
        let a = src_dir.join("run.sh");
        tokio::fs::write(&a, b"echo a").await.unwrap();
        tmp.include(&a, "a/run.sh", true).await.unwrap();
        let res = tmp.include(&a, "b/run.sh", true).await;
        assert!(res.is_err());
        tokio::fs::remove_dir_all(&src_dir).await.ok();
    }

    #[tokio::test]
    async fn include_copies_file_and_sets_executable() {
        let mut tmp = TempResourceDirectory::new().await.unwrap();
        let src_dir = std::env::temp_dir().join(random_name("src2"));
        tokio::fs::create_dir_all(&src_dir).await.unwrap();
        let src = src_dir.join("run.sh");
        tokio::fs::write(&src, b"echo hi").await.unwrap();
        tmp.include(&src, "bin/run.sh", true).await.unwrap();
        let dest = tmp.path().join("bin/run.sh");
        let contents = tokio::fs::read_to_string(&dest).await.unwrap();
        assert_eq!(contents, "echo hi");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = tokio::fs::metadata(&dest).await.unwrap();
            assert_ne!(meta.permissions().mode() & 0o111, 0);
        }
        tokio::fs::remove_dir_all(&src_dir).await.ok();
    }

    #[tokio::test]
    async fn cleanup_removes_directory() {
        let tmp = TempResourceDirectory::new().await.unwrap();
        let path = tmp.path().to_owned();
        tmp.cleanup().await.unwrap();
        assert!(!path.exists());
    }
}
