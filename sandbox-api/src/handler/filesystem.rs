//! Local filesystem backend rooted at the workspace directory.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{DirEntryInfo, DirectoryListing, FileContent, FileSystem, Removed, TreeEntry, TreeListing};
use crate::error::{Result, SandboxError};

pub struct LocalFileSystem {
    workspace: PathBuf,
}

impl LocalFileSystem {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    /// Absolute paths are used as given; relative ones join the workspace.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(SandboxError::invalid("path must not be empty"));
        }
        let p = Path::new(path);
        Ok(if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        })
    }

    fn resolve_or_workspace(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.workspace.clone()
        } else {
            self.resolve(path).unwrap_or_else(|_| self.workspace.clone())
        }
    }
}

fn format_mode(metadata: &Metadata) -> String {
    format!("{:04o}", metadata.permissions().mode() & 0o7777)
}

fn format_mod_time(metadata: &Metadata) -> String {
    metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
        .unwrap_or_default()
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| SandboxError::io(format!("chmod {}", path.display()), e))
}

/// Reject tree entries that would escape their root.
fn checked_relative(rel: &str) -> Result<()> {
    let escapes = Path::new(rel)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if rel.is_empty() || escapes {
        return Err(SandboxError::invalid(format!("invalid relative path '{rel}'")));
    }
    Ok(())
}

fn walk_tree(root: &Path, max_depth: usize) -> Vec<TreeEntry> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("tree walk skipped entry: {e}");
                continue;
            }
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        entries.push(TreeEntry {
            path: display(rel),
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mode: format_mode(&metadata),
            mod_time: format_mod_time(&metadata),
        });
    }
    entries
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn working_directory(&self) -> PathBuf {
        self.workspace.clone()
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        let target = self.resolve_or_workspace(path);
        let metadata = fs::metadata(&target)
            .await
            .map_err(|e| SandboxError::io(format!("stat {}", target.display()), e))?;
        Ok(metadata.is_dir())
    }

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let dir = self.resolve_or_workspace(path);
        let metadata = fs::metadata(&dir)
            .await
            .map_err(|e| SandboxError::io(format!("list {}", dir.display()), e))?;
        if !metadata.is_dir() {
            return Err(SandboxError::Conflict(format!("{} is not a directory", dir.display())));
        }

        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|e| SandboxError::io(format!("list {}", dir.display()), e))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| SandboxError::io(format!("list {}", dir.display()), e))?
        {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Entry vanished between readdir and stat.
                Err(_) => continue,
            };
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                mode: format_mode(&metadata),
                mod_time: format_mod_time(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DirectoryListing {
            path: display(&dir),
            entries,
        })
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let target = self.resolve(path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|e| SandboxError::io(format!("read {}", target.display()), e))?;
        if metadata.is_dir() {
            return Err(SandboxError::Conflict(format!("{} is a directory", target.display())));
        }
        let bytes = fs::read(&target)
            .await
            .map_err(|e| SandboxError::io(format!("read {}", target.display()), e))?;

        Ok(FileContent {
            path: display(&target),
            size: bytes.len() as u64,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            mode: format_mode(&metadata),
        })
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        if self.is_directory(path).await? {
            return Err(SandboxError::Conflict(format!("{} is a directory", target.display())));
        }
        fs::read(&target)
            .await
            .map_err(|e| SandboxError::io(format!("read {}", target.display()), e))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<PathBuf> {
        let target = self.resolve(path)?;
        if let Ok(existing) = fs::metadata(&target).await {
            if existing.is_dir() {
                return Err(SandboxError::Conflict(format!(
                    "{} is an existing directory",
                    target.display()
                )));
            }
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(format!("create parents of {}", target.display()), e))?;
        }
        fs::write(&target, content)
            .await
            .map_err(|e| SandboxError::io(format!("write {}", target.display()), e))?;
        set_mode(&target, mode).await?;

        debug!(path = %target.display(), bytes = content.len(), mode, "File written");
        Ok(target)
    }

    async fn create_directory(&self, path: &str, mode: u32) -> Result<PathBuf> {
        let target = self.resolve(path)?;
        if let Ok(existing) = fs::metadata(&target).await {
            if !existing.is_dir() {
                return Err(SandboxError::Conflict(format!(
                    "{} exists and is not a directory",
                    target.display()
                )));
            }
        }
        fs::create_dir_all(&target)
            .await
            .map_err(|e| SandboxError::io(format!("mkdir {}", target.display()), e))?;
        set_mode(&target, mode).await?;
        Ok(target)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<Removed> {
        let target = self.resolve(path)?;
        let context = || format!("delete {}", target.display());

        // Directory interpretation wins, including for symlinks to directories.
        if let Ok(metadata) = fs::metadata(&target).await {
            if metadata.is_dir() {
                let is_link = fs::symlink_metadata(&target)
                    .await
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                let removed = if is_link {
                    fs::remove_file(&target).await
                } else if recursive {
                    fs::remove_dir_all(&target).await
                } else {
                    fs::remove_dir(&target).await
                };
                removed.map_err(|e| SandboxError::io(context(), e))?;
                return Ok(Removed::Directory);
            }
        }

        match fs::symlink_metadata(&target).await {
            Ok(_) => {
                fs::remove_file(&target)
                    .await
                    .map_err(|e| SandboxError::io(context(), e))?;
                Ok(Removed::File)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SandboxError::NotFound(format!(
                "path {} does not exist",
                target.display()
            ))),
            Err(e) => Err(SandboxError::io(context(), e)),
        }
    }

    async fn tree(&self, path: &str, max_depth: usize) -> Result<TreeListing> {
        let root = self.resolve_or_workspace(path);
        if !self.is_directory(&display(&root)).await? {
            return Err(SandboxError::Conflict(format!("{} is not a directory", root.display())));
        }

        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || walk_tree(&walk_root, max_depth))
            .await
            .map_err(|e| SandboxError::io("tree walk", io::Error::other(e)))?;

        Ok(TreeListing {
            path: display(&root),
            entries,
        })
    }

    async fn write_tree(&self, root: &str, files: &HashMap<String, String>) -> Result<Vec<String>> {
        let mut names: Vec<_> = files.keys().collect();
        names.sort();
        for rel in &names {
            checked_relative(rel)?;
        }

        let root_path = self.resolve_or_workspace(root);
        match fs::metadata(&root_path).await {
            Ok(m) if m.is_dir() => {}
            _ => {
                self.create_directory(&display(&root_path), 0o755).await?;
            }
        }

        let mut written = Vec::with_capacity(files.len());
        for rel in names {
            let target = root_path.join(rel);
            self.write_file(&display(&target), files[rel].as_bytes(), 0o644)
                .await?;
            written.push(display(&target));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path().to_path_buf());
        (dir, fs)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (dir, fs) = setup();
        let path = dir.path().join("x");
        fs.write_file(path.to_str().unwrap(), b"hello", 0o644).await.unwrap();

        let file = fs.read_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(file.content, "hello");
        assert_eq!(file.size, 5);
        assert_eq!(file.mode, "0644");
    }

    #[tokio::test]
    async fn test_relative_paths_resolve_against_workspace() {
        let (dir, fs) = setup();
        fs.write_file("nested/a.txt", b"a", 0o600).await.unwrap();
        assert!(dir.path().join("nested/a.txt").exists());

        let meta = std::fs::metadata(dir.path().join("nested/a.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_empty_path_only_valid_for_listing() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("f"), "1").unwrap();

        let listing = fs.list_directory("").await.unwrap();
        assert_eq!(listing.path, display(dir.path()));
        assert_eq!(listing.entries.len(), 1);

        let err = fs.read_file("").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        let err = fs.write_file("", b"", 0o644).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn test_listing_matches_directory_entries() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let listing = fs.list_directory(dir.path().to_str().unwrap()).await.unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "sub"]);
        assert!(listing.entries[2].is_dir);
        assert_eq!(listing.entries[1].size, 2);
        assert!(!listing.entries[0].mod_time.is_empty());
    }

    #[tokio::test]
    async fn test_writing_over_directory_conflicts() {
        let (dir, fs) = setup();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let err = fs.write_file("d", b"x", 0o644).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_create_directory_applies_mode() {
        let (dir, fs) = setup();
        fs.create_directory("made/deep", 0o755).await.unwrap();
        let meta = std::fs::metadata(dir.path().join("made/deep")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_delete_file_directory_and_missing() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("f"), "1").unwrap();
        std::fs::create_dir_all(dir.path().join("d/inner")).unwrap();

        assert_eq!(fs.delete("f", false).await.unwrap(), Removed::File);

        let err = fs.delete("d", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(fs.delete("d", true).await.unwrap(), Removed::Directory);
        assert!(!dir.path().join("d").exists());

        let err = fs.delete("gone", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_delete_symlink_to_directory_keeps_target() {
        let (dir, fs) = setup();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::fs::write(dir.path().join("real/keep"), "k").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        assert_eq!(fs.delete("link", true).await.unwrap(), Removed::Directory);
        assert!(!dir.path().join("link").exists());
        assert!(dir.path().join("real/keep").exists());
    }

    #[tokio::test]
    async fn test_tree_lists_recursively() {
        let (dir, fs) = setup();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), "abc").unwrap();
        std::fs::write(dir.path().join("top.txt"), "t").unwrap();

        let tree = fs.tree("", 32).await.unwrap();
        let paths: Vec<_> = tree.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["a", "a/b", "a/b/c.txt", "top.txt"]);
        assert_eq!(tree.entries[2].size, 3);

        let shallow = fs.tree("", 1).await.unwrap();
        assert_eq!(shallow.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_write_tree_creates_parents() {
        let (dir, fs) = setup();
        let mut files = HashMap::new();
        files.insert("src/main.rs".to_string(), "fn main() {}".to_string());
        files.insert("README.md".to_string(), "# hi".to_string());

        let written = fs.write_tree("project", &files).await.unwrap();
        assert_eq!(written.len(), 2);
        let main = std::fs::read_to_string(dir.path().join("project/src/main.rs")).unwrap();
        assert_eq!(main, "fn main() {}");
    }

    #[tokio::test]
    async fn test_write_tree_rejects_escaping_paths() {
        let (_dir, fs) = setup();
        let mut files = HashMap::new();
        files.insert("../outside".to_string(), "x".to_string());
        let err = fs.write_tree("project", &files).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
