//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating source trees
//! - Recreating the directory structure under a target
//! - Deciding whether a file needs copying (full vs differential)
//! - Copying files with modification-time preservation

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::EngineError;
use crate::model::SaveType;

/// A regular file found in the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Full source path
    pub source_path: PathBuf,
    /// Full path of the copy under the target root
    pub target_path: PathBuf,
    /// Size in bytes at enumeration time
    pub size: u64,
}

/// Everything found under a source root.
#[derive(Debug, Default)]
pub struct SourceTree {
    /// Target-side directories to recreate, parents before children
    pub directories: Vec<PathBuf>,
    pub files: Vec<SourceFile>,
}

impl SourceTree {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Enumerate the source directory tree.
///
/// # Arguments
/// * `source` - Source directory to enumerate
/// * `target_root` - Root target directory (for building mirrored paths)
///
/// # Errors
/// Returns EngineError if any directory cannot be read.
pub fn enumerate_tree(source: &Path, target_root: &Path) -> Result<SourceTree, EngineError> {
    let mut tree = SourceTree::default();

    fn recurse(
        path: &Path,
        rel_path: &Path,
        target_root: &Path,
        tree: &mut SourceTree,
    ) -> Result<(), EngineError> {
        let entries = fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            let metadata = entry.metadata().map_err(|e| EngineError::EnumerationFailed {
                path: entry.path(),
                source: e,
            })?;

            let rel_full_path = rel_path.join(entry.file_name());
            let target_path = target_root.join(&rel_full_path);
            let entry_path = entry.path();

            if metadata.is_dir() {
                tree.directories.push(target_path);
                recurse(&entry_path, &rel_full_path, target_root, tree)?;
            } else {
                tree.files.push(SourceFile {
                    source_path: entry_path,
                    target_path,
                    size: metadata.len(),
                });
            }
        }
        Ok(())
    }

    recurse(source, Path::new(""), target_root, &mut tree)?;
    Ok(tree)
}

/// Create the target root and every mirrored subdirectory.
pub fn create_directories(target_root: &Path, directories: &[PathBuf]) -> Result<(), EngineError> {
    for dir in std::iter::once(target_root).chain(directories.iter().map(PathBuf::as_path)) {
        fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Decide whether a file must be copied.
///
/// Full saves always copy. Differential saves copy when the target is missing
/// or the source modification time is strictly newer than the target's.
pub fn should_copy(save_type: SaveType, source: &Path, target: &Path) -> bool {
    if save_type == SaveType::Full {
        return true;
    }

    let target_meta = match fs::metadata(target) {
        Ok(meta) => meta,
        // Missing (or unreadable) target: copy
        Err(_) => return true,
    };
    match fs::metadata(source) {
        Ok(source_meta) => {
            FileTime::from_last_modification_time(&source_meta)
                > FileTime::from_last_modification_time(&target_meta)
        }
        Err(_) => true,
    }
}

/// Copy a file from source to destination with modification-time preservation.
///
/// # Returns
/// Number of bytes copied
///
/// # Errors
/// Returns EngineError if the copy fails
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_mtime = src_file
        .metadata()
        .map_err(|e| EngineError::ReadError {
            path: src.to_path_buf(),
            source: e,
        })?
        .modified()
        .ok();

    let mut dst_file = fs::File::create(dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;
    drop(dst_file);

    // Differential saves compare against this timestamp on the next run
    if let Some(mtime) = src_mtime {
        let _ = filetime::set_file_mtime(dst, FileTime::from_system_time(mtime));
    }

    Ok(bytes_copied)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_enumerate_flat_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir(&src).expect("Failed to create src dir");
        fs::write(src.join("file1.txt"), b"test data 1").expect("Failed to write file1");
        fs::write(src.join("file2.txt"), b"test data 2").expect("Failed to write file2");

        let dst = temp_dir.path().join("dst");
        let tree = enumerate_tree(&src, &dst).expect("Failed to enumerate");

        assert_eq!(tree.files.len(), 2);
        assert!(tree.directories.is_empty());
        assert_eq!(tree.total_bytes(), 22);
        assert!(tree.files.iter().all(|f| f.target_path.starts_with(&dst)));
    }

    #[test]
    fn test_enumerate_nested_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let subdir = src.join("subdir");
        fs::create_dir_all(&subdir).expect("Failed to create subdir");
        fs::write(src.join("file1.txt"), b"data1").expect("Failed to write file1");
        fs::write(subdir.join("file2.txt"), b"data2").expect("Failed to write file2");

        let dst = temp_dir.path().join("dst");
        let tree = enumerate_tree(&src, &dst).expect("Failed to enumerate");

        assert_eq!(tree.directories, vec![dst.join("subdir")]);
        assert_eq!(tree.files.len(), 2);
        assert!(tree
            .files
            .iter()
            .any(|f| f.target_path == dst.join("subdir").join("file2.txt")));
    }

    #[test]
    fn test_create_directories_mirrors_tree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("dst");
        let nested = dst.join("a").join("b");

        create_directories(&dst, &[dst.join("a"), nested.clone()]).expect("create");
        assert!(nested.is_dir());
    }

    #[test]
    fn test_copy_file_preserves_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src_file = temp_dir.path().join("source.txt");
        let dst_file = temp_dir.path().join("out").join("dest.txt");
        fs::write(&src_file, b"test content").expect("Failed to write source");

        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&src_file, FileTime::from_system_time(old)).expect("mtime");

        let bytes = copy_file_with_metadata(&src_file, &dst_file).expect("Failed to copy");
        assert_eq!(bytes, 12);
        assert_eq!(fs::read_to_string(&dst_file).expect("read"), "test content");

        let src_meta = fs::metadata(&src_file).expect("meta");
        let dst_meta = fs::metadata(&dst_file).expect("meta");
        assert_eq!(
            FileTime::from_last_modification_time(&src_meta).unix_seconds(),
            FileTime::from_last_modification_time(&dst_meta).unix_seconds()
        );
    }

    #[test]
    fn test_should_copy_full_always() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        let dst = temp_dir.path().join("b.txt");
        fs::write(&src, b"x").expect("write");
        fs::write(&dst, b"x").expect("write");
        assert!(should_copy(SaveType::Full, &src, &dst));
    }

    #[test]
    fn test_should_copy_differential() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        let dst = temp_dir.path().join("b.txt");
        fs::write(&src, b"x").expect("write");

        // Missing target
        assert!(should_copy(SaveType::Differential, &src, &dst));

        // Target newer than source
        fs::write(&dst, b"x").expect("write");
        let now = SystemTime::now();
        filetime::set_file_mtime(&src, FileTime::from_system_time(now - Duration::from_secs(60)))
            .expect("mtime");
        filetime::set_file_mtime(&dst, FileTime::from_system_time(now)).expect("mtime");
        assert!(!should_copy(SaveType::Differential, &src, &dst));

        // Source newer than target
        filetime::set_file_mtime(&src, FileTime::from_system_time(now + Duration::from_secs(60)))
            .expect("mtime");
        assert!(should_copy(SaveType::Differential, &src, &dst));
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");
        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn test_enumerate_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("nonexistent");
        let dst = temp_dir.path().join("dst");
        assert!(enumerate_tree(&src, &dst).is_err());
    }
}
