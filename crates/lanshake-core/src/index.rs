//! File index construction and path handling for the data phase.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::FileIndexEntry;

/// MIME type announced for directories
pub const DIRECTORY_MIME: &str = "inode/directory";

/// Build the ordered index for a set of files and directories.
///
/// Names are relative to each path's parent and always use `/`. Directories
/// come before their contents.
///
/// # Errors
///
/// Returns an error if a path does not exist or cannot be read.
pub fn build_index(paths: &[PathBuf]) -> Result<Vec<FileIndexEntry>> {
    let mut entries = Vec::new();

    for path in paths {
        let path = std::fs::canonicalize(path)
            .map_err(|_| Error::InvalidInput(format!("{} does not exist", path.display())))?;
        let base = path.parent().unwrap_or(&path);
        if path.is_file() {
            entries.push(entry_for(&path, base)?);
        } else if path.is_dir() {
            for item in walkdir::WalkDir::new(&path).follow_links(true).sort_by_file_name() {
                let item = item.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
                let item_path = item.path();
                if item_path.is_dir() || item_path.is_file() {
                    entries.push(entry_for(item_path, base)?);
                }
            }
        } else {
            return Err(Error::InvalidInput(format!(
                "{} is neither a file nor a directory",
                path.display()
            )));
        }
    }

    // The filesystem root has no parent to name it by.
    entries.retain(|e| !e.name.is_empty());
    Ok(entries)
}

fn entry_for(path: &Path, base: &Path) -> Result<FileIndexEntry> {
    let metadata = std::fs::metadata(path)?;
    let relative = path.strip_prefix(base).unwrap_or(path);
    let name = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    let is_directory = metadata.is_dir();
    let mime = if is_directory {
        DIRECTORY_MIME.to_string()
    } else {
        mime_guess::from_path(path)
            .first()
            .map_or_else(|| "application/octet-stream".to_string(), |m| m.to_string())
    };

    Ok(FileIndexEntry {
        name,
        size: if is_directory { 0 } else { metadata.len() },
        mime,
        is_directory,
        source: Some(path.to_path_buf()),
    })
}

/// Resolve a received entry name inside `base`.
///
/// Returns `None` for empty names and for anything that would escape `base`.
#[must_use]
pub fn sanitize_relative_path(base: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(base.join(clean))
}

/// Total bytes of the non-directory entries.
#[must_use]
pub fn total_size(entries: &[FileIndexEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| !e.is_directory)
        .map(|e| e.size)
        .sum()
}

/// Format a byte count for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_index_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("raw")).unwrap();
        std::fs::write(root.join("cover.png"), b"png").unwrap();
        std::fs::write(root.join("raw").join("notes.txt"), b"hello").unwrap();

        let entries = build_index(&[root]).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["album", "album/cover.png", "album/raw", "album/raw/notes.txt"]);

        assert!(entries[0].is_directory);
        assert_eq!(entries[0].mime, DIRECTORY_MIME);
        assert_eq!(entries[1].mime, "image/png");
        assert_eq!(entries[3].size, 5);
        assert_eq!(total_size(&entries), 8);
    }

    #[test]
    fn test_build_index_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("blob.unknownext");
        std::fs::write(&file, b"x").unwrap();

        let entries = build_index(std::slice::from_ref(&file)).unwrap();
        assert_eq!(entries[0].name, "blob.unknownext");
        assert_eq!(entries[0].mime, "application/octet-stream");
        assert_eq!(entries[0].source, Some(std::fs::canonicalize(&file).unwrap()));
    }

    #[test]
    fn test_dot_paths_are_named_by_their_directory() {
        let dir = TempDir::new().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir_all(photos.join("raw")).unwrap();
        std::fs::write(photos.join("a.jpg"), b"jpg").unwrap();

        for path in [photos.join("."), photos.join("raw").join("..")] {
            let entries = build_index(&[path]).unwrap();
            let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, ["photos", "photos/a.jpg", "photos/raw"]);
            assert!(entries
                .iter()
                .all(|e| sanitize_relative_path(dir.path(), &e.name).is_some()));
        }
    }

    #[test]
    fn test_missing_path() {
        let dir = TempDir::new().unwrap();
        assert!(build_index(&[dir.path().join("nope")]).is_err());
    }

    #[test]
    fn test_sanitize_relative_path() {
        let base = Path::new("/home/user/downloads");
        assert_eq!(
            sanitize_relative_path(base, "sub/file.txt"),
            Some(PathBuf::from("/home/user/downloads/sub/file.txt"))
        );
        assert_eq!(sanitize_relative_path(base, "../../etc/passwd"), None);
        assert_eq!(sanitize_relative_path(base, "/etc/passwd"), None);
        assert_eq!(sanitize_relative_path(base, ""), None);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
