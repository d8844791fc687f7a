//! Zipped copy of a local test-code directory.
//!
//! When the user passes `--code-dir`, the directory is zipped once and the
//! same archive is attached to every launch attempt.

use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Directories never shipped to the server.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", ".probe"];

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("test code directory not found: {0}")]
    NotADirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to walk test code directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to build zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("failed to build zip archive: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory zip archive of a test-code directory.
#[derive(Clone)]
pub struct SourceBundle {
    root: PathBuf,
    files: Vec<String>,
    bytes: Vec<u8>,
    sha256: String,
}

impl std::fmt::Debug for SourceBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBundle")
            .field("root", &self.root)
            .field("files", &self.files.len())
            .field("bytes", &self.bytes.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

impl SourceBundle {
    /// Zip every regular file under `root`, skipping VCS and dependency dirs.
    ///
    /// Entry names are relative to `root` with forward slashes and sorted, so
    /// the same tree always yields the same archive listing.
    pub fn from_dir(root: &Path) -> Result<Self, BundleError> {
        if !root.is_dir() {
            return Err(BundleError::NotADirectory(root.to_path_buf()));
        }

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e
                            .file_name()
                            .to_str()
                            .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
            });

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let mut files = Vec::new();

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let content = std::fs::read(entry.path()).map_err(|source| BundleError::Read {
                path: entry.path().to_path_buf(),
                source,
            })?;
            writer.start_file(name.as_str(), options)?;
            writer.write_all(&content)?;
            files.push(name);
        }

        let bytes = writer.finish()?.into_inner();
        let sha256 = format!("{:x}", Sha256::digest(&bytes));

        debug!(
            root = %root.display(),
            files = files.len(),
            bytes = bytes.len(),
            sha256 = %sha256,
            "built source bundle"
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
            bytes,
            sha256,
        })
    }

    /// Whether the archive contains `script` (project-relative path).
    pub fn contains(&self, script: &str) -> bool {
        self.files.iter().any(|f| f == script)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Hex SHA-256 of the archive bytes.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn bundle_lists_relative_files_sorted() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "tests/login.js", "open()");
        write(dir.path(), "lib/helpers.js", "export {}");
        write(dir.path(), "README.md", "# tests");

        let bundle = SourceBundle::from_dir(dir.path()).unwrap();
        assert_eq!(
            bundle.files(),
            &["README.md", "lib/helpers.js", "tests/login.js"]
        );
        assert!(bundle.contains("tests/login.js"));
        assert!(!bundle.contains("tests/missing.js"));
        assert!(!bundle.is_empty());
    }

    #[test]
    fn bundle_skips_vcs_and_dependency_dirs() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "tests/login.js", "open()");
        write(dir.path(), ".git/HEAD", "ref: refs/heads/main");
        write(dir.path(), "node_modules/pkg/index.js", "module.exports = 1");

        let bundle = SourceBundle::from_dir(dir.path()).unwrap();
        assert_eq!(bundle.files(), &["tests/login.js"]);
    }

    #[test]
    fn bundle_archive_round_trips_content() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "tests/login.js", "open('https://example.com')");

        let bundle = SourceBundle::from_dir(dir.path()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bundle.bytes().to_vec())).unwrap();
        let mut entry = archive.by_name("tests/login.js").unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "open('https://example.com')");
    }

    #[test]
    fn bundle_digest_is_hex_sha256() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.js", "1");
        write(dir.path(), "b.js", "2");

        let bundle = SourceBundle::from_dir(dir.path()).unwrap();
        assert_eq!(bundle.sha256().len(), 64);
        assert!(bundle.sha256().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(bundle.len(), bundle.bytes().len());
    }

    #[test]
    fn bundle_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            SourceBundle::from_dir(&missing),
            Err(BundleError::NotADirectory(_))
        ));
    }
}
