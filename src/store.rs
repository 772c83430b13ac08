use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::error::EodmsError;

/// Output directory shared by concurrent transfer workers. Every transfer
/// writes to its own uniquely named temporary file next to the final path and
/// is renamed into place only once complete.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: Utf8PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), EodmsError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(|err| {
            EodmsError::Filesystem(format!("cannot create output directory {}: {err}", self.root))
        })?;
        if !self.root.as_std_path().is_dir() {
            return Err(EodmsError::Filesystem(format!(
                "output location {} is not a directory",
                self.root
            )));
        }
        Ok(())
    }

    /// Final location for a remote file name, confined to the output directory.
    pub fn item_path(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(sanitize_file_name(file_name))
    }

    /// Size of an existing regular file, if any.
    pub fn existing_len(&self, path: &Utf8Path) -> Option<u64> {
        fs::metadata(path.as_std_path())
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Temporary `.{name}.XXXX.part` file in the output directory. Dropped
    /// without `commit`, it is removed.
    pub fn begin_transfer(&self, file_name: &str) -> Result<NamedTempFile, EodmsError> {
        Builder::new()
            .prefix(&format!(".{}.", sanitize_file_name(file_name)))
            .suffix(".part")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| EodmsError::Filesystem(err.to_string()))
    }

    /// Atomically renames a finished transfer to `dest`, replacing any older file.
    pub fn commit(&self, temp: NamedTempFile, dest: &Utf8Path) -> Result<(), EodmsError> {
        temp.as_file()
            .sync_all()
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| EodmsError::Filesystem(format!("{dest}: {}", err.error)))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), EodmsError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".eodms-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        io::Write::write_all(&mut temp, content)
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Last path segment of `name` with separators and control characters replaced.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}
