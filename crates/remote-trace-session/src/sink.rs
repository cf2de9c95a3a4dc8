//! Per-session artifact files.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{trace}_{target}_{YYYYmmdd_HHMMSS}.json`
#[must_use]
pub fn artifact_file_name(trace_name: &str, target_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.json",
        sanitize_component(trace_name),
        sanitize_component(target_id),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Hands out artifact paths that no other session in this process, and no
/// existing file, already uses.
#[derive(Debug, Default)]
pub struct PathAllocator {
    assigned: Mutex<HashSet<PathBuf>>,
}

impl PathAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `dir/file_name`, or `dir/{stem}_{n}.{ext}` for the first free `n`.
    pub fn allocate(&self, dir: &Path, file_name: &str) -> PathBuf {
        let mut assigned = self.assigned.lock().unwrap_or_else(PoisonError::into_inner);
        let name = Path::new(file_name);
        let stem = name.file_stem().map_or_else(String::new, |s| s.to_string_lossy().into_owned());
        let ext = name.extension().map(|e| e.to_string_lossy().into_owned());

        let mut candidate = dir.join(file_name);
        let mut n = 1u32;
        while assigned.contains(&candidate) || matches!(candidate.try_exists(), Ok(true)) {
            let numbered = match ext {
                Some(ref ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            candidate = dir.join(numbered);
            n += 1;
        }
        assigned.insert(candidate.clone());
        candidate
    }
}

/// Append-only writer for one session's output.
#[derive(Debug)]
pub struct ArtifactSink {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl ArtifactSink {
    /// Create the file, failing if it already exists.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created.
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// # Errors
    /// Returns error if the write fails.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and sync, returning the byte count.
    ///
    /// # Errors
    /// Returns error if flushing or syncing fails.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        Ok(self.bytes_written)
    }
}
