//! Destination writer - owns the on-disk artifact of a session
//!
//! Bytes are appended to a `.part` staging file next to the target and
//! only renamed onto the final name once the session completes. Any other
//! ending removes the staging file, so a failed or cancelled download never
//! leaves a file under the target name.

use crate::error::WriterError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use url::Url;

/// Name used when the URL has no usable final path segment
pub const FALLBACK_FILE_NAME: &str = "download";

/// Suffix of the staging file
pub const STAGING_SUFFIX: &str = ".part";

/// Appends bytes to a staged artifact
#[derive(Debug)]
pub struct DestinationWriter {
    path: PathBuf,
    staging_path: PathBuf,
    file: Option<BufWriter<File>>,
    bytes_written: u64,
    finalized: bool,
    discarded: bool,
}

impl DestinationWriter {
    /// Create the staging file for `path`.
    ///
    /// An existing file under the final name is only removed when
    /// `overwrite` is set; otherwise this fails with `AlreadyExists`.
    pub async fn open(path: impl Into<PathBuf>, overwrite: bool) -> Result<Self, WriterError> {
        let path = path.into();
        let staging_path = staging_path_for(&path);

        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| WriterError::on_open(path.clone(), e))?;
        if exists {
            if !overwrite {
                return Err(WriterError::AlreadyExists { path });
            }
            fs::remove_file(&path)
                .await
                .map_err(|e| WriterError::on_open(path.clone(), e))?;
            info!("Removed existing file {:?} before download", path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WriterError::on_open(path.clone(), e))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging_path)
            .await
            .map_err(|e| WriterError::on_open(path.clone(), e))?;

        debug!("Opened staging file {:?}", staging_path);

        Ok(Self {
            path,
            staging_path,
            file: Some(BufWriter::new(file)),
            bytes_written: 0,
            finalized: false,
            discarded: false,
        })
    }

    /// Final path of the artifact
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path bytes are written to until finalize
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Send further writes to `file`, leaving the staging file in place
    #[cfg(test)]
    pub(crate) fn redirect_to(&mut self, file: File) {
        self.file = Some(BufWriter::new(file));
    }

    /// Append a chunk in delivery order
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), WriterError> {
        let file = self.file.as_mut().ok_or_else(|| WriterError::Closed {
            path: self.path.clone(),
        })?;

        file.write_all(bytes).await.map_err(|source| WriterError::Io {
            path: self.staging_path.clone(),
            source,
        })?;

        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush, close and move the staging file onto the final name.
    ///
    /// Returns the total number of bytes written. On error the staging
    /// file is left for `discard`.
    pub async fn finalize(&mut self) -> Result<u64, WriterError> {
        let mut file = self.file.take().ok_or_else(|| WriterError::Closed {
            path: self.path.clone(),
        })?;

        let io_err = |source| WriterError::Io {
            path: self.staging_path.clone(),
            source,
        };

        file.flush().await.map_err(io_err)?;
        let file = file.into_inner();
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        fs::rename(&self.staging_path, &self.path)
            .await
            .map_err(io_err)?;

        self.finalized = true;
        info!(
            "Finalized {:?} ({} bytes)",
            self.path, self.bytes_written
        );
        Ok(self.bytes_written)
    }

    /// Close the handle and delete the staging file. Idempotent, never fails.
    pub async fn discard(&mut self) {
        if self.finalized || self.discarded {
            return;
        }
        // Close before deleting
        drop(self.file.take());

        match fs::remove_file(&self.staging_path).await {
            Ok(()) => debug!("Discarded staging file {:?}", self.staging_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging file {:?}: {}", self.staging_path, e),
        }
        self.discarded = true;
    }
}

impl Drop for DestinationWriter {
    fn drop(&mut self) {
        if self.finalized || self.discarded {
            return;
        }
        drop(self.file.take());
        if let Err(e) = std::fs::remove_file(&self.staging_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging file {:?}: {}", self.staging_path, e);
            }
        }
    }
}

/// Staging path used for `path`
pub fn staging_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.into());
    name.push(STAGING_SUFFIX);
    path.with_file_name(name)
}

/// Artifact name for a URL: the final path segment, decoded and sanitized
pub fn artifact_name(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());

    let sanitized = sanitize_file_name(&decoded);
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
