//! Artifact Transfer
//!
//! Moves a generated report from wherever the tool wrote it into the output
//! directory under its canonical name. Every file passes through
//! `<output_dir>/.staging` first and only reaches the output directory by
//! rename, so retention never observes a partially written report.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::error::CollectorError;
use crate::exec::Executor;
use crate::types::{ArtifactName, CollectionTarget};

/// Name of the staging directory inside the output directory.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Suffix of a staging file still being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// Leading bytes of every gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Transfers reports into the output directory.
#[derive(Clone)]
pub struct ArtifactTransfer {
    executor: Arc<dyn Executor>,
    output_dir: PathBuf,
    remote_dir: String,
}

impl std::fmt::Debug for ArtifactTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactTransfer")
            .field("output_dir", &self.output_dir)
            .field("remote_dir", &self.remote_dir)
            .finish_non_exhaustive()
    }
}

impl ArtifactTransfer {
    /// Create a transfer into `output_dir`. Driver pods write reports into
    /// `remote_dir` inside their container.
    pub fn new(
        executor: Arc<dyn Executor>,
        output_dir: impl Into<PathBuf>,
        remote_dir: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            output_dir: output_dir.into(),
            remote_dir: remote_dir.into(),
        }
    }

    /// Directory receiving finished reports.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory holding in-flight files.
    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join(STAGING_DIR_NAME)
    }

    /// Create the output and staging directories.
    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.staging_dir()).await
    }

    /// Remove staging entries not modified for `older_than`.
    ///
    /// Reports from tools abandoned at a timeout land here after their cycle
    /// has ended; anything still being written has a recent mtime and stays.
    /// Returns the number of entries removed.
    ///
    /// # Errors
    /// Returns the I/O error if the staging directory cannot be listed.
    pub async fn sweep_staging(&self, older_than: Duration) -> io::Result<usize> {
        let staging = self.staging_dir();
        let mut entries = match tokio::fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping staging entry");
                    continue;
                }
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            if age < older_than {
                continue;
            }

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    tracing::info!(
                        path = %path.display(),
                        bytes = metadata.len(),
                        age = %humantime::format_duration(Duration::from_secs(age.as_secs())),
                        "Removed abandoned staging file"
                    );
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file")
                }
            }
        }
        Ok(removed)
    }

    /// Path handed to the report tool's `--output-file` for `target`.
    ///
    /// The tool writes `<base>.gz`.
    pub fn output_base(&self, target: &CollectionTarget, name: &ArtifactName) -> PathBuf {
        match target {
            CollectionTarget::LocalTool { .. } => self.staging_dir().join(name.output_base()),
            CollectionTarget::RemotePod { .. } => {
                Path::new(&self.remote_dir).join(name.output_base())
            }
        }
    }

    /// Path of the compressed report the tool produces for `target`.
    pub fn produced_path(&self, target: &CollectionTarget, name: &ArtifactName) -> PathBuf {
        let mut base = self.output_base(target, name).into_os_string();
        base.push(".gz");
        PathBuf::from(base)
    }

    /// Bring the report at `produced` on `target` into the output directory.
    ///
    /// # Errors
    /// `CollectorError::Transfer` if the report is missing, empty, not gzip,
    /// or cannot be stored.
    pub async fn fetch(
        &self,
        target: &CollectionTarget,
        produced: &Path,
        name: &ArtifactName,
    ) -> Result<PathBuf, CollectorError> {
        let destination = name.path_in(&self.output_dir);
        match target {
            CollectionTarget::LocalTool { .. } => {
                self.fetch_local(produced, &destination).await?;
            }
            CollectionTarget::RemotePod { .. } => {
                self.fetch_remote(target, produced, name, &destination)
                    .await?;
            }
        }

        tracing::info!(
            collection_target = %target,
            artifact = %destination.display(),
            "Report stored"
        );
        Ok(destination)
    }

    async fn fetch_local(&self, produced: &Path, destination: &Path) -> Result<(), CollectorError> {
        if let Err(e) = validate_local_file(produced).await {
            discard(produced).await;
            return Err(e);
        }
        tokio::fs::rename(produced, destination)
            .await
            .map_err(|e| {
                CollectorError::Transfer(format!(
                    "moving {} to {}: {}",
                    produced.display(),
                    destination.display(),
                    e
                ))
            })
    }

    async fn fetch_remote(
        &self,
        target: &CollectionTarget,
        produced: &Path,
        name: &ArtifactName,
        destination: &Path,
    ) -> Result<(), CollectorError> {
        let remote_path = produced.to_string_lossy().into_owned();

        let check = self
            .executor
            .execute(target, &shell_args(&["test", "-s", &remote_path]))
            .await
            .map_err(|e| CollectorError::Transfer(format!("checking {}: {}", remote_path, e)))?;
        if !check.success() {
            return Err(CollectorError::Transfer(format!(
                "remote report {} is missing or empty",
                remote_path
            )));
        }

        let data = self.executor.stream_file(target, &remote_path).await?;
        validate_bytes(&remote_path, &data)?;
        if !remote_path.ends_with(".gz") {
            return Err(CollectorError::Transfer(format!(
                "remote report {} does not have a .gz extension",
                remote_path
            )));
        }

        let partial = self
            .staging_dir()
            .join(format!("{}{}", name.file_name(), PARTIAL_SUFFIX));
        if let Err(e) = write_then_rename(&partial, destination, &data).await {
            discard(&partial).await;
            return Err(CollectorError::Transfer(format!(
                "storing {}: {}",
                destination.display(),
                e
            )));
        }

        tracing::debug!(
            collection_target = %target,
            bytes = data.len(),
            "Streamed remote report"
        );

        self.cleanup_remote(target, &remote_path).await;
        Ok(())
    }

    /// Best-effort removal of the report inside the container.
    async fn cleanup_remote(&self, target: &CollectionTarget, remote_path: &str) {
        match self
            .executor
            .execute(target, &shell_args(&["rm", "-f", remote_path]))
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(
                collection_target = %target,
                path = %remote_path,
                exit_code = ?out.exit_code,
                "Failed to remove remote report"
            ),
            Err(e) => tracing::warn!(
                collection_target = %target,
                path = %remote_path,
                error = %e,
                "Failed to remove remote report"
            ),
        }
    }
}

fn shell_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

async fn validate_local_file(path: &Path) -> Result<(), CollectorError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        CollectorError::Transfer(format!("report {} not found: {}", path.display(), e))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(CollectorError::Transfer(format!(
            "report {} is empty",
            path.display()
        )));
    }

    let mut magic = [0u8; 2];
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| CollectorError::Transfer(format!("opening {}: {}", path.display(), e)))?;
    file.read_exact(&mut magic).await.map_err(|e| {
        CollectorError::Transfer(format!("reading {}: {}", path.display(), e))
    })?;
    if magic != GZIP_MAGIC {
        return Err(CollectorError::Transfer(format!(
            "report {} is not gzip compressed",
            path.display()
        )));
    }
    Ok(())
}

fn validate_bytes(source: &str, data: &[u8]) -> Result<(), CollectorError> {
    if data.is_empty() {
        return Err(CollectorError::Transfer(format!(
            "transferred report {} is empty",
            source
        )));
    }
    if !data.starts_with(&GZIP_MAGIC) {
        return Err(CollectorError::Transfer(format!(
            "transferred report {} is not gzip compressed",
            source
        )));
    }
    Ok(())
}

async fn write_then_rename(partial: &Path, destination: &Path, data: &[u8]) -> io::Result<()> {
    tokio::fs::write(partial, data).await?;
    tokio::fs::rename(partial, destination).await
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}
