//! Retention Manager
//!
//! Keeps the newest `max_logs_to_keep` reports in the output directory.
//! Compressed (`.log.gz`) and uncompressed (`.log`) reports are trimmed as
//! separate groups. Only top-level files following the report naming
//! convention are considered; the staging directory is never touched.
//! The report a cycle just stored is always kept and counts toward the
//! maximum, whatever its name says about its age.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};

use crate::error::CollectorError;
use crate::types::{ArtifactName, COMPRESSED_EXTENSION};

/// How many reports to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_to_keep: usize,
}

impl RetentionPolicy {
    /// Create a policy.
    ///
    /// # Errors
    /// `CollectorError::Config` if `max_to_keep` is 0.
    pub fn new(max_to_keep: usize) -> Result<Self, CollectorError> {
        if max_to_keep == 0 {
            return Err(crate::config::ConfigError::ValidationError(
                "max_logs_to_keep must be at least 1".to_string(),
            )
            .into());
        }
        Ok(Self { max_to_keep })
    }

    /// Maximum number of reports per group.
    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    /// Reports still present.
    pub kept: usize,
    /// Reports deleted.
    pub removed: Vec<PathBuf>,
    /// Bytes freed by the deletions.
    pub freed_bytes: u64,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    pinned: bool,
    order: NaiveDateTime,
    size: u64,
}

/// Applies a [`RetentionPolicy`] to an output directory.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    dir: PathBuf,
    policy: RetentionPolicy,
}

impl RetentionManager {
    /// Create a manager for `dir`.
    pub fn new(dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    /// Delete the oldest reports until each group holds at most the maximum.
    ///
    /// `keep` is the report just stored: it ranks ahead of every other file
    /// in its group. Other files are ordered by the timestamp in their name,
    /// falling back to the modification time. Individual delete failures are
    /// logged and skipped.
    ///
    /// # Errors
    /// Returns the I/O error if the directory cannot be listed.
    pub fn apply(&self, keep: Option<&Path>) -> io::Result<RetentionSummary> {
        let (mut compressed, mut plain) = self.scan(keep)?;
        let mut summary = RetentionSummary::default();

        for group in [&mut compressed, &mut plain] {
            self.trim(group, &mut summary);
        }

        if !summary.removed.is_empty() {
            tracing::info!(
                dir = %self.dir.display(),
                removed = summary.removed.len(),
                kept = summary.kept,
                freed_bytes = summary.freed_bytes,
                "Retention removed old reports"
            );
        }
        Ok(summary)
    }

    fn scan(&self, keep: Option<&Path>) -> io::Result<(Vec<Candidate>, Vec<Candidate>)> {
        let keep_name = keep.and_then(Path::file_name);
        let mut compressed = Vec::new();
        let mut plain = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !ArtifactName::is_report_file(file_name) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(file = %file_name, error = %e, "Skipping unreadable report");
                    continue;
                }
            };

            let order = ArtifactName::parse_timestamp(file_name)
                .or_else(|| {
                    metadata
                        .modified()
                        .ok()
                        .map(|t| DateTime::<Local>::from(t).naive_local())
                })
                .unwrap_or_default();

            let candidate = Candidate {
                path: entry.path(),
                pinned: keep_name == Some(entry.file_name().as_os_str()),
                order,
                size: metadata.len(),
            };
            if file_name.ends_with(&format!(".{}", COMPRESSED_EXTENSION)) {
                compressed.push(candidate);
            } else {
                plain.push(candidate);
            }
        }

        Ok((compressed, plain))
    }

    fn trim(&self, group: &mut Vec<Candidate>, summary: &mut RetentionSummary) {
        group.sort_by_key(|c| Reverse((c.pinned, c.order)));
        let max = self.policy.max_to_keep();
        summary.kept += group.len().min(max);

        for candidate in group.iter().skip(max) {
            match fs::remove_file(&candidate.path) {
                Ok(()) => {
                    tracing::debug!(file = %candidate.path.display(), "Removed old report");
                    summary.freed_bytes += candidate.size;
                    summary.removed.push(candidate.path.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        file = %candidate.path.display(),
                        error = %e,
                        "Failed to remove old report"
                    );
                    summary.kept += 1;
                }
            }
        }
    }

    /// Directory being managed.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
