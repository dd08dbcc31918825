//! Incremental remote-sync uploader.
//!
//! Transfers a manifest of local artifacts to a remote file store over one
//! stateful connection, skipping files whose remote content already matches,
//! creating missing remote directories on demand, and reporting per-file
//! progress. Entries are processed strictly in manifest order; the single
//! connection serves both the file-transfer path and out-of-band remote
//! commands (checksum, mkdir), so nothing here is safe to parallelize.

pub mod progress;
pub mod ssh;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use progress::ProgressReporter;

/// Result of a remote stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStat {
    Exists,
    /// The well-known "no such file" status.
    NotFound,
    /// Any other protocol status code.
    Status(i32),
}

/// Stateful connection to a remote file store.
///
/// One connection carries both the streamed file transfers and the
/// out-of-band remote commands; callers must issue operations sequentially.
pub trait RemoteConnection {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Stat a remote path. `Err` means the transport itself failed.
    fn stat(&mut self, remote: &str) -> Result<RemoteStat>;

    /// Run a command on the remote host and return its stdout.
    fn execute(&mut self, command: &str) -> Result<String>;

    /// Stream a local file to the remote path, reporting bytes sent so far.
    fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<()>;

    fn set_permissions(&mut self, remote: &str, mode: u32) -> Result<()>;
}

/// Ordered mapping of remote path to local source. Remote paths are unique;
/// re-inserting an existing remote path replaces its local source in place.
#[derive(Debug, Clone, Default)]
pub struct TransferManifest {
    entries: Vec<(String, PathBuf)>,
}

impl TransferManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, remote: impl Into<String>, local: impl Into<PathBuf>) {
        let remote = remote.into();
        let local = local.into();
        if let Some(entry) = self.entries.iter_mut().find(|(r, _)| *r == remote) {
            entry.1 = local;
        } else {
            self.entries.push((remote, local));
        }
    }

    /// Map each deliverable to `<remote_dir>/<file name>`.
    pub fn from_deliverables(remote_dir: &str, deliverables: &[PathBuf]) -> Result<Self> {
        let mut manifest = Self::new();
        let remote_dir = remote_dir.trim_end_matches('/');
        for local in deliverables {
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| {
                    format!("deliverable '{}' has no usable file name", local.display())
                })?;
            manifest.insert(format!("{remote_dir}/{name}"), local.clone());
        }
        Ok(manifest)
    }

    /// Mirror a local directory tree under `remote_dir`, one entry per file,
    /// in a stable walk order.
    pub fn from_dir(remote_dir: &str, local_dir: &Path) -> Result<Self> {
        let mut manifest = Self::new();
        let remote_dir = remote_dir.trim_end_matches('/');
        for entry in walkdir::WalkDir::new(local_dir).sort_by_file_name() {
            let entry = entry
                .with_context(|| format!("walking directory '{}'", local_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            manifest.insert(format!("{remote_dir}/{relative}"), entry.path().to_path_buf());
        }
        Ok(manifest)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(r, l)| (r.as_str(), l.as_path()))
    }
}

/// Per-file transfer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub remote_path: String,
    pub bytes_transferred: u64,
    pub skipped: bool,
    pub reason: Option<String>,
}

/// Aggregate of one upload call, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    pub outcomes: Vec<TransferOutcome>,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub total_bytes: u64,
}

impl TransferSummary {
    fn record(&mut self, outcome: TransferOutcome) {
        if outcome.skipped {
            self.files_skipped += 1;
        } else {
            self.files_uploaded += 1;
            self.total_bytes += outcome.bytes_transferred;
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("not connected to the remote host")]
    NotConnected,

    /// A remote stat answered with a status that is neither "exists" nor
    /// "not found". A misbehaving remote session must not silently proceed.
    #[error("unexpected remote stat status {code} for '{remote}'")]
    UnexpectedStatus {
        remote: String,
        code: i32,
        /// Outcomes of entries processed before the abort.
        completed: TransferSummary,
    },

    #[error("transfer of '{remote}' failed")]
    Failed {
        remote: String,
        #[source]
        source: anyhow::Error,
        completed: TransferSummary,
    },
}

impl TransferError {
    /// Outcomes recorded before the upload aborted.
    pub fn completed(&self) -> Option<&TransferSummary> {
        match self {
            TransferError::NotConnected => None,
            TransferError::UnexpectedStatus { completed, .. }
            | TransferError::Failed { completed, .. } => Some(completed),
        }
    }
}

/// Uploads a [`TransferManifest`] through a [`RemoteConnection`], skipping
/// remote files whose content already matches.
pub struct SyncUploader {
    /// Re-upload even when remote content matches.
    pub overwrite: bool,
    /// Permission bits applied to every uploaded file.
    pub default_permissions: u32,
    reporter: ProgressReporter,
}

impl Default for SyncUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncUploader {
    pub fn new() -> Self {
        Self {
            overwrite: false,
            default_permissions: 0o644,
            reporter: ProgressReporter::stderr(),
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_default_permissions(mut self, mode: u32) -> Self {
        self.default_permissions = mode;
        self
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Transfer every manifest entry, in order. On a fatal error the
    /// outcomes of already-processed entries ride along inside the error.
    pub fn upload(
        &self,
        conn: &mut dyn RemoteConnection,
        manifest: &TransferManifest,
    ) -> Result<TransferSummary, TransferError> {
        if !conn.is_connected() {
            return Err(TransferError::NotConnected);
        }

        let mut summary = TransferSummary::default();
        if manifest.is_empty() {
            return Ok(summary);
        }

        debug!("files to upload:");
        for (remote, local) in manifest.iter() {
            debug!("  {} => {}", local.display(), remote);
        }

        let mut sizes = Vec::with_capacity(manifest.len());
        for (remote, local) in manifest.iter() {
            let size = std::fs::metadata(local)
                .map(|m| m.len())
                .with_context(|| format!("sizing local file '{}'", local.display()))
                .map_err(|source| TransferError::Failed {
                    remote: remote.to_string(),
                    source,
                    completed: TransferSummary::default(),
                })?;
            sizes.push(size);
        }
        info!(
            "{} files to upload ({})",
            manifest.len(),
            format_size(sizes.iter().sum())
        );

        let mut ensured_dirs: HashSet<String> = HashSet::new();

        for (index, (remote, local)) in manifest.iter().enumerate() {
            let size = sizes[index];
            let position = format!("{}/{}", index + 1, manifest.len());
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| local.display().to_string());

            match conn.stat(remote) {
                Err(source) => {
                    return Err(TransferError::Failed {
                        remote: remote.to_string(),
                        source,
                        completed: summary,
                    })
                }
                Ok(RemoteStat::Status(code)) => {
                    return Err(TransferError::UnexpectedStatus {
                        remote: remote.to_string(),
                        code,
                        completed: summary,
                    })
                }
                Ok(RemoteStat::Exists) if !self.overwrite => {
                    let checksums = self.compare_checksums(conn, remote, local);
                    match checksums {
                        Err(source) => {
                            return Err(TransferError::Failed {
                                remote: remote.to_string(),
                                source,
                                completed: summary,
                            })
                        }
                        Ok(Some(checksum)) => {
                            info!(
                                "{position} {name}: files are identical (sha256: {checksum}), skipping"
                            );
                            summary.record(TransferOutcome {
                                remote_path: remote.to_string(),
                                bytes_transferred: 0,
                                skipped: true,
                                reason: Some(format!("remote file identical (sha256 {checksum})")),
                            });
                            continue;
                        }
                        // Content differs: fall through and re-upload.
                        Ok(None) => {}
                    }
                }
                Ok(_) => {}
            }

            if let Some(parent) = remote_parent(remote) {
                if ensured_dirs.insert(parent.clone()) {
                    conn.execute(&format!("mkdir -p {}", quoted(&parent)))
                        .map_err(|source| TransferError::Failed {
                            remote: remote.to_string(),
                            source,
                            completed: summary.clone(),
                        })?;
                }
            }

            let handle = self.reporter.start(&format!("{position} {name}"), size);
            let result = conn.upload(local, remote, &mut |sent| handle.advance(sent));
            handle.finish();
            result.map_err(|source| TransferError::Failed {
                remote: remote.to_string(),
                source,
                completed: summary.clone(),
            })?;

            conn.set_permissions(remote, self.default_permissions)
                .map_err(|source| TransferError::Failed {
                    remote: remote.to_string(),
                    source,
                    completed: summary.clone(),
                })?;

            summary.record(TransferOutcome {
                remote_path: remote.to_string(),
                bytes_transferred: size,
                skipped: false,
                reason: None,
            });
        }

        info!(
            "upload finished: {} uploaded, {} skipped, {} transferred",
            summary.files_uploaded,
            summary.files_skipped,
            format_size(summary.total_bytes)
        );
        Ok(summary)
    }

    /// Compare local and remote content. `Ok(Some(sum))` means identical.
    fn compare_checksums(
        &self,
        conn: &mut dyn RemoteConnection,
        remote: &str,
        local: &Path,
    ) -> Result<Option<String>> {
        let local_sum = sha256_file(local)?;
        let output = conn
            .execute(&format!("sha256sum {}", quoted(remote)))
            .with_context(|| format!("computing remote checksum of '{remote}'"))?;
        let remote_sum = output
            .split_whitespace()
            .next()
            .with_context(|| format!("parsing remote checksum output for '{remote}'"))?;
        if local_sum == remote_sum {
            Ok(Some(local_sum))
        } else {
            Ok(None)
        }
    }
}

/// Single-quote a remote path for the shell, escaping embedded quotes.
pub(crate) fn quoted(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Parent directory of a slash-separated remote path, if it has one.
fn remote_parent(remote: &str) -> Option<String> {
    match remote.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => None,
    }
}

/// Human-readable size with the coarse MB / kB / B thresholds the progress
/// banner uses.
pub fn format_size(bytes: u64) -> String {
    let kb = bytes / 1024;
    let mb = kb / 1024;
    if mb > 0 {
        format!("{mb}MB")
    } else if kb > 0 {
        format!("{kb}kB")
    } else {
        format!("{bytes}B")
    }
}

/// Streaming sha256 of a local file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("hashing '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
