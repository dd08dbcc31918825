//! Deliverable packaging.
//!
//! Bundles a stage's deliverables into a single `tar.zst` archive so a
//! delivery plugin can ship one file instead of many. Archives are
//! deterministic: entries are sorted by name and timestamps and ownership
//! are zeroed, so repackaging unchanged deliverables yields an identical
//! byte stream and the uploader's checksum skip keeps working.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tar::Builder as TarBuilder;
use tracing::debug;

const ZSTD_LEVEL: i32 = 3;

/// Package `deliverables` into `<out_dir>/<archive_name>.tar.zst`, each entry
/// stored under its file name. Returns the archive path.
pub fn package_deliverables(
    archive_name: &str,
    deliverables: &[PathBuf],
    out_dir: &Path,
) -> Result<PathBuf> {
    if deliverables.is_empty() {
        bail!("nothing to package: no deliverables were produced");
    }
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating package directory '{}'", out_dir.display()))?;

    let mut entries: Vec<(String, PathBuf)> = Vec::with_capacity(deliverables.len());
    for path in deliverables {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("deliverable '{}' has no usable file name", path.display()))?;
        if entries.iter().any(|(n, _)| n == name) {
            bail!("duplicate deliverable file name '{name}'");
        }
        entries.push((name.to_string(), path.clone()));
    }
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let archive_path = out_dir.join(format!("{archive_name}.tar.zst"));
    debug!("packaging {} deliverables into {}", entries.len(), archive_path.display());

    let out = File::create(&archive_path)
        .with_context(|| format!("creating '{}'", archive_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);

    for (name, path) in &entries {
        let metadata = fs::metadata(path)
            .with_context(|| format!("reading metadata of '{}'", path.display()))?;
        let mut file =
            File::open(path).with_context(|| format!("opening '{}'", path.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, &mut file)
            .with_context(|| format!("archiving '{}'", path.display()))?;
    }

    let encoder = builder
        .into_inner()
        .context("finalizing deliverable archive")?;
    encoder.finish().context("flushing deliverable archive")?;
    Ok(archive_path)
}
