//! Release archives (tar + gzip)

use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::errors::DeployError;

/// What went into an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub artifacts: usize,
}

/// Pack `artifacts` (paths relative to `root`) into a gzip tarball at `dest`.
///
/// Symlinks are followed and headers are normalised, so the archive holds no
/// workstation owners, permissions beyond the executable bit, or timestamps.
pub async fn build_archive(
    root: &Path,
    artifacts: &[String],
    dest: &Path,
) -> Result<ArchiveSummary, DeployError> {
    let root = root.to_path_buf();
    let artifacts = artifacts.to_vec();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || write_archive(&root, &artifacts, &dest))
        .await
        .map_err(|e| DeployError::PackagingError(e.to_string()))?
}

fn write_archive(
    root: &Path,
    artifacts: &[String],
    dest: &Path,
) -> Result<ArchiveSummary, DeployError> {
    let packaging = |e: std::io::Error| DeployError::PackagingError(e.to_string());

    let file = StdFile::create(dest).map_err(packaging)?;
    let encoder = GzEncoder::new(file, Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut count = 0;
    for artifact in artifacts {
        let path = root.join(artifact);
        if path.is_dir() {
            builder.append_dir_all(artifact, &path).map_err(packaging)?;
        } else if path.is_file() {
            builder
                .append_path_with_name(&path, artifact)
                .map_err(packaging)?;
        } else {
            debug!("Skipping missing artifact {}", artifact);
            continue;
        }
        count += 1;
    }

    let encoder = builder.into_inner().map_err(packaging)?;
    let file = encoder.finish().map_err(packaging)?;
    file.sync_all().map_err(packaging)?;
    let bytes = std::fs::metadata(dest).map_err(packaging)?.len();

    Ok(ArchiveSummary {
        path: dest.to_path_buf(),
        bytes,
        artifacts: count,
    })
}
