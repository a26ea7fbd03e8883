use crate::error::DeployError;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An uploaded archive owned by the pipeline. The file is deleted on drop,
/// whichever way the operation ends.
#[derive(Debug)]
pub struct Upload {
    path: PathBuf,
}

impl Upload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove upload");
        }
    }
}

/// Unpacks a `.tar.gz` into a fresh directory under `staging_parent`.
///
/// Only regular files and directories are accepted. Links and device
/// entries fail the extraction, and entries whose path leaves the staging
/// directory are skipped.
///
/// The returned [`TempDir`] removes itself when dropped; use [`promote`] to
/// keep it.
pub async fn extract(archive: &Path, staging_parent: &Path) -> Result<TempDir, DeployError> {
    let archive = archive.to_path_buf();
    let parent = staging_parent.to_path_buf();
    tokio::task::spawn_blocking(move || unpack(&archive, &parent))
        .await
        .map_err(|e| DeployError::Internal(format!("extraction task failed: {e}")))?
        .map_err(|e| DeployError::ExtractionFailed(e.to_string()))
}

fn unpack(archive: &Path, parent: &Path) -> io::Result<TempDir> {
    fs::create_dir_all(parent)?;
    let dir = tempfile::Builder::new().prefix("upload-").tempdir_in(parent)?;
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_pax_global_extensions() {
            continue;
        }
        if !(kind.is_file() || kind.is_dir()) {
            let name = entry.path()?.display().to_string();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported archive entry {name}: only files and directories are allowed"),
            ));
        }
        entry.unpack_in(dir.path())?;
    }
    Ok(dir)
}

/// Moves extracted content to `dest` with a single rename.
pub fn promote(staging: TempDir, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let src = staging.keep();
    fs::rename(&src, dest).inspect_err(|_| {
        let _ = fs::remove_dir_all(&src);
    })
}

/// Packs the contents of `source_dir` into a gzip-compressed tarball at `dest`.
pub fn pack(source_dir: &Path, dest: &Path) -> io::Result<()> {
    let out = File::create(dest)?;
    let enc = GzEncoder::new(out, Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(".", source_dir)?;
    tar.into_inner()?.finish()?;
    Ok(())
}
