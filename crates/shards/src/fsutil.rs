use crate::Result;
use log::warn;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes `tmp` through `write` and makes it durable. The file is removed
/// again if anything fails, so a failed stage never leaves a partial file.
pub(crate) fn stage_file(
    tmp: &Path,
    write: impl FnOnce(&mut BufWriter<&File>) -> Result<u64>,
) -> Result<u64> {
    let result = (|| -> Result<u64> {
        let file = File::create(tmp)?;
        let written = {
            let mut out = BufWriter::new(&file);
            let written = write(&mut out)?;
            out.flush()?;
            written
        };
        file.sync_all()?;
        Ok(written)
    })();
    if result.is_err() {
        discard(tmp);
    }
    result
}

/// Atomically moves a staged file into place and persists the rename.
pub(crate) fn commit_file(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(err) = std::fs::rename(tmp, path) {
        discard(tmp);
        return Err(err.into());
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Best-effort removal; a missing file counts as removed.
pub(crate) fn discard(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
