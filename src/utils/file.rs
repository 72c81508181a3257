use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Temp-file sibling used by streaming writes; the suffix is appended so
/// `data/assets.dat` stages as `data/assets.dat.kachina-tmp`.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.file_name().unwrap_or_default());
    name.push(".kachina-tmp");
    path.with_file_name(name)
}

/// Move `tmp` over `target`. Rename-over-existing fails on some platforms,
/// so a delete-then-rename fallback runs once.
pub async fn atomic_replace(tmp: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(tmp, target).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = tokio::fs::remove_file(target).await;
            tokio::fs::rename(tmp, target).await?;
            Ok(())
        }
    }
}

/// Synchronous write-then-rename for small state files.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let temp_path = tmp_sibling(path);
    if let Some(parent) = temp_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    match std::fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = std::fs::remove_file(path);
            std::fs::rename(&temp_path, path)
        }
    }
}

/// True when the target exists but refuses an exclusive read-write open.
pub async fn is_unwritable(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .is_err()
}

/// If the write target is the running executable, move self aside first and
/// return the parked path. Always ensures the parent directory exists.
pub async fn prepare_target(target: &Path) -> Result<Option<PathBuf>> {
    let mut parked = None;
    if let Ok(exe_path) = std::env::current_exe() {
        if exe_path == target && exe_path.exists() {
            let old_exe = exe_path.with_extension("instbak");
            let _ = tokio::fs::remove_file(&old_exe).await;
            tokio::fs::rename(&exe_path, &old_exe).await?;
            parked = Some(old_exe);
        }
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(parked)
}

fn sweep_empty_dirs(path: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        if child.is_dir() {
            sweep_empty_dirs(&child)?;
            if std::fs::read_dir(&child)?.count() == 0 {
                std::fs::remove_dir(&child)?;
            }
        }
    }
    Ok(())
}

/// Remove empty directories below `root`, then `root` itself if drained.
pub async fn clear_empty_dirs(root: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if !root.exists() {
            return Ok(());
        }
        sweep_empty_dirs(&root)?;
        if std::fs::read_dir(&root)?.count() == 0 {
            std::fs::remove_dir(&root)?;
        }
        Ok(())
    })
    .await
    .map_err(|err| crate::errors::InstallerError::Config(err.to_string()))??;
    Ok(())
}

/// Delete a list of files concurrently; returns per-file error strings
/// instead of failing the whole sweep.
pub async fn rm_list(paths: Vec<PathBuf>) -> Vec<String> {
    let mut set = tokio::task::JoinSet::new();
    for path in paths {
        set.spawn(async move {
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|err| format!("failed to remove {}: {err}", path.display()))
            } else {
                Ok(())
            }
        });
    }
    let mut errors = Vec::new();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Err(msg)) => errors.push(msg),
            Ok(Ok(())) => {}
            Err(err) => errors.push(err.to_string()),
        }
    }
    errors
}
