use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_compression::tokio::bufread::ZstdEncoder;
use tokio::io::BufReader;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::{InstallerError, Result};
use crate::models::{HashAlgorithm, HashRef, HashedFile, InstallerInfo};
use crate::package::format::normalize_footer;
use crate::utils::hash::{hash_bytes, hash_file};
use crate::utils::paths::normalize_rel;

/// Walk `input_dir` (gitignore semantics), hash every file, and stream
/// each one through a zstd encoder into `output_dir/{hash_hex}`. Blobs
/// already staged are skipped, deduplicating identical content.
pub async fn hash_tree(
    input_dir: &Path,
    output_dir: &Path,
    algorithm: HashAlgorithm,
    jobs: usize,
) -> Result<Vec<HashedFile>> {
    tokio::fs::create_dir_all(output_dir).await?;
    let files = walk_tree(input_dir).await?;

    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut set = JoinSet::new();
    for (rel, size) in files {
        let input_dir = input_dir.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let path = input_dir.join(&rel);
            let value = hash_file(algorithm, &path).await?;
            let staged = output_dir.join(value.to_hex());
            if !staged.exists() {
                compress_to(&path, &staged).await?;
            }
            Ok::<_, InstallerError>(HashedFile {
                file_name: normalize_rel(&rel),
                size,
                hash: HashRef::from_value(&value),
                installer: None,
            })
        });
    }

    let mut hashed = Vec::new();
    while let Some(res) = set.join_next().await {
        let file =
            res.map_err(|err| InstallerError::Config(format!("hash worker died: {err}")))??;
        tracing::debug!(file = %file.file_name, hash = file.hash.hex(), "hashed");
        hashed.push(file);
    }
    hashed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(hashed)
}

/// Relative paths and sizes under `dir`, honoring ignore rules.
pub async fn walk_tree(dir: &Path) -> Result<Vec<(String, u64)>> {
    let root = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        if !root.exists() {
            return Ok(files);
        }
        let walker = ignore::WalkBuilder::new(&root)
            .hidden(false)
            .git_ignore(true)
            .ignore(true)
            .require_git(false)
            .build();
        for entry in walker {
            let entry = entry.map_err(|err| InstallerError::Config(err.to_string()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .map_err(|err| InstallerError::Config(err.to_string()))?
                .to_string_lossy()
                .to_string();
            let size = entry
                .metadata()
                .map_err(|err| InstallerError::Config(err.to_string()))?
                .len();
            files.push((normalize_rel(&rel), size));
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(|err| InstallerError::Config(format!("walk worker died: {err}")))?
}

async fn compress_to(input: &Path, output: &Path) -> Result<()> {
    let reader = tokio::fs::File::open(input).await?;
    let mut encoder = ZstdEncoder::new(BufReader::new(reader));
    let out = tokio::fs::File::create(output).await?;
    let mut writer = tokio::io::BufWriter::new(out);
    tokio::io::copy(&mut encoder, &mut writer).await?;
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;
    Ok(())
}

/// Normalize the updater artifact (footer index fields zeroed), hash the
/// normalized bytes, and stage the compressed blob under its hash. The
/// returned entry carries `installer: true`.
pub async fn stage_updater(
    updater: &Path,
    output_dir: &Path,
    algorithm: HashAlgorithm,
) -> Result<(InstallerInfo, HashedFile)> {
    let mut bytes = tokio::fs::read(updater).await?;
    normalize_footer(&mut bytes);
    let value = hash_bytes(algorithm, &bytes);

    let staged = output_dir.join(value.to_hex());
    if !staged.exists() {
        let mut encoder = ZstdEncoder::new(BufReader::new(std::io::Cursor::new(bytes.clone())));
        let out = tokio::fs::File::create(&staged).await?;
        let mut writer = tokio::io::BufWriter::new(out);
        tokio::io::copy(&mut encoder, &mut writer).await?;
        tokio::io::AsyncWriteExt::flush(&mut writer).await?;
    }

    let file_name = updater
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| InstallerError::Config("updater path has no file name".into()))?;
    let hash = HashRef::from_value(&value);
    Ok((
        InstallerInfo {
            size: bytes.len() as u64,
            hash: hash.clone(),
        },
        HashedFile {
            file_name,
            size: bytes.len() as u64,
            hash,
            installer: Some(true),
        },
    ))
}
