use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::ZstdEncoder;
use tokio::io::BufReader;

use crate::delta;
use crate::errors::{InstallerError, Result};
use crate::models::{HashAlgorithm, HashRef, HashedFile, PatchRecord};
use crate::utils::hash::{hash_bytes, hash_file};

/// Pairs below this combined size ship as full payloads; a diff is not
/// worth the patch-stream overhead.
const MIN_COMBINED_SIZE: u64 = 64 * 1024;

pub struct DiffRequest<'a> {
    pub old_dirs: &'a [PathBuf],
    pub new_dir: &'a Path,
    pub new_files: &'a [HashedFile],
    pub output_dir: &'a Path,
    pub algorithm: HashAlgorithm,
}

/// Generate `{from}_{to}` patch blobs for files shared with prior
/// versions. A patch is dropped when it exceeds half the new file; when
/// the same pair is produced twice only the smallest blob survives.
pub async fn diff_tree(req: DiffRequest<'_>) -> Result<Vec<PatchRecord>> {
    let mut produced: HashMap<String, PatchRecord> = HashMap::new();
    for old_dir in req.old_dirs {
        for file in req.new_files {
            if file.is_installer() {
                continue;
            }
            let old_path = old_dir.join(&file.file_name);
            if !old_path.exists() {
                continue;
            }
            let old_size = tokio::fs::metadata(&old_path).await?.len();
            if old_size + file.size < MIN_COMBINED_SIZE {
                continue;
            }
            let old_hash = hash_file(req.algorithm, &old_path).await?;
            if old_hash.to_hex() == file.hash.hex() {
                continue;
            }

            let pair = format!("{}_{}", old_hash.to_hex(), file.hash.hex());
            let blob_path = req.output_dir.join(&pair);
            let new_path = req.new_dir.join(&file.file_name);
            let patch_size = generate_patch_blob(&old_path, &new_path, &blob_path).await?;
            if patch_size > file.size / 2 {
                tokio::fs::remove_file(&blob_path).await?;
                tracing::info!(file = %file.file_name, "diff larger than half the target, dropped");
                continue;
            }
            let record = PatchRecord {
                size: patch_size,
                from: HashRef::from_value(&old_hash),
                to: file.hash.clone(),
            };
            match produced.get(&pair) {
                Some(existing) if existing.size <= patch_size => {}
                _ => {
                    produced.insert(pair, record);
                }
            }
        }
    }
    let mut patches: Vec<PatchRecord> = produced.into_values().collect();
    patches.sort_by(|a, b| (a.from.hex(), a.to.hex()).cmp(&(b.from.hex(), b.to.hex())));
    Ok(patches)
}

/// Delta the pair, wrap the op stream in zstd, return the blob size.
async fn generate_patch_blob(old_path: &Path, new_path: &Path, blob_path: &Path) -> Result<u64> {
    let old = tokio::fs::read(old_path).await?;
    let new = tokio::fs::read(new_path).await?;
    let encoded = tokio::task::spawn_blocking(move || delta::encode(&delta::generate(&old, &new)))
        .await
        .map_err(|err| InstallerError::Config(format!("diff worker died: {err}")))?;

    let mut encoder = ZstdEncoder::new(BufReader::new(std::io::Cursor::new(encoded)));
    let out = tokio::fs::File::create(blob_path).await?;
    let mut writer = tokio::io::BufWriter::new(out);
    tokio::io::copy(&mut encoder, &mut writer).await?;
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;
    Ok(tokio::fs::metadata(blob_path).await?.len())
}

/// Files present in a prior version but absent from the new tree; these
/// become the manifest's `deletes` list.
pub async fn list_deletes(
    old_dirs: &[PathBuf],
    new_files: &[HashedFile],
) -> Result<Vec<String>> {
    let current: BTreeSet<&str> = new_files.iter().map(|f| f.file_name.as_str()).collect();
    let mut deletes = BTreeSet::new();
    for old_dir in old_dirs {
        for (rel, _) in crate::builder::hasher::walk_tree(old_dir).await? {
            if !current.contains(rel.as_str()) {
                deletes.insert(rel);
            }
        }
    }
    Ok(deletes.into_iter().collect())
}
