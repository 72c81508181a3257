use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::{InstallerError, Result};
use crate::models::{compare_tags, HashAlgorithm, HashValue, HashedFile, Manifest, PatchRecord};
use crate::package::format::PayloadEntry;
use crate::package::reader::ParsedPackage;
use crate::utils::hash::hash_file;
use crate::utils::paths::{is_user_data_path, to_os_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub size: u64,
}

impl From<&PayloadEntry> for Span {
    fn from(entry: &PayloadEntry) -> Self {
        Self {
            offset: entry.offset,
            size: entry.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSpan {
    Embedded(Span),
    Remote(Span),
}

impl SourceSpan {
    pub fn size(&self) -> u64 {
        match self {
            Self::Embedded(span) | Self::Remote(span) => span.size,
        }
    }

    pub fn remote_span(&self) -> Option<Span> {
        match self {
            Self::Remote(span) => Some(*span),
            Self::Embedded(_) => None,
        }
    }
}

/// The four install modes, first applicable wins in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Target payload lives in the running package: decompress and write.
    Local { blob: Span },
    /// Embedded old-version blob as base, diff fetched separately.
    HybridPatch { base: Span, diff: SourceSpan },
    /// On-disk file as base, diff fetched separately.
    Patch { diff: SourceSpan },
    /// Full payload from the remote package.
    Direct { blob: Span },
}

impl InstallMode {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::HybridPatch { .. } => "hybrid-patch",
            Self::Patch { .. } => "patch",
            Self::Direct { .. } => "direct",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    /// Bytes pulled over the wire (or out of the embedded region) for
    /// this task; drives queue classification and ordering.
    pub fn transfer_size(&self) -> u64 {
        match self {
            Self::Local { blob } | Self::Direct { blob } => blob.size,
            Self::Patch { diff } => diff.size(),
            Self::HybridPatch { base, diff } => base.size + diff.size(),
        }
    }

    /// The remote span the range merger may fold; per the selection rules
    /// only direct payloads and on-disk patch diffs qualify.
    pub fn mergeable_span(&self) -> Option<Span> {
        match self {
            Self::Direct { blob } => Some(*blob),
            Self::Patch { diff } => diff.remote_span(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffTask {
    pub target: HashedFile,
    pub target_hash: HashValue,
    pub local_hash: Option<HashValue>,
    pub patch: Option<PatchRecord>,
    pub installer: bool,
    pub unwritable: bool,
    pub skip_hash: bool,
    pub mode: InstallMode,
    /// Remote full-payload span used when retries force `Direct`.
    pub direct_fallback: Option<Span>,
}

#[derive(Debug)]
pub struct InstallPlan {
    pub tag_name: String,
    pub algorithm: HashAlgorithm,
    pub tasks: Vec<DiffTask>,
    pub deletes: Vec<String>,
    /// Manifest entries already satisfied on disk.
    pub satisfied: usize,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn unwritable_files(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|task| task.unwritable)
            .map(|task| task.target.file_name.clone())
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.mode.transfer_size()).sum()
    }
}

pub struct PlanRequest<'a> {
    pub manifest: &'a Manifest,
    pub install_dir: &'a Path,
    pub embedded: Option<&'a ParsedPackage>,
    pub remote: Option<&'a ParsedPackage>,
    /// Normalized prefixes whose on-disk state is never touched.
    pub user_data_paths: &'a [String],
}

/// Fail a run that would move an installation backwards.
pub fn check_downgrade(installed_tag: Option<&str>, target_tag: &str) -> Result<()> {
    if let Some(installed) = installed_tag {
        if compare_tags(installed, target_tag) == Ordering::Greater {
            return Err(InstallerError::State(format!(
                "version downgrade attempt: {installed} is newer than {target_tag}"
            )));
        }
    }
    Ok(())
}

/// Hash the relevant local files, diff them against the target manifest
/// and classify every outstanding target into an install mode.
pub async fn plan(req: PlanRequest<'_>) -> Result<InstallPlan> {
    let manifest = req.manifest;
    manifest.validate()?;
    let algorithm = manifest.algorithm()?;

    let local_hashes = hash_local_files(req.install_dir, manifest, algorithm, req.user_data_paths)
        .await?;

    let mut tasks = Vec::new();
    let mut satisfied = 0usize;
    for target in &manifest.hashed {
        if is_user_data_path(&target.file_name, req.user_data_paths) {
            satisfied += 1;
            continue;
        }
        let target_hash = target.hash.value()?;
        let local_hash = local_hashes.get(&target.file_name).copied().flatten();
        if local_hash == Some(target_hash) {
            satisfied += 1;
            continue;
        }

        let target_hex = target.hash.hex();
        let embedded_blob = req
            .embedded
            .and_then(|pkg| pkg.find_payload(target_hex))
            .map(Span::from);
        let remote_blob = req
            .remote
            .and_then(|pkg| pkg.find_payload(target_hex))
            .map(Span::from);

        let local_patch = local_hash.and_then(|local| {
            find_patch(manifest, |p| {
                p.to.hex() == target_hex && p.from.hex() == local.to_hex()
            })
        });
        let hybrid_patch = req.embedded.and_then(|pkg| {
            find_patch(manifest, |p| {
                p.to.hex() == target_hex && pkg.find_payload(p.from.hex()).is_some()
            })
        });

        let target_path = to_os_path(req.install_dir, &target.file_name);
        let (mode, patch) = select_mode(SelectInputs {
            embedded_blob,
            remote_blob,
            local_patch,
            hybrid_patch,
            local_file_on_disk: target_path.exists() && local_hash.is_some(),
            embedded: req.embedded,
            remote: req.remote,
        })
        .ok_or_else(|| {
            InstallerError::NotFound(format!(
                "no payload source for {} ({target_hex})",
                target.file_name
            ))
        })?;

        let installer = target.is_installer();
        let unwritable = if installer || !target_path.exists() {
            false
        } else {
            crate::utils::file::is_unwritable(&target_path).await
        };

        tasks.push(DiffTask {
            target: target.clone(),
            target_hash,
            local_hash,
            patch,
            installer,
            unwritable,
            skip_hash: false,
            mode,
            direct_fallback: remote_blob,
        });
    }

    // Largest transfers first so the big queue fills early.
    tasks.sort_by(|a, b| b.mode.transfer_size().cmp(&a.mode.transfer_size()));

    let deletes = manifest
        .deletes
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|d| crate::utils::paths::normalize_rel(&d))
        .collect();

    Ok(InstallPlan {
        tag_name: manifest.tag_name.clone(),
        algorithm,
        tasks,
        deletes,
        satisfied,
    })
}

fn find_patch(manifest: &Manifest, pred: impl Fn(&PatchRecord) -> bool) -> Option<PatchRecord> {
    manifest
        .patches
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|p| pred(p))
        .cloned()
}

struct SelectInputs<'a> {
    embedded_blob: Option<Span>,
    remote_blob: Option<Span>,
    local_patch: Option<PatchRecord>,
    hybrid_patch: Option<PatchRecord>,
    local_file_on_disk: bool,
    embedded: Option<&'a ParsedPackage>,
    remote: Option<&'a ParsedPackage>,
}

fn diff_source(
    patch: &PatchRecord,
    embedded: Option<&ParsedPackage>,
    remote: Option<&ParsedPackage>,
) -> Option<SourceSpan> {
    let name = format!("{}_{}", patch.from.hex(), patch.to.hex());
    if let Some(entry) = embedded.and_then(|pkg| pkg.find_payload(&name)) {
        return Some(SourceSpan::Embedded(entry.into()));
    }
    if let Some(entry) = remote.and_then(|pkg| pkg.find_payload(&name)) {
        return Some(SourceSpan::Remote(entry.into()));
    }
    None
}

fn select_mode(inputs: SelectInputs<'_>) -> Option<(InstallMode, Option<PatchRecord>)> {
    if let Some(blob) = inputs.embedded_blob {
        return Some((InstallMode::Local { blob }, None));
    }
    if let Some(patch) = &inputs.hybrid_patch {
        let base = inputs
            .embedded
            .and_then(|pkg| pkg.find_payload(patch.from.hex()))
            .map(Span::from);
        let diff = diff_source(patch, inputs.embedded, inputs.remote);
        if let (Some(base), Some(diff)) = (base, diff) {
            return Some((
                InstallMode::HybridPatch { base, diff },
                Some(patch.clone()),
            ));
        }
    }
    if let Some(patch) = &inputs.local_patch {
        if inputs.local_file_on_disk {
            if let Some(diff) = diff_source(patch, inputs.embedded, inputs.remote) {
                return Some((InstallMode::Patch { diff }, Some(patch.clone())));
            }
        }
    }
    inputs
        .remote_blob
        .map(|blob| (InstallMode::Direct { blob }, None))
}

/// Hash every local file named by the manifest. Missing files map to
/// `None`; the hashing fan-out is bounded and each worker yields at its
/// read boundaries.
async fn hash_local_files(
    install_dir: &Path,
    manifest: &Manifest,
    algorithm: HashAlgorithm,
    user_data_paths: &[String],
) -> Result<HashMap<String, Option<HashValue>>> {
    let cores = std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(4);
    let semaphore = Arc::new(Semaphore::new((2 * cores).clamp(4, 32)));
    let mut set = JoinSet::new();
    for target in &manifest.hashed {
        if is_user_data_path(&target.file_name, user_data_paths) {
            continue;
        }
        let name = target.file_name.clone();
        let path = to_os_path(install_dir, &name);
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            if !path.exists() {
                return Ok::<_, InstallerError>((name, None));
            }
            let value = hash_file(algorithm, &path).await?;
            Ok((name, Some(value)))
        });
    }
    let mut hashes = HashMap::new();
    while let Some(res) = set.join_next().await {
        let (name, value) =
            res.map_err(|err| InstallerError::Config(format!("hash worker died: {err}")))??;
        hashes.insert(name, value);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HashRef, InstallerInfo};
    use crate::utils::hash::hash_bytes;

    fn xxh_hex(data: &[u8]) -> String {
        hash_bytes(HashAlgorithm::Xxh, data).to_hex()
    }

    fn hashed(name: &str, data: &[u8]) -> HashedFile {
        HashedFile {
            file_name: name.into(),
            size: data.len() as u64,
            hash: HashRef {
                md5: None,
                xxh: Some(xxh_hex(data)),
            },
            installer: None,
        }
    }

    fn package_with(entries: &[(&str, u64, u64)]) -> ParsedPackage {
        ParsedPackage {
            payloads: entries
                .iter()
                .map(|(name, offset, size)| PayloadEntry {
                    name: name.to_string(),
                    offset: *offset,
                    size: *size,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn manifest_for(files: Vec<HashedFile>, patches: Option<Vec<PatchRecord>>) -> Manifest {
        Manifest {
            tag_name: "2.0.0".into(),
            hashed: files,
            patches,
            deletes: Some(vec!["readme.txt".into()]),
            installer: None,
        }
    }

    #[tokio::test]
    async fn satisfied_targets_produce_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"identical contents";
        std::fs::write(dir.path().join("app.bin"), data).unwrap();
        let manifest = manifest_for(vec![hashed("app.bin", data)], None);
        let plan = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: None,
            remote: Some(&package_with(&[(&xxh_hex(data), 4096, 64)])),
            user_data_paths: &[],
        })
        .await
        .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.satisfied, 1);
    }

    #[tokio::test]
    async fn embedded_payload_selects_local_mode() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"fresh file";
        let manifest = manifest_for(vec![hashed("app.bin", data)], None);
        let embedded = package_with(&[(&xxh_hex(data), 4096, 42)]);
        let plan = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: Some(&embedded),
            remote: None,
            user_data_paths: &[],
        })
        .await
        .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.tasks[0].mode.is_local());
    }

    #[tokio::test]
    async fn patch_mode_wins_over_direct_for_known_base() {
        let dir = tempfile::tempdir().unwrap();
        let old = b"version one contents";
        let new = b"version two contents";
        std::fs::write(dir.path().join("app.bin"), old).unwrap();
        let patch = PatchRecord {
            size: 64,
            from: HashRef {
                md5: None,
                xxh: Some(xxh_hex(old)),
            },
            to: HashRef {
                md5: None,
                xxh: Some(xxh_hex(new)),
            },
        };
        let manifest = manifest_for(vec![hashed("app.bin", new)], Some(vec![patch.clone()]));
        let diff_name = format!("{}_{}", xxh_hex(old), xxh_hex(new));
        let remote = package_with(&[(&xxh_hex(new), 4096, 1000), (&diff_name, 8192, 64)]);
        let plan = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: None,
            remote: Some(&remote),
            user_data_paths: &[],
        })
        .await
        .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        let task = &plan.tasks[0];
        assert!(matches!(
            task.mode,
            InstallMode::Patch {
                diff: SourceSpan::Remote(_)
            }
        ));
        assert_eq!(task.direct_fallback, Some(Span { offset: 4096, size: 1000 }));
    }

    #[tokio::test]
    async fn hybrid_patch_prefers_embedded_base() {
        let dir = tempfile::tempdir().unwrap();
        let old = b"version one contents";
        let new = b"version two contents";
        // on-disk copy differs from both versions
        std::fs::write(dir.path().join("app.bin"), b"corrupted").unwrap();
        let patch = PatchRecord {
            size: 64,
            from: HashRef {
                md5: None,
                xxh: Some(xxh_hex(old)),
            },
            to: HashRef {
                md5: None,
                xxh: Some(xxh_hex(new)),
            },
        };
        let manifest = manifest_for(vec![hashed("app.bin", new)], Some(vec![patch]));
        let diff_name = format!("{}_{}", xxh_hex(old), xxh_hex(new));
        let embedded = package_with(&[(&xxh_hex(old), 2048, 500)]);
        let remote = package_with(&[(&diff_name, 8192, 64)]);
        let plan = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: Some(&embedded),
            remote: Some(&remote),
            user_data_paths: &[],
        })
        .await
        .unwrap();
        assert!(matches!(
            plan.tasks[0].mode,
            InstallMode::HybridPatch { .. }
        ));
    }

    #[tokio::test]
    async fn user_data_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"saved game";
        let manifest = manifest_for(vec![hashed("saves/slot1.dat", data)], None);
        let plan = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: None,
            remote: None,
            user_data_paths: &["saves".to_string()],
        })
        .await
        .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(vec![hashed("app.bin", b"data")], None);
        let err = plan(PlanRequest {
            manifest: &manifest,
            install_dir: dir.path(),
            embedded: None,
            remote: None,
            user_data_paths: &[],
        })
        .await
        .unwrap_err();
        assert!(matches!(err, InstallerError::NotFound(_)));
    }

    #[test]
    fn downgrade_guard() {
        assert!(check_downgrade(Some("2.1.0"), "2.0.0").is_err());
        assert!(check_downgrade(Some("2.0.0"), "2.0.0").is_ok());
        assert!(check_downgrade(Some("1.9.9"), "2.0.0").is_ok());
        assert!(check_downgrade(None, "2.0.0").is_ok());
    }

    #[test]
    fn installer_info_shape_survives_serde() {
        let info = InstallerInfo {
            size: 1234,
            hash: HashRef {
                md5: None,
                xxh: Some("00000000000000ab".into()),
            },
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["size"], 1234);
        assert_eq!(json["xxh"], "00000000000000ab");
    }
}
