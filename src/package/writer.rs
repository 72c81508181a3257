use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::errors::{InstallerError, Result};
use crate::models::Manifest;
use crate::package::format::{
    self, Footer, IndexEntry, INSTALLER_ENTRY, SEG_CONFIG, SEG_INDEX, SEG_META, SEG_THEME,
};

pub struct PackInputs {
    pub stub: PathBuf,
    pub config: serde_json::Value,
    pub theme: Option<Vec<u8>>,
    pub metadata: Option<Manifest>,
    pub hashed_dir: Option<PathBuf>,
    pub output: PathBuf,
}

#[derive(Debug)]
pub struct PackSummary {
    pub output: PathBuf,
    pub total_size: u64,
    pub payload_count: usize,
}

struct Blob {
    name: String,
    path: PathBuf,
    size: u64,
}

/// Produce the self-addressable executable: stub, framed segments in fixed
/// order, raw payload blobs, tail footer. Single forward pass — the index
/// is sized before anything is written, so no seek-back is needed.
pub async fn pack(inputs: PackInputs) -> Result<PackSummary> {
    let stub = tokio::fs::read(&inputs.stub).await?;
    if stub.len() < 64 || &stub[..2] != b"MZ" {
        return Err(InstallerError::Format(format!(
            "invalid stub {}: missing MZ header",
            inputs.stub.display()
        )));
    }

    let config_bytes = serde_json::to_vec(&inputs.config)?;
    let metadata_bytes = match &inputs.metadata {
        Some(manifest) => {
            manifest.validate()?;
            Some(serde_json::to_vec(manifest)?)
        }
        None => None,
    };
    if metadata_bytes.is_some() && inputs.hashed_dir.is_none() {
        return Err(InstallerError::Config(
            "packing metadata requires a hashed dir".into(),
        ));
    }

    let blobs = match (&inputs.metadata, &inputs.hashed_dir) {
        (Some(manifest), Some(dir)) => collect_blobs(manifest, dir).await?,
        _ => Vec::new(),
    };

    // Index records: one per blob, plus the tagged updater alias.
    let mut index = Vec::new();
    let mut blob_offsets = BTreeMap::new();
    let config_size = format::framed_size(SEG_CONFIG, config_bytes.len()) as u64;
    let theme_size = inputs
        .theme
        .as_ref()
        .map(|theme| format::framed_size(SEG_THEME, theme.len()) as u64)
        .unwrap_or(0);
    let metadata_size = metadata_bytes
        .as_ref()
        .map(|bytes| format::framed_size(SEG_META, bytes.len()) as u64)
        .unwrap_or(0);
    let index_size = if blobs.is_empty() {
        0
    } else {
        let entry_count = blobs.len() + usize::from(installer_hash(&inputs.metadata).is_some());
        let body: usize = blobs
            .iter()
            .map(|blob| 1 + blob.name.len() + 8)
            .sum::<usize>()
            + installer_hash(&inputs.metadata)
                .map(|_| 1 + INSTALLER_ENTRY.len() + 8)
                .unwrap_or(0);
        debug_assert!(entry_count <= u32::MAX as usize);
        format::framed_size(SEG_INDEX, body) as u64
    };

    let segment_region = config_size + theme_size + index_size + metadata_size;
    let mut running = segment_region;
    for blob in &blobs {
        if running > u32::MAX as u64 || blob.size > u32::MAX as u64 {
            return Err(InstallerError::Format(format!(
                "payload exceeds addressable range: {}",
                blob.name
            )));
        }
        blob_offsets.insert(blob.name.clone(), (running as u32, blob.size as u32));
        index.push(IndexEntry {
            name: blob.name.clone(),
            size: blob.size as u32,
            offset: running as u32,
        });
        running += blob.size;
    }
    if let Some(hex) = installer_hash(&inputs.metadata) {
        let (offset, size) = *blob_offsets.get(&hex).ok_or_else(|| {
            InstallerError::NotFound(format!("installer payload {hex} missing from hashed dir"))
        })?;
        index.push(IndexEntry {
            name: INSTALLER_ENTRY.to_string(),
            size,
            offset,
        });
    }
    index.sort_by(|a, b| a.name.cmp(&b.name));

    let payload_start = stub.len() as u64;
    if payload_start > u32::MAX as u64 {
        return Err(InstallerError::Format(
            "payload exceeds addressable range: stub too large".into(),
        ));
    }
    let footer = Footer {
        payload_start: payload_start as u32,
        config_size: config_size as u32,
        theme_size: theme_size as u32,
        index_size: index_size as u32,
        metadata_size: metadata_size as u32,
    };

    let out_file = tokio::fs::File::create(&inputs.output).await?;
    let mut out = BufWriter::new(out_file);
    out.write_all(&stub).await?;
    out.write_all(&format::encode_segment_header(
        SEG_CONFIG,
        config_bytes.len() as u32,
    ))
    .await?;
    out.write_all(&config_bytes).await?;
    if let Some(theme) = &inputs.theme {
        out.write_all(&format::encode_segment_header(SEG_THEME, theme.len() as u32))
            .await?;
        out.write_all(theme).await?;
    }
    if index_size > 0 {
        let index_bytes = format::encode_index(&index);
        out.write_all(&format::encode_segment_header(
            SEG_INDEX,
            index_bytes.len() as u32,
        ))
        .await?;
        out.write_all(&index_bytes).await?;
    }
    if let Some(bytes) = &metadata_bytes {
        out.write_all(&format::encode_segment_header(SEG_META, bytes.len() as u32))
            .await?;
        out.write_all(bytes).await?;
    }
    for blob in &blobs {
        let mut file = tokio::fs::File::open(&blob.path).await?;
        let copied = tokio::io::copy(&mut file, &mut out).await?;
        if copied != blob.size {
            return Err(InstallerError::Format(format!(
                "staged payload {} changed size during pack",
                blob.name
            )));
        }
    }
    out.write_all(&footer.encode()).await?;
    out.flush().await?;

    let total_size = payload_start + segment_region + blobs.iter().map(|b| b.size).sum::<u64>()
        + format::FOOTER_LEN as u64;
    tracing::info!(
        output = %inputs.output.display(),
        payloads = blobs.len(),
        total_size,
        "packed"
    );
    Ok(PackSummary {
        output: inputs.output,
        total_size,
        payload_count: blobs.len(),
    })
}

fn installer_hash(metadata: &Option<Manifest>) -> Option<String> {
    metadata
        .as_ref()
        .and_then(|m| m.installer.as_ref())
        .map(|info| info.hash.hex().to_string())
}

/// Deduplicated staged blobs referenced by the manifest, sorted by name for
/// a deterministic layout.
async fn collect_blobs(manifest: &Manifest, dir: &PathBuf) -> Result<Vec<Blob>> {
    let mut sizes_by_hash: BTreeMap<String, u64> = BTreeMap::new();
    let mut names = Vec::new();
    for file in &manifest.hashed {
        let hex = file.hash.hex().to_string();
        if hex.is_empty() {
            return Err(InstallerError::Config(format!(
                "no hash recorded for {}",
                file.file_name
            )));
        }
        match sizes_by_hash.get(&hex) {
            Some(size) if *size != file.size => {
                return Err(InstallerError::Format(format!(
                    "duplicate hash {hex} with conflicting sizes"
                )));
            }
            Some(_) => continue,
            None => {
                sizes_by_hash.insert(hex.clone(), file.size);
                names.push(hex);
            }
        }
    }
    for patch in manifest.patches.as_deref().unwrap_or_default() {
        let name = format!("{}_{}", patch.from.hex(), patch.to.hex());
        if !names.contains(&name) {
            names.push(name);
        }
    }

    names.sort();
    let mut blobs = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let meta = tokio::fs::metadata(&path).await.map_err(|_| {
            InstallerError::NotFound(format!("staged payload missing: {}", path.display()))
        })?;
        blobs.push(Blob {
            name,
            path,
            size: meta.len(),
        });
    }
    Ok(blobs)
}
