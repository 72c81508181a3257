use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::ZstdDecoder;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::errors::{InstallerError, Result};
use crate::package::format::{SEG_CONFIG, SEG_META};
use crate::package::reader::SelfPackage;
use crate::utils::paths::to_os_path;

#[derive(Debug, Clone)]
pub enum ExtractAction {
    /// Print every index entry with offset and size.
    List,
    /// Rebuild the full tree described by the embedded manifest.
    All(PathBuf),
    /// Print a named segment (`\0CONFIG`, `\0META`) as JSON.
    MetaName(String),
    /// Decompress one payload blob into the current directory.
    Name(String),
}

pub async fn extract(package_path: &Path, action: ExtractAction) -> Result<()> {
    let package = SelfPackage::open(package_path)?;
    match action {
        ExtractAction::List => {
            println!(
                "{:<34} {:>12} {:>12}",
                "name", "offset", "size"
            );
            for entry in &package.parsed.payloads {
                println!(
                    "{:<34} {:>12} {:>12}",
                    entry.name.replace('\0', "\\0"),
                    entry.offset,
                    entry.size
                );
            }
            Ok(())
        }
        ExtractAction::All(out_dir) => extract_all(&package, &out_dir).await,
        ExtractAction::MetaName(raw) => {
            let name = raw.replace("\\0", "\0");
            let json = match name.as_str() {
                SEG_CONFIG => package
                    .parsed
                    .config_raw
                    .as_ref()
                    .map(|v| serde_json::to_string_pretty(v))
                    .transpose()?,
                SEG_META => package
                    .parsed
                    .manifest
                    .as_ref()
                    .map(serde_json::to_string_pretty)
                    .transpose()?,
                _ => None,
            };
            match json {
                Some(json) => {
                    println!("{json}");
                    Ok(())
                }
                None => Err(InstallerError::NotFound(format!(
                    "no printable segment named {raw}"
                ))),
            }
        }
        ExtractAction::Name(name) => {
            let entry = package.find_payload(&name).cloned().ok_or_else(|| {
                InstallerError::NotFound(format!("no payload named {name}"))
            })?;
            decompress_payload(&package, &entry, Path::new(&name)).await?;
            println!("extracted {name}");
            Ok(())
        }
    }
}

/// Rebuild the original tree: every manifest entry's payload decompressed
/// to its normalized relative path.
async fn extract_all(package: &SelfPackage, out_dir: &Path) -> Result<()> {
    let manifest = package.parsed.manifest.as_ref().ok_or_else(|| {
        InstallerError::Format("package has no metadata segment to extract from".into())
    })?;
    for file in &manifest.hashed {
        let entry = package
            .find_payload(file.hash.hex())
            .cloned()
            .ok_or_else(|| {
                InstallerError::Format(format!("payload missing for {}", file.file_name))
            })?;
        let target = to_os_path(out_dir, &file.file_name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        decompress_payload(package, &entry, &target).await?;
        tracing::debug!(file = %file.file_name, "extracted");
    }
    Ok(())
}

async fn decompress_payload(
    package: &SelfPackage,
    entry: &crate::package::format::PayloadEntry,
    target: &Path,
) -> Result<()> {
    let bytes = package.payload_bytes(entry).to_vec();
    let mut decoder = ZstdDecoder::new(BufReader::new(std::io::Cursor::new(bytes)));
    let out = tokio::fs::File::create(target).await?;
    let mut writer = tokio::io::BufWriter::new(out);
    tokio::io::copy(&mut decoder, &mut writer).await?;
    writer.flush().await?;
    Ok(())
}
