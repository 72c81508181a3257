use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use memmap2::Mmap;
use tokio::io::{AsyncRead, ReadBuf};

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, Result};
use crate::models::Manifest;
use crate::package::format::{
    self, Footer, PayloadEntry, Segment, FOOTER_LEN, SEG_CONFIG, SEG_INDEX, SEG_META, SEG_THEME,
};

/// Segment region contents plus the resolved payload index — produced
/// identically by the local self-reader and the remote range reader.
#[derive(Debug, Default)]
pub struct ParsedPackage {
    pub config_raw: Option<serde_json::Value>,
    pub config: Option<InstallerConfig>,
    pub theme: Option<Vec<u8>>,
    pub manifest: Option<Manifest>,
    pub payloads: Vec<PayloadEntry>,
}

impl ParsedPackage {
    pub fn find_payload(&self, name: &str) -> Option<&PayloadEntry> {
        self.payloads.iter().find(|entry| entry.name == name)
    }
}

/// Parse and validate a segment region against its footer and the total
/// package length.
pub fn parse_package(footer: &Footer, region: &[u8], total_size: u64) -> Result<ParsedPackage> {
    let region_len = footer.segment_region_len();
    if total_size < FOOTER_LEN as u64
        || footer.payload_start as u64 + region_len > total_size - FOOTER_LEN as u64
    {
        return Err(InstallerError::Format("segment region out of bounds".into()));
    }
    if region.len() as u64 != region_len {
        return Err(InstallerError::Format("segment region truncated".into()));
    }

    let segments = format::parse_segments(region)?;
    let mut expected = vec![
        (SEG_CONFIG, footer.config_size),
        (SEG_THEME, footer.theme_size),
        (SEG_INDEX, footer.index_size),
        (SEG_META, footer.metadata_size),
    ];
    expected.retain(|(_, size)| *size > 0);
    if segments.len() != expected.len() {
        return Err(InstallerError::Format(
            "segment region does not match footer".into(),
        ));
    }
    for (segment, (name, size)) in segments.iter().zip(&expected) {
        if segment.name != *name
            || format::framed_size(&segment.name, segment.payload.len()) as u32 != *size
        {
            return Err(InstallerError::Format(
                "segment region does not match footer".into(),
            ));
        }
    }

    let mut parsed = ParsedPackage::default();
    for Segment { name, payload } in segments {
        match name.as_str() {
            SEG_CONFIG => {
                let raw: serde_json::Value = serde_json::from_slice(&payload)
                    .map_err(|err| InstallerError::Format(format!("config segment: {err}")))?;
                parsed.config = Some(InstallerConfig::from_json(&raw)?);
                parsed.config_raw = Some(raw);
            }
            SEG_THEME => parsed.theme = Some(payload),
            SEG_META => {
                let manifest: Manifest = serde_json::from_slice(&payload)
                    .map_err(|err| InstallerError::Format(format!("metadata segment: {err}")))?;
                manifest.validate()?;
                parsed.manifest = Some(manifest);
            }
            SEG_INDEX => {
                let addressable_end = total_size - FOOTER_LEN as u64;
                for entry in format::decode_index(&payload)? {
                    let offset = footer.payload_start as u64 + entry.offset as u64;
                    if offset + entry.size as u64 > addressable_end {
                        return Err(InstallerError::Format(format!(
                            "index entry out of range: {:?}",
                            entry.name.replace('\0', "\\0")
                        )));
                    }
                    parsed.payloads.push(PayloadEntry {
                        name: entry.name,
                        offset,
                        size: entry.size as u64,
                    });
                }
            }
            _ => unreachable!("parse_segments rejects unknown names"),
        }
    }
    Ok(parsed)
}

/// Read-only view over this (or any) packed executable, backed by a shared
/// memory map.
pub struct SelfPackage {
    pub path: PathBuf,
    pub footer: Footer,
    pub parsed: ParsedPackage,
    mmap: Mmap,
}

impl SelfPackage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let footer = Footer::decode_from_tail(&mmap)?;
        let region_start = footer.payload_start as usize;
        let region_len = footer.segment_region_len() as usize;
        if region_start + region_len + FOOTER_LEN > mmap.len() {
            return Err(InstallerError::Format("segment region out of bounds".into()));
        }
        let parsed = parse_package(
            &footer,
            &mmap[region_start..region_start + region_len],
            mmap.len() as u64,
        )?;
        Ok(Self {
            path: path.to_path_buf(),
            footer,
            parsed,
            mmap,
        })
    }

    pub fn find_payload(&self, name: &str) -> Option<&PayloadEntry> {
        self.parsed.find_payload(name)
    }

    pub fn payload_bytes(&self, entry: &PayloadEntry) -> &[u8] {
        &self.mmap[entry.offset as usize..(entry.offset + entry.size) as usize]
    }

    /// Stub plus configured segments (`\0CONFIG`, `\0THEME`) with a fresh
    /// footer carrying zero index/metadata sizes. This is the byte-stable
    /// maintenance-binary base used for the uninstaller and updater.
    pub fn base_with_config(&self) -> Vec<u8> {
        let base_end =
            self.footer.payload_start + self.footer.config_size + self.footer.theme_size;
        let mut out = self.mmap[..base_end as usize].to_vec();
        let footer = Footer {
            payload_start: self.footer.payload_start,
            config_size: self.footer.config_size,
            theme_size: self.footer.theme_size,
            index_size: 0,
            metadata_size: 0,
        };
        out.extend_from_slice(&footer.encode());
        out
    }
}

impl std::fmt::Debug for SelfPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfPackage")
            .field("path", &self.path)
            .field("payloads", &self.parsed.payloads.len())
            .finish()
    }
}

/// Async reader over one embedded payload. The map is read-only and safely
/// aliased across workers.
pub struct PayloadReader {
    package: Arc<SelfPackage>,
    pos: usize,
    end: usize,
}

impl PayloadReader {
    pub fn new(package: Arc<SelfPackage>, entry: &PayloadEntry) -> Self {
        Self {
            pos: entry.offset as usize,
            end: (entry.offset + entry.size) as usize,
            package,
        }
    }
}

impl AsyncRead for PayloadReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.end {
            let take = buf.remaining().min(self.end - self.pos);
            let at = self.pos;
            buf.put_slice(&self.package.mmap[at..at + take]);
            self.pos += take;
        }
        Poll::Ready(Ok(()))
    }
}
