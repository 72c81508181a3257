//! Wire layout of the self-addressable package: `!IN\0`-framed segments in
//! the header region, raw payload blobs addressed by the `\0INDEX` segment,
//! and a fixed 38-byte footer at the exact tail of the file.

use crate::errors::{InstallerError, Result};

pub const FOOTER_MAGIC: &[u8; 18] = b"!KachinaInstaller!";
pub const SEGMENT_MAGIC: &[u8; 4] = b"!IN\0";
/// Magic plus five big-endian u32 size fields.
pub const FOOTER_LEN: usize = FOOTER_MAGIC.len() + 5 * 4;

pub const SEG_CONFIG: &str = "\0CONFIG";
pub const SEG_THEME: &str = "\0THEME";
pub const SEG_INDEX: &str = "\0INDEX";
pub const SEG_META: &str = "\0META";
pub const KNOWN_SEGMENTS: [&str; 4] = [SEG_CONFIG, SEG_THEME, SEG_INDEX, SEG_META];

/// Index name of the bundled updater payload; content payloads use hash hex.
pub const INSTALLER_ENTRY: &str = "\0INSTALLER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub payload_start: u32,
    pub config_size: u32,
    pub theme_size: u32,
    pub index_size: u32,
    pub metadata_size: u32,
}

impl Footer {
    /// Total framed length of the segment region.
    pub fn segment_region_len(&self) -> u64 {
        self.config_size as u64
            + self.theme_size as u64
            + self.index_size as u64
            + self.metadata_size as u64
    }

    /// Absolute offset where raw payload blobs begin.
    pub fn payload_region_start(&self) -> u64 {
        self.payload_start as u64 + self.segment_region_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = FOOTER_MAGIC.to_vec();
        for field in [
            self.payload_start,
            self.config_size,
            self.theme_size,
            self.index_size,
            self.metadata_size,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out
    }

    /// Decode from the last bytes of a file. `tail` must end at EOF.
    pub fn decode_from_tail(tail: &[u8]) -> Result<Self> {
        if tail.len() < FOOTER_LEN {
            return Err(InstallerError::Format("truncated footer".into()));
        }
        let footer = &tail[tail.len() - FOOTER_LEN..];
        if &footer[..FOOTER_MAGIC.len()] != FOOTER_MAGIC {
            return Err(InstallerError::Format("package tail magic missing".into()));
        }
        let mut fields = [0u32; 5];
        for (i, field) in fields.iter_mut().enumerate() {
            let at = FOOTER_MAGIC.len() + i * 4;
            *field = u32::from_be_bytes(footer[at..at + 4].try_into().unwrap());
        }
        Ok(Self {
            payload_start: fields[0],
            config_size: fields[1],
            theme_size: fields[2],
            index_size: fields[3],
            metadata_size: fields[4],
        })
    }
}

/// Zero the footer's index and metadata size fields in place. Returns false
/// when the buffer carries no footer. Used to keep updater payloads built
/// from identical inputs byte-identical.
pub fn normalize_footer(buf: &mut [u8]) -> bool {
    if buf.len() < FOOTER_LEN {
        return false;
    }
    let magic_at = buf.len() - FOOTER_LEN;
    if &buf[magic_at..magic_at + FOOTER_MAGIC.len()] != FOOTER_MAGIC {
        return false;
    }
    let fields_at = buf.len() - 8;
    buf[fields_at..].fill(0);
    true
}

/// Framed size of a segment: magic, name length, name, payload length.
pub fn header_size(name: &str) -> usize {
    SEGMENT_MAGIC.len() + 2 + name.len() + 4
}

pub fn framed_size(name: &str, payload_len: usize) -> usize {
    header_size(name) + payload_len
}

pub fn encode_segment_header(name: &str, payload_len: u32) -> Vec<u8> {
    let mut out = SEGMENT_MAGIC.to_vec();
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub payload: Vec<u8>,
}

/// Strict walk over the segment region: every byte must belong to a framed,
/// known-name segment.
pub fn parse_segments(region: &[u8]) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut at = 0;
    while at < region.len() {
        let header_min = SEGMENT_MAGIC.len() + 2;
        if at + header_min > region.len() {
            return Err(InstallerError::Format("segment truncated".into()));
        }
        if &region[at..at + SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
            return Err(InstallerError::Format("segment magic missing".into()));
        }
        at += SEGMENT_MAGIC.len();
        let name_len = u16::from_be_bytes(region[at..at + 2].try_into().unwrap()) as usize;
        at += 2;
        if at + name_len + 4 > region.len() {
            return Err(InstallerError::Format("segment truncated".into()));
        }
        let name = String::from_utf8_lossy(&region[at..at + name_len]).to_string();
        if !KNOWN_SEGMENTS.contains(&name.as_str()) {
            return Err(InstallerError::Format(format!(
                "unknown segment name: {:?}",
                name.replace('\0', "\\0")
            )));
        }
        at += name_len;
        let payload_len = u32::from_be_bytes(region[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        if at + payload_len > region.len() {
            return Err(InstallerError::Format("segment truncated".into()));
        }
        segments.push(Segment {
            name,
            payload: region[at..at + payload_len].to_vec(),
        });
        at += payload_len;
    }
    Ok(segments)
}

/// Wire form of one `\0INDEX` record: name, size, offset relative to
/// `payload_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub size: u32,
    pub offset: u32,
}

/// An index record with its offset resolved to an absolute file position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

pub fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.push(entry.name.len() as u8);
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(&entry.size.to_be_bytes());
        out.extend_from_slice(&entry.offset.to_be_bytes());
    }
    out
}

pub fn decode_index(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    let mut at = 0;
    while at < bytes.len() {
        let name_len = bytes[at] as usize;
        at += 1;
        if at + name_len + 8 > bytes.len() {
            return Err(InstallerError::Format("index truncated".into()));
        }
        let name = String::from_utf8_lossy(&bytes[at..at + name_len]).to_string();
        at += name_len;
        let size = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;
        let offset = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;
        entries.push(IndexEntry { name, size, offset });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            payload_start: 1024,
            config_size: 64,
            theme_size: 0,
            index_size: 48,
            metadata_size: 256,
        };
        let bytes = footer.encode();
        assert_eq!(bytes.len(), FOOTER_LEN);
        assert_eq!(Footer::decode_from_tail(&bytes).unwrap(), footer);
        assert_eq!(footer.segment_region_len(), 64 + 48 + 256);
        assert_eq!(footer.payload_region_start(), 1024 + 64 + 48 + 256);
    }

    #[test]
    fn footer_rejects_missing_magic() {
        let err = Footer::decode_from_tail(&[0u8; FOOTER_LEN]).unwrap_err();
        assert!(err.to_string().contains("magic"));
        let err = Footer::decode_from_tail(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn normalize_footer_zeroes_index_fields() {
        let footer = Footer {
            payload_start: 10,
            config_size: 20,
            theme_size: 30,
            index_size: 40,
            metadata_size: 50,
        };
        let mut buf = b"stub".to_vec();
        buf.extend_from_slice(&footer.encode());
        assert!(normalize_footer(&mut buf));
        let normalized = Footer::decode_from_tail(&buf).unwrap();
        assert_eq!(normalized.payload_start, 10);
        assert_eq!(normalized.config_size, 20);
        assert_eq!(normalized.theme_size, 30);
        assert_eq!(normalized.index_size, 0);
        assert_eq!(normalized.metadata_size, 0);
        assert!(!normalize_footer(&mut b"no footer here".to_vec()));
    }

    #[test]
    fn segment_roundtrip() {
        let mut region = encode_segment_header(SEG_CONFIG, 2);
        region.extend_from_slice(b"{}");
        region.extend_from_slice(&encode_segment_header(SEG_META, 4));
        region.extend_from_slice(b"null");
        let segments = parse_segments(&region).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, SEG_CONFIG);
        assert_eq!(segments[0].payload, b"{}");
        assert_eq!(segments[1].name, SEG_META);
    }

    #[test]
    fn segment_parser_rejects_unknown_names() {
        let mut region = encode_segment_header("\0EVIL", 0);
        let err = parse_segments(&region).unwrap_err();
        assert!(err.to_string().contains("unknown segment"));
        region.truncate(3);
        assert!(parse_segments(&region).is_err());
    }

    #[test]
    fn index_roundtrip() {
        let entries = vec![
            IndexEntry {
                name: INSTALLER_ENTRY.into(),
                size: 10,
                offset: 0,
            },
            IndexEntry {
                name: "ef46db3751d8e999".into(),
                size: 2048,
                offset: 10,
            },
        ];
        let decoded = decode_index(&encode_index(&entries)).unwrap();
        assert_eq!(decoded, entries);
        assert!(decode_index(&[5, b'a']).is_err());
    }
}
