use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{InstallerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Xxh,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Xxh => "xxh",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Self::Md5),
            "xxh" => Ok(Self::Xxh),
            other => Err(InstallerError::Config(format!(
                "unknown hash algorithm: {other}"
            ))),
        }
    }
}

/// A manifest hash: 128-bit MD5 or 64-bit xxHash, tagged so values of
/// different algorithms never compare equal by accident.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashValue {
    Md5([u8; 16]),
    Xxh(u64),
}

impl HashValue {
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Md5(_) => HashAlgorithm::Md5,
            Self::Xxh(_) => HashAlgorithm::Xxh,
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            Self::Md5(bytes) => hex::encode(bytes),
            Self::Xxh(v) => format!("{v:016x}"),
        }
    }

    pub fn from_hex(algorithm: HashAlgorithm, s: &str) -> Result<Self> {
        let bad = |s: &str| InstallerError::Config(format!("invalid hash literal: {s}"));
        match algorithm {
            HashAlgorithm::Md5 => {
                let bytes = hex::decode(s).map_err(|_| bad(s))?;
                let arr: [u8; 16] = bytes.as_slice().try_into().map_err(|_| bad(s))?;
                Ok(Self::Md5(arr))
            }
            HashAlgorithm::Xxh => {
                let v = u64::from_str_radix(s, 16).map_err(|_| bad(s))?;
                Ok(Self::Xxh(v))
            }
        }
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.algorithm().as_str(), self.to_hex())
    }
}

/// The `"md5"`/`"xxh"` key pair as it appears on the wire. Exactly one of
/// the two is set in a well-formed manifest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HashRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xxh: Option<String>,
}

impl HashRef {
    pub fn from_value(value: &HashValue) -> Self {
        match value {
            HashValue::Md5(_) => Self {
                md5: Some(value.to_hex()),
                xxh: None,
            },
            HashValue::Xxh(_) => Self {
                md5: None,
                xxh: Some(value.to_hex()),
            },
        }
    }

    pub fn algorithm(&self) -> Result<HashAlgorithm> {
        match (&self.md5, &self.xxh) {
            (Some(_), None) => Ok(HashAlgorithm::Md5),
            (None, Some(_)) => Ok(HashAlgorithm::Xxh),
            _ => Err(InstallerError::Config(
                "entry must carry exactly one of md5/xxh".into(),
            )),
        }
    }

    pub fn value(&self) -> Result<HashValue> {
        let algorithm = self.algorithm()?;
        let hex = match algorithm {
            HashAlgorithm::Md5 => self.md5.as_deref().unwrap_or_default(),
            HashAlgorithm::Xxh => self.xxh.as_deref().unwrap_or_default(),
        };
        HashValue::from_hex(algorithm, hex)
    }

    pub fn hex(&self) -> &str {
        self.md5.as_deref().or(self.xxh.as_deref()).unwrap_or("")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HashedFile {
    pub file_name: String,
    pub size: u64,
    #[serde(flatten)]
    pub hash: HashRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer: Option<bool>,
}

impl HashedFile {
    pub fn is_installer(&self) -> bool {
        self.installer.unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PatchRecord {
    pub size: u64,
    pub from: HashRef,
    pub to: HashRef,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstallerInfo {
    pub size: u64,
    #[serde(flatten)]
    pub hash: HashRef,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Manifest {
    pub tag_name: String,
    pub hashed: Vec<HashedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<PatchRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer: Option<InstallerInfo>,
}

impl Manifest {
    /// The single hash algorithm used across all entries. Errors when
    /// entries mix algorithms.
    pub fn algorithm(&self) -> Result<HashAlgorithm> {
        let mut found: Option<HashAlgorithm> = None;
        let mut check = |hash: &HashRef| -> Result<()> {
            let alg = hash.algorithm()?;
            match found {
                None => {
                    found = Some(alg);
                    Ok(())
                }
                Some(prev) if prev == alg => Ok(()),
                Some(_) => Err(InstallerError::Config(
                    "manifest mixes hash algorithms".into(),
                )),
            }
        };
        for file in &self.hashed {
            check(&file.hash)?;
        }
        for patch in self.patches.as_deref().unwrap_or_default() {
            check(&patch.from)?;
            check(&patch.to)?;
        }
        if let Some(installer) = &self.installer {
            check(&installer.hash)?;
        }
        found.ok_or_else(|| InstallerError::Config("manifest has no hashed entries".into()))
    }

    /// Structural invariants: every patch target exists in `hashed`,
    /// and `deletes` never names a file that is also installed.
    pub fn validate(&self) -> Result<()> {
        self.algorithm()?;
        let hashes: HashSet<&str> = self.hashed.iter().map(|f| f.hash.hex()).collect();
        for patch in self.patches.as_deref().unwrap_or_default() {
            if !hashes.contains(patch.to.hex()) {
                return Err(InstallerError::Config(format!(
                    "patch target {} not present in hashed entries",
                    patch.to.hex()
                )));
            }
        }
        let names: HashSet<&str> = self.hashed.iter().map(|f| f.file_name.as_str()).collect();
        for delete in self.deletes.as_deref().unwrap_or_default() {
            if names.contains(delete.as_str()) {
                return Err(InstallerError::Config(format!(
                    "delete entry {delete} collides with an installed file"
                )));
            }
        }
        Ok(())
    }

    pub fn find_file(&self, file_name: &str) -> Option<&HashedFile> {
        self.hashed.iter().find(|f| f.file_name == file_name)
    }
}

/// Lenient dotted-numeric version ordering used by the downgrade guard.
/// Non-numeric components fall back to lexicographic comparison.
pub fn compare_tags(a: &str, b: &str) -> Ordering {
    let norm = |s: &str| s.trim().trim_start_matches(['v', 'V']).to_string();
    let a = norm(a);
    let b = norm(b);
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xxh_ref(hex: &str) -> HashRef {
        HashRef {
            md5: None,
            xxh: Some(hex.to_string()),
        }
    }

    #[test]
    fn hash_value_hex_roundtrip() {
        let v = HashValue::Xxh(0x00ab_cdef_0123_4567);
        assert_eq!(v.to_hex(), "00abcdef01234567");
        assert_eq!(HashValue::from_hex(HashAlgorithm::Xxh, &v.to_hex()).unwrap(), v);

        let m = HashValue::Md5([0xA5; 16]);
        assert_eq!(m.to_hex().len(), 32);
        assert_eq!(HashValue::from_hex(HashAlgorithm::Md5, &m.to_hex()).unwrap(), m);
    }

    #[test]
    fn cross_algorithm_values_never_equal() {
        let a = HashValue::Xxh(0);
        let b = HashValue::Md5([0; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_rejects_mixed_algorithms() {
        let manifest = Manifest {
            tag_name: "1.0.0".into(),
            hashed: vec![
                HashedFile {
                    file_name: "a".into(),
                    size: 1,
                    hash: xxh_ref("0000000000000001"),
                    installer: None,
                },
                HashedFile {
                    file_name: "b".into(),
                    size: 1,
                    hash: HashRef {
                        md5: Some("00000000000000000000000000000001".into()),
                        xxh: None,
                    },
                    installer: None,
                },
            ],
            patches: None,
            deletes: None,
            installer: None,
        };
        assert!(manifest.algorithm().is_err());
    }

    #[test]
    fn manifest_rejects_delete_collision() {
        let manifest = Manifest {
            tag_name: "1.0.0".into(),
            hashed: vec![HashedFile {
                file_name: "app.exe".into(),
                size: 1,
                hash: xxh_ref("0000000000000001"),
                installer: None,
            }],
            patches: None,
            deletes: Some(vec!["app.exe".into()]),
            installer: None,
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn manifest_rejects_dangling_patch_target() {
        let manifest = Manifest {
            tag_name: "1.0.0".into(),
            hashed: vec![HashedFile {
                file_name: "app.exe".into(),
                size: 1,
                hash: xxh_ref("0000000000000001"),
                installer: None,
            }],
            patches: Some(vec![PatchRecord {
                size: 10,
                from: xxh_ref("000000000000000a"),
                to: xxh_ref("000000000000000b"),
            }]),
            deletes: None,
            installer: None,
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn tag_ordering_is_numeric_per_component() {
        assert_eq!(compare_tags("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_tags("v2.0.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_tags("2.0.1", "2.0.0"), Ordering::Greater);
        assert_eq!(compare_tags("1.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn hashed_file_wire_shape() {
        let file = HashedFile {
            file_name: "data/assets.dat".into(),
            size: 10240,
            hash: xxh_ref("00abcdef01234567"),
            installer: None,
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["xxh"], "00abcdef01234567");
        assert!(json.get("md5").is_none());
        assert!(json.get("installer").is_none());
    }
}
