use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::errors::{InstallerError, Result};
use crate::models::Manifest;
use crate::package::RemotePackage;
use crate::utils::url::sanitize_url_for_logging;

/// Turns a configured source URL into a target manifest and a concrete
/// package URL for range fetches. Implementations are chosen by URL scheme
/// prefix; the two shipped variants are direct HTTP and the session
/// handshake protocol.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn resolve_metadata(&self, client: &Client) -> Result<Manifest>;
    async fn resolve_chunk_url(&self, client: &Client) -> Result<String>;
    async fn create_session(&self, _client: &Client) -> Result<()> {
        Ok(())
    }
    async fn end_session(&self, _client: &Client) -> Result<()> {
        Ok(())
    }
}

pub fn source_for(spec: &str, extras: Option<String>) -> Result<Box<dyn UpdateSource>> {
    if let Some(rest) = spec.strip_prefix("session+") {
        return Ok(Box::new(SessionSource::new(rest.to_string(), extras)));
    }
    if spec.starts_with("http://") || spec.starts_with("https://") {
        return Ok(Box::new(DirectHttpSource {
            url: spec.to_string(),
        }));
    }
    Err(InstallerError::Config(format!(
        "no source plugin for {}",
        sanitize_url_for_logging(spec)
    )))
}

/// The source URL points straight at a hosted package; metadata is its
/// `\0META` segment, fetched by range without touching payloads.
pub struct DirectHttpSource {
    pub url: String,
}

#[async_trait]
impl UpdateSource for DirectHttpSource {
    async fn resolve_metadata(&self, client: &Client) -> Result<Manifest> {
        let remote = RemotePackage::open(client, &self.url).await?;
        remote.parsed.manifest.ok_or_else(|| {
            InstallerError::Format(format!(
                "remote package has no metadata segment: {}",
                sanitize_url_for_logging(&self.url)
            ))
        })
    }

    async fn resolve_chunk_url(&self, _client: &Client) -> Result<String> {
        Ok(self.url.clone())
    }
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct SessionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<(String, String)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

/// Session-based resolver: POST the endpoint, solve the returned
/// challenge when present, then reuse the issued package URL until the
/// session ends.
pub struct SessionSource {
    endpoint: String,
    extras: Option<String>,
    resolved: Mutex<Option<String>>,
}

impl SessionSource {
    pub fn new(endpoint: String, extras: Option<String>) -> Self {
        Self {
            endpoint,
            extras,
            resolved: Mutex::new(None),
        }
    }

    async fn request(&self, client: &Client, sid: Option<&str>) -> Result<SessionResponse> {
        let url = match sid {
            Some(sid) => format!("{}?sid={sid}", self.endpoint),
            None => self.endpoint.clone(),
        };
        let res = client
            .post(&url)
            .body(self.extras.clone().unwrap_or_default())
            .send()
            .await?;
        let status = res.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::UNAUTHORIZED {
            let body = res.text().await.unwrap_or_default();
            return Err(InstallerError::Http(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                sanitize_url_for_logging(&self.endpoint),
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(res.json().await?)
    }

    async fn resolve(&self, client: &Client) -> Result<String> {
        let mut resolved = self.resolved.lock().await;
        if let Some(url) = resolved.as_ref() {
            return Ok(url.clone());
        }
        let first = self.request(client, None).await?;
        let answer = match first.challenge {
            None => first,
            Some(challenge) => {
                let sid = solve_challenge(&challenge)?;
                let second = self.request(client, Some(&sid)).await?;
                if second.challenge.is_some() {
                    return Err(InstallerError::Http(
                        "session challenge was not accepted".into(),
                    ));
                }
                second
            }
        };
        let url = answer.url.ok_or_else(|| {
            InstallerError::Http("session endpoint returned no package URL".into())
        })?;
        *resolved = Some(url.clone());
        Ok(url)
    }
}

#[async_trait]
impl UpdateSource for SessionSource {
    async fn resolve_metadata(&self, client: &Client) -> Result<Manifest> {
        let url = self.resolve(client).await?;
        let remote = RemotePackage::open(client, &url).await?;
        remote.parsed.manifest.ok_or_else(|| {
            InstallerError::Format("remote package has no metadata segment".into())
        })
    }

    async fn resolve_chunk_url(&self, client: &Client) -> Result<String> {
        self.resolve(client).await
    }

    async fn create_session(&self, client: &Client) -> Result<()> {
        self.resolve(client).await.map(|_| ())
    }

    async fn end_session(&self, client: &Client) -> Result<()> {
        let resolved = self.resolved.lock().await.take();
        if resolved.is_some() {
            let _ = client.delete(&self.endpoint).send().await;
        }
        Ok(())
    }
}

/// Challenge form: `[algo/]{digest}/{prefix}`. The session id is the prefix
/// plus a brute-forced two-hex-digit suffix whose digest matches. `web`
/// challenges need a browser and cannot be solved here.
pub fn solve_challenge(challenge: &str) -> Result<String> {
    let parts: Vec<&str> = challenge.split('/').collect();
    let (algo, digest, prefix) = match parts.as_slice() {
        [digest, prefix] => ("md5", *digest, *prefix),
        [algo, digest, prefix] => (*algo, *digest, *prefix),
        _ => {
            return Err(InstallerError::Http(format!(
                "invalid session challenge: {challenge}"
            )))
        }
    };
    if algo == "web" {
        return Err(InstallerError::Http(
            "this download source requires a browser sign-in".into(),
        ));
    }
    for i in 0u16..=255 {
        let candidate = format!("{prefix}{i:02x}");
        let hashed = match algo {
            "md5" => hex::encode(Md5::digest(candidate.as_bytes())),
            "sha256" => hex::encode(Sha256::digest(candidate.as_bytes())),
            other => {
                return Err(InstallerError::Http(format!(
                    "unsupported challenge algorithm: {other}"
                )))
            }
        };
        if hashed == digest {
            return Ok(candidate);
        }
    }
    Err(InstallerError::Http("session challenge unsolvable".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_md5_challenge() {
        let expected = "source5a";
        let digest = hex::encode(Md5::digest(expected.as_bytes()));
        assert_eq!(
            solve_challenge(&format!("{digest}/source")).unwrap(),
            expected
        );
        assert_eq!(
            solve_challenge(&format!("md5/{digest}/source")).unwrap(),
            expected
        );
    }

    #[test]
    fn solves_sha256_challenge() {
        let expected = "tokenff";
        let digest = hex::encode(Sha256::digest(expected.as_bytes()));
        assert_eq!(
            solve_challenge(&format!("sha256/{digest}/token")).unwrap(),
            expected
        );
    }

    #[test]
    fn web_challenge_is_surfaced() {
        let err = solve_challenge("web/abc/def").unwrap_err();
        assert!(err.to_string().contains("browser"));
    }

    #[test]
    fn unsolvable_challenge_errors() {
        let digest = hex::encode(Md5::digest(b"not-derivable"));
        assert!(solve_challenge(&format!("{digest}/other")).is_err());
        assert!(solve_challenge("justonepart").is_err());
    }

    #[test]
    fn scheme_prefix_selects_plugin() {
        assert!(source_for("https://cdn.example.com/pkg.exe", None).is_ok());
        assert!(source_for("session+https://api.example.com/session", None).is_ok());
        assert!(source_for("ftp://old.example.com/pkg", None).is_err());
    }
}
