use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::errors::{InstallerError, Result};
use crate::utils::url::sanitize_url_for_logging;

/// Whole-request ceiling for body transfers; header latency is bounded by
/// the client's connect timeout.
const BODY_TIMEOUT: Duration = Duration::from_secs(180);

pub fn build_client(user_agent: &str) -> Result<Client> {
    Ok(Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

fn status_error(url: &str, status: StatusCode) -> InstallerError {
    InstallerError::Http(format!(
        "HTTP {} from {}",
        status.as_u16(),
        sanitize_url_for_logging(url)
    ))
}

fn expect_partial(url: &str, status: StatusCode) -> Result<()> {
    if status == StatusCode::PARTIAL_CONTENT {
        return Ok(());
    }
    if status == StatusCode::OK {
        return Err(InstallerError::Http(format!(
            "server does not support range requests: {}",
            sanitize_url_for_logging(url)
        )));
    }
    Err(status_error(url, status))
}

/// `Content-Range: bytes <start>-<end>/<total>` → `(start, end, total)`.
pub fn parse_content_range(header: &str) -> Option<(u64, u64, u64)> {
    let rest = header.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
        total.trim().parse().ok()?,
    ))
}

fn content_range_of(res: &reqwest::Response) -> Option<(u64, u64, u64)> {
    res.headers()
        .get(reqwest::header::CONTENT_RANGE)?
        .to_str()
        .ok()
        .and_then(parse_content_range)
}

/// Discovery probe: the first 256 bytes plus the total package size taken
/// from `Content-Range`. Also serves as the range-support check.
pub async fn fetch_probe(client: &Client, url: &str) -> Result<(Vec<u8>, u64)> {
    let res = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-255")
        .timeout(BODY_TIMEOUT)
        .send()
        .await?;
    expect_partial(url, res.status())?;
    let total = content_range_of(&res)
        .map(|(_, _, total)| total)
        .ok_or_else(|| {
            InstallerError::Http(format!(
                "missing Content-Range from {}",
                sanitize_url_for_logging(url)
            ))
        })?;
    Ok((res.bytes().await?.to_vec(), total))
}

/// Fetch one absolute byte range fully into memory.
pub async fn fetch_range_bytes(client: &Client, url: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
    let res = client
        .get(url)
        .header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", offset, offset + size - 1),
        )
        .timeout(BODY_TIMEOUT)
        .send()
        .await?;
    expect_partial(url, res.status())?;
    let body = res.bytes().await?;
    if body.len() as u64 != size {
        return Err(InstallerError::Http(format!(
            "short range response: got {} of {} bytes from {}",
            body.len(),
            size,
            sanitize_url_for_logging(url)
        )));
    }
    Ok(body.to_vec())
}

/// Open one byte range as a streaming reader. `size == 0` requests the
/// whole resource.
pub async fn open_range_stream(
    client: &Client,
    url: &str,
    offset: u64,
    size: u64,
) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    let mut builder = client.get(url).timeout(BODY_TIMEOUT);
    let ranged = size > 0;
    if ranged {
        builder = builder.header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", offset, offset + size - 1),
        );
    }
    let res = builder.send().await?;
    if ranged {
        expect_partial(url, res.status())?;
    } else if res.status() != StatusCode::OK {
        return Err(status_error(url, res.status()));
    }
    let stream = res.bytes_stream().map_err(std::io::Error::other);
    Ok(Box::new(StreamReader::new(stream)))
}

/// One request carrying several ranges; the `multipart/byteranges` body is
/// parsed and parts are returned in the order of `spans`. Servers answering
/// a multi-range request with a single part are accepted when only one span
/// was asked for.
pub async fn fetch_multipart_ranges(
    client: &Client,
    url: &str,
    spans: &[(u64, u64)],
) -> Result<Vec<Vec<u8>>> {
    let ranges = spans
        .iter()
        .map(|(offset, size)| format!("{}-{}", offset, offset + size - 1))
        .collect::<Vec<_>>()
        .join(",");
    let res = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={ranges}"))
        .timeout(BODY_TIMEOUT)
        .send()
        .await?;
    expect_partial(url, res.status())?;

    let content_type = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = res.bytes().await?;

    if let Some(boundary) = multipart_boundary(&content_type) {
        return order_parts(parse_multipart_byteranges(&body, &boundary)?, spans, url);
    }
    // single-range answer to a single-span request
    if spans.len() == 1 {
        if body.len() as u64 == spans[0].1 {
            return Ok(vec![body.to_vec()]);
        }
        return Err(InstallerError::Http(format!(
            "short range response from {}",
            sanitize_url_for_logging(url)
        )));
    }
    Err(InstallerError::Http(format!(
        "expected multipart/byteranges, got {} from {}",
        content_type,
        sanitize_url_for_logging(url)
    )))
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let lowered = content_type.to_ascii_lowercase();
    if !lowered.starts_with("multipart/byteranges") {
        return None;
    }
    content_type.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key.eq_ignore_ascii_case("boundary")).then(|| value.trim_matches('"').to_string())
    })
}

/// Minimal RFC 7233 multipart body parse: for each part, headers up to the
/// blank line, then content until the next boundary marker.
fn parse_multipart_byteranges(body: &[u8], boundary: &str) -> Result<Vec<(u64, Vec<u8>)>> {
    let delimiter = format!("--{boundary}");
    let malformed = || InstallerError::Http("malformed multipart/byteranges body".into());
    let mut parts = Vec::new();
    let mut at = find_bytes(body, 0, delimiter.as_bytes()).ok_or_else(malformed)?;
    loop {
        at += delimiter.len();
        if body[at..].starts_with(b"--") {
            break;
        }
        let headers_start = skip_crlf(body, at);
        let headers_end = find_bytes(body, headers_start, b"\r\n\r\n").ok_or_else(malformed)?;
        let headers = String::from_utf8_lossy(&body[headers_start..headers_end]);
        let range = headers
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.trim()
                    .eq_ignore_ascii_case("content-range")
                    .then(|| value.trim().to_string())
            })
            .and_then(|v| parse_content_range(&v))
            .ok_or_else(malformed)?;
        let content_start = headers_end + 4;
        let next = find_bytes(body, content_start, delimiter.as_bytes()).ok_or_else(malformed)?;
        // content is followed by CRLF before the next delimiter
        let content_end = next.saturating_sub(2).max(content_start);
        parts.push((range.0, body[content_start..content_end].to_vec()));
        at = next;
    }
    Ok(parts)
}

fn order_parts(
    parts: Vec<(u64, Vec<u8>)>,
    spans: &[(u64, u64)],
    url: &str,
) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(spans.len());
    for (offset, size) in spans {
        let part = parts
            .iter()
            .find(|(start, data)| start == offset && data.len() as u64 == *size)
            .ok_or_else(|| {
                InstallerError::Http(format!(
                    "multipart response missing range {offset}+{size} from {}",
                    sanitize_url_for_logging(url)
                ))
            })?;
        out.push(part.1.clone());
    }
    Ok(out)
}

fn find_bytes(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn skip_crlf(body: &[u8], mut at: usize) -> usize {
    while body[at..].starts_with(b"\r\n") {
        at += 2;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parsing() {
        assert_eq!(
            parse_content_range("bytes 0-255/8192"),
            Some((0, 255, 8192))
        );
        assert_eq!(parse_content_range("bytes */8192"), None);
        assert_eq!(parse_content_range("items 0-255/8192"), None);
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=SEP"),
            Some("SEP".into())
        );
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=\"quoted\""),
            Some("quoted".into())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }

    #[test]
    fn multipart_body_parsing() {
        let body = b"\r\n--SEP\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 0-4/100\r\n\r\nhello\r\n--SEP\r\nContent-Range: bytes 10-12/100\r\n\r\nxyz\r\n--SEP--\r\n";
        let parts = parse_multipart_byteranges(body, "SEP").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], (0, b"hello".to_vec()));
        assert_eq!(parts[1], (10, b"xyz".to_vec()));

        let ordered = order_parts(parts, &[(10, 3), (0, 5)], "http://x/").unwrap();
        assert_eq!(ordered[0], b"xyz");
        assert_eq!(ordered[1], b"hello");
    }

    #[test]
    fn multipart_rejects_missing_content_range() {
        let body = b"--SEP\r\nContent-Type: text/plain\r\n\r\nhello\r\n--SEP--";
        assert!(parse_multipart_byteranges(body, "SEP").is_err());
    }
}
